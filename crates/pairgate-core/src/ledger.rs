//! Trust ledger: the durable set of trusted clients.
//!
//! The ledger is append-only. Granting an identity that is already trusted is
//! a no-op that returns the existing record untouched.
//!
//! Two backends are provided:
//! - [`SqliteLedger`] for the daemon; every grant is one SQLite transaction, so
//!   a crash before commit leaves the client untrusted.
//! - [`MemoryLedger`] for tests and ephemeral runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::errors::LedgerError;
use crate::types::{ClientIdentity, RequestId, TrustedClient};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Result of a grant call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantOutcome {
    /// False when the identity was already trusted
    pub newly_granted: bool,
    /// The stored record (the first one on re-grant)
    pub client: TrustedClient,
}

/// Durable set of trusted clients.
#[async_trait]
pub trait TrustLedger: Send + Sync {
    /// Trust an identity. Idempotent: an existing record is returned as-is.
    async fn grant(
        &self,
        identity: &ClientIdentity,
        request_id: &RequestId,
        now: u64,
    ) -> Result<GrantOutcome, LedgerError>;

    /// Check whether an identity is trusted.
    async fn is_trusted(&self, identity: &ClientIdentity) -> Result<bool, LedgerError>;

    /// Fetch the record for an identity.
    async fn get(&self, identity: &ClientIdentity) -> Result<Option<TrustedClient>, LedgerError>;

    /// All trusted clients, oldest grant first.
    async fn list(&self) -> Result<Vec<TrustedClient>, LedgerError>;
}

// ============================================================================
// In-Memory Ledger
// ============================================================================

/// In-memory ledger. Nothing survives a restart.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    clients: Arc<RwLock<HashMap<ClientIdentity, TrustedClient>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrustLedger for MemoryLedger {
    async fn grant(
        &self,
        identity: &ClientIdentity,
        request_id: &RequestId,
        now: u64,
    ) -> Result<GrantOutcome, LedgerError> {
        let mut clients = self.clients.write().await;
        if let Some(existing) = clients.get(identity) {
            return Ok(GrantOutcome {
                newly_granted: false,
                client: existing.clone(),
            });
        }

        let client = TrustedClient {
            client_id: identity.clone(),
            granted_at: now,
            request_id: *request_id,
        };
        clients.insert(identity.clone(), client.clone());
        Ok(GrantOutcome {
            newly_granted: true,
            client,
        })
    }

    async fn is_trusted(&self, identity: &ClientIdentity) -> Result<bool, LedgerError> {
        Ok(self.clients.read().await.contains_key(identity))
    }

    async fn get(&self, identity: &ClientIdentity) -> Result<Option<TrustedClient>, LedgerError> {
        Ok(self.clients.read().await.get(identity).cloned())
    }

    async fn list(&self) -> Result<Vec<TrustedClient>, LedgerError> {
        let mut clients: Vec<TrustedClient> = self.clients.read().await.values().cloned().collect();
        clients.sort_by(|a, b| {
            a.granted_at
                .cmp(&b.granted_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        Ok(clients)
    }
}

// ============================================================================
// SQLite Ledger
// ============================================================================

/// SQLite-backed ledger.
///
/// Runs in WAL mode with `synchronous=FULL`; a grant reports success only after
/// its transaction has committed.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (or create) a ledger database at `path` and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)
            .map_err(|e| LedgerError::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| LedgerError::Storage(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory SQLite ledger, mostly for tests.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            LedgerError::Storage(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| LedgerError::Storage(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| LedgerError::Storage(format!("failed to read schema version: {}", e)))?;

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        debug!(version = SCHEMA_VERSION, "Trust ledger schema ready");
        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS trusted_clients (
                client_id TEXT PRIMARY KEY,
                granted_at INTEGER NOT NULL,
                request_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trusted_granted ON trusted_clients(granted_at);
            INSERT INTO schema_version (version) VALUES (1);
            COMMIT;
            "#,
        )
        .map_err(|e| LedgerError::Storage(format!("migration v1 failed: {}", e)))?;
        Ok(())
    }

    fn row_to_client(
        client_id: String,
        granted_at: i64,
        request_id: String,
    ) -> Result<TrustedClient, LedgerError> {
        let client_id = ClientIdentity::parse(&client_id)
            .map_err(|e| LedgerError::Corrupted(format!("client_id: {}", e)))?;
        let request_id = RequestId::parse(&request_id)
            .map_err(|e| LedgerError::Corrupted(format!("request_id: {}", e)))?;
        let granted_at = u64::try_from(granted_at)
            .map_err(|_| LedgerError::Corrupted(format!("granted_at: {}", granted_at)))?;
        Ok(TrustedClient {
            client_id,
            granted_at,
            request_id,
        })
    }

    fn load(conn: &Connection, identity: &ClientIdentity) -> Result<Option<TrustedClient>, LedgerError> {
        let row = conn
            .query_row(
                "SELECT client_id, granted_at, request_id FROM trusted_clients WHERE client_id = ?1",
                params![identity.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| LedgerError::Storage(format!("failed to load client: {}", e)))?;

        row.map(|(client_id, granted_at, request_id)| {
            Self::row_to_client(client_id, granted_at, request_id)
        })
        .transpose()
    }
}

#[async_trait]
impl TrustLedger for SqliteLedger {
    async fn grant(
        &self,
        identity: &ClientIdentity,
        request_id: &RequestId,
        now: u64,
    ) -> Result<GrantOutcome, LedgerError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::Storage(format!("failed to begin grant: {}", e)))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO trusted_clients (client_id, granted_at, request_id)
                 VALUES (?1, ?2, ?3)",
                params![identity.as_str(), now as i64, request_id.to_string()],
            )
            .map_err(|e| LedgerError::Storage(format!("failed to write grant: {}", e)))?;

        let client = Self::load(&tx, identity)?.ok_or_else(|| {
            LedgerError::Storage("grant not visible inside its own transaction".to_string())
        })?;

        tx.commit()
            .map_err(|e| LedgerError::Storage(format!("failed to commit grant: {}", e)))?;

        let newly_granted = inserted == 1;
        if newly_granted {
            info!(client_identity = %identity, request_id = %request_id, "Trust granted");
        }
        Ok(GrantOutcome {
            newly_granted,
            client,
        })
    }

    async fn is_trusted(&self, identity: &ClientIdentity) -> Result<bool, LedgerError> {
        Ok(self.get(identity).await?.is_some())
    }

    async fn get(&self, identity: &ClientIdentity) -> Result<Option<TrustedClient>, LedgerError> {
        let conn = self.conn.lock().await;
        Self::load(&conn, identity)
    }

    async fn list(&self) -> Result<Vec<TrustedClient>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT client_id, granted_at, request_id FROM trusted_clients
                 ORDER BY granted_at ASC, client_id ASC",
            )
            .map_err(|e| LedgerError::Storage(format!("failed to prepare list: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| LedgerError::Storage(format!("failed to list clients: {}", e)))?;

        let mut clients = Vec::new();
        for row in rows {
            let (client_id, granted_at, request_id) =
                row.map_err(|e| LedgerError::Storage(format!("failed to read row: {}", e)))?;
            clients.push(Self::row_to_client(client_id, granted_at, request_id)?);
        }
        Ok(clients)
    }
}
