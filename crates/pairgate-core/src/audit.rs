//! Audit events for the pairing lifecycle.
//!
//! Features:
//! - One event per lifecycle step (admission, resolution, expiry, grant)
//! - Pluggable sinks (memory buffer, append-only file, tracing)
//! - Sink failures are reported to the caller, who logs and moves on

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::info;

use crate::types::{ClientIdentity, RequestId, RequestStatus};

/// Errors from audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    IoError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::IoError(e.to_string())
    }
}

/// Audit events for the pairing lifecycle.
///
/// Events carry identities and addresses only; no credential material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    RequestAdmitted {
        request_id: RequestId,
        client_identity: ClientIdentity,
        client_ip: Option<String>,
        timestamp: u64,
    },
    RequestApproved {
        request_id: RequestId,
        client_identity: ClientIdentity,
        timestamp: u64,
    },
    RequestDismissed {
        request_id: RequestId,
        timestamp: u64,
    },
    RequestExpired {
        request_id: RequestId,
        timestamp: u64,
    },
    TrustGranted {
        request_id: RequestId,
        client_identity: ClientIdentity,
        newly_granted: bool,
        timestamp: u64,
    },
    /// Trust was granted but the request was resolved another way first.
    ApprovalRaceLost {
        request_id: RequestId,
        client_identity: ClientIdentity,
        final_status: RequestStatus,
        timestamp: u64,
    },
}

impl AuditEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            AuditEvent::RequestAdmitted { timestamp, .. } => *timestamp,
            AuditEvent::RequestApproved { timestamp, .. } => *timestamp,
            AuditEvent::RequestDismissed { timestamp, .. } => *timestamp,
            AuditEvent::RequestExpired { timestamp, .. } => *timestamp,
            AuditEvent::TrustGranted { timestamp, .. } => *timestamp,
            AuditEvent::ApprovalRaceLost { timestamp, .. } => *timestamp,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            AuditEvent::RequestAdmitted { request_id, .. } => request_id,
            AuditEvent::RequestApproved { request_id, .. } => request_id,
            AuditEvent::RequestDismissed { request_id, .. } => request_id,
            AuditEvent::RequestExpired { request_id, .. } => request_id,
            AuditEvent::TrustGranted { request_id, .. } => request_id,
            AuditEvent::ApprovalRaceLost { request_id, .. } => request_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            AuditEvent::RequestAdmitted { .. } => "REQUEST_ADMITTED",
            AuditEvent::RequestApproved { .. } => "REQUEST_APPROVED",
            AuditEvent::RequestDismissed { .. } => "REQUEST_DISMISSED",
            AuditEvent::RequestExpired { .. } => "REQUEST_EXPIRED",
            AuditEvent::TrustGranted { .. } => "TRUST_GRANTED",
            AuditEvent::ApprovalRaceLost { .. } => "APPROVAL_RACE_LOST",
        }
    }

    /// Human-readable log line.
    pub fn to_log_line(&self) -> String {
        let prefix = format!("[{}] {} request={}", self.timestamp(), self.event_type(), self.request_id());
        match self {
            AuditEvent::RequestAdmitted { client_identity, client_ip, .. } => format!(
                "{} client=\"{}\" ip={}",
                prefix,
                client_identity,
                client_ip.as_deref().unwrap_or("unknown")
            ),
            AuditEvent::RequestApproved { client_identity, .. } => {
                format!("{} client=\"{}\"", prefix, client_identity)
            }
            AuditEvent::TrustGranted { client_identity, newly_granted, .. } => format!(
                "{} client=\"{}\" new={}",
                prefix, client_identity, newly_granted
            ),
            AuditEvent::ApprovalRaceLost { client_identity, final_status, .. } => format!(
                "{} client=\"{}\" status={}",
                prefix, client_identity, final_status
            ),
            AuditEvent::RequestDismissed { .. } | AuditEvent::RequestExpired { .. } => prefix,
        }
    }
}

/// Trait for audit event sinks.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Bounded in-memory sink; drops the oldest event when full.
///
/// Always keeps at least the most recent event.
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: RwLock<VecDeque<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    pub fn new(max_events: usize) -> Self {
        let max_events = max_events.max(1);
        Self {
            events: RwLock::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().await;
        while events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

/// Append-only file sink writing one JSON object per line.
#[derive(Debug)]
pub struct FileAuditSink {
    path: std::path::PathBuf,
}

impl FileAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn append_line(&self, line: &str) -> Result<(), AuditError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(&event)
            .map_err(|e| AuditError::SerializationError(e.to_string()))?;
        self.append_line(&line).await
    }
}

/// Sink that forwards events to `tracing` under the `pairgate::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        info!(target: "pairgate::audit", event_type = event.event_type(), "{}", event.to_log_line());
        Ok(())
    }
}
