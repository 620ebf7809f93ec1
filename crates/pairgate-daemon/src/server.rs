//! Pairing daemon server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::Router;
use pairgate_core::audit::{AuditSink, FileAuditSink, TracingAuditSink};
use pairgate_core::{MemoryLedger, PairingService, RequestStore, SqliteLedger, TrustLedger};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{create_router, ApiState};
use crate::config::DaemonConfig;

/// Largest request body the API accepts.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Router with the full middleware stack applied.
pub fn build_app(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    create_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
    )
}

/// Pairing daemon
pub struct PairingDaemon {
    config: DaemonConfig,
    service: PairingService,
}

impl PairingDaemon {
    /// Create the daemon: open the ledger and wire up the service
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let ledger: Arc<dyn TrustLedger> = if config.uses_memory_ledger() {
            warn!("Using in-memory trust ledger; grants will not survive a restart");
            Arc::new(MemoryLedger::new())
        } else {
            info!(path = %config.ledger_path.display(), "Opening trust ledger");
            Arc::new(SqliteLedger::open(&config.ledger_path)?)
        };

        let audit: Arc<dyn AuditSink> = match &config.audit_log_path {
            Some(path) => {
                info!(path = %path.display(), "Writing audit events to file");
                Arc::new(FileAuditSink::new(path))
            }
            None => Arc::new(TracingAuditSink),
        };

        let store = Arc::new(RequestStore::new(config.store_config()));
        let service = PairingService::new(store, ledger).with_audit_sink(audit);

        Ok(Self { config, service })
    }

    pub fn service(&self) -> &PairingService {
        &self.service
    }

    pub fn router(&self) -> Router {
        build_app(ApiState {
            service: self.service.clone(),
        })
    }

    /// Run the daemon until ctrl-c
    pub async fn run(&self) -> Result<()> {
        info!("Starting pairing daemon on {}", self.config.listen_addr);

        let app = self.router();

        // Start sweep task
        let service = self.service.clone();
        let sweep_interval = self.config.sweep_interval();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                service.sweep().await;
            }
        });

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        info!("HTTP server listening on {}", self.config.listen_addr);

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        sweeper.abort();
        served?;

        info!("Pairing daemon stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
