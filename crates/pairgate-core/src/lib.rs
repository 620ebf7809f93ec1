//! pairgate core - pairing request lifecycle and trust issuance.
//!
//! This crate implements:
//! - The pairing request store and its state machine
//! - The durable trust ledger (SQLite and in-memory backends)
//! - The pairing service that orchestrates list, approve, and dismiss
//! - Audit event generation for the pairing lifecycle

#![forbid(unsafe_code)]

// Core state machine
pub mod request_store;
pub mod service;

// Infrastructure
pub mod ledger;
pub mod audit;

// Supporting modules
pub mod errors;
pub mod types;

pub use errors::PairingError;
pub use ledger::{GrantOutcome, MemoryLedger, SqliteLedger, TrustLedger};
pub use request_store::{RequestStore, StoreConfig};
pub use service::{ApproveOutcome, DismissOutcome, PairingService, RequestSummary, StatusOutcome};
pub use types::{
    ClientIdentity, Clock, ManualClock, PairingAttempt, PairingRequest, RequestId, RequestStatus,
    SystemClock, TrustedClient,
};
