//! Error types for pairgate core.
//!
//! `NotFound` and the "not pending" family are expected outcomes of polling
//! clients and are folded into `ok=false` results by the service. The
//! remaining variants mean the daemon cannot safely proceed.

use thiserror::Error;

use crate::types::RequestStatus;

/// Errors from the trust ledger backends.
#[derive(Debug, Error, Clone)]
pub enum LedgerError {
    #[error("ledger storage failed: {0}")]
    Storage(String),

    #[error("ledger record corrupted: {0}")]
    Corrupted(String),
}

/// Unified error type for pairing operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// Unknown request id
    #[error("pairing request not found")]
    NotFound,

    /// Status change not permitted from the current state
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Too many pending requests
    #[error("too many pending pairing requests (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// Durable trust write failed
    #[error("trust ledger write failed: {0}")]
    LedgerWriteFailure(String),

    /// Malformed request id at the boundary
    #[error("invalid request id: {0}")]
    InvalidRequestId(String),

    /// Malformed client identity at the boundary
    #[error("invalid client identity: {0}")]
    InvalidIdentity(String),

    /// The OS random source failed while minting an id
    #[error("randomness unavailable: {0}")]
    RandomnessUnavailable(String),
}

impl PairingError {
    /// True for errors that indicate the daemon cannot safely proceed and must
    /// surface as a server failure rather than a structured `ok=false` reply.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PairingError::CapacityExceeded { .. }
                | PairingError::LedgerWriteFailure(_)
                | PairingError::RandomnessUnavailable(_)
        )
    }

    /// True for malformed caller input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PairingError::InvalidRequestId(_) | PairingError::InvalidIdentity(_)
        )
    }

    /// Stable snake_case code for wire error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PairingError::NotFound => "unknown_request_id",
            PairingError::InvalidTransition { .. } => "invalid_transition",
            PairingError::CapacityExceeded { .. } => "capacity_exceeded",
            PairingError::LedgerWriteFailure(_) => "ledger_write_failure",
            PairingError::InvalidRequestId(_) => "invalid_request_id",
            PairingError::InvalidIdentity(_) => "invalid_identity",
            PairingError::RandomnessUnavailable(_) => "internal_error",
        }
    }
}

impl From<LedgerError> for PairingError {
    fn from(err: LedgerError) -> Self {
        PairingError::LedgerWriteFailure(err.to_string())
    }
}
