//! Pairing request store.
//!
//! Holds every pairing request from admission until garbage collection and
//! enforces the request state machine:
//!
//! ```text
//! pending ──approve──▶ approved
//!    │  └────dismiss──▶ dismissed
//!    └──────ttl───────▶ expired
//! ```
//!
//! Requests live in a sharded map, so a status change only locks the shard
//! holding that request. Expiry is applied lazily on every read and by the
//! periodic [`RequestStore::sweep`]. Every expiry, whichever path caused it,
//! is also queued for [`RequestStore::take_expired`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::PairingError;
use crate::types::{PairingAttempt, PairingRequest, RequestId, RequestStatus, DEFAULT_REQUEST_MESSAGE};

/// Request store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a request may stay pending before it expires.
    pub request_ttl: Duration,
    /// Maximum number of simultaneously pending requests.
    pub max_pending: usize,
    /// How long terminal requests are kept before collection.
    pub retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            request_ttl: Duration::from_secs(600), // 10 minutes
            max_pending: 32,
            retention: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Outcome of a sweep pass.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Requests that moved from pending to expired during this pass
    pub expired: Vec<PairingRequest>,
    /// Number of terminal requests removed from the store
    pub collected: usize,
}

struct Slot {
    request: PairingRequest,
    /// Serializes approvals of this request across callers
    approval_gate: Arc<Mutex<()>>,
}

/// Thread-safe store of pairing requests.
pub struct RequestStore {
    requests: DashMap<RequestId, Slot>,
    /// Requests expired since the last `take_expired`
    expired_outbox: DashMap<RequestId, PairingRequest>,
    next_sequence: AtomicU64,
    pending: AtomicUsize,
    config: StoreConfig,
}

impl RequestStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            requests: DashMap::new(),
            expired_outbox: DashMap::new(),
            next_sequence: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create a new pending request.
    ///
    /// Overdue requests are expired first so stale entries never hold capacity.
    /// The capacity check and the reservation are a single atomic update.
    pub fn admit(&self, attempt: PairingAttempt, now: u64) -> Result<RequestId, PairingError> {
        self.expire_overdue(now);

        let limit = self.config.max_pending;
        if self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < limit {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_err()
        {
            warn!(
                client_identity = %attempt.client_identity,
                limit,
                "Rejecting pairing request: pending capacity reached"
            );
            return Err(PairingError::CapacityExceeded { limit });
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let request_id = match RequestId::generate(sequence) {
            Ok(id) => id,
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let request = PairingRequest {
            request_id,
            client_ip: attempt.client_ip,
            client_identity: attempt.client_identity,
            message: attempt
                .message
                .unwrap_or_else(|| DEFAULT_REQUEST_MESSAGE.to_string()),
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            sequence,
        };

        debug!(request_id = %request_id, sequence, "Admitted pairing request");
        self.requests.insert(
            request_id,
            Slot {
                request,
                approval_gate: Arc::new(Mutex::new(())),
            },
        );

        Ok(request_id)
    }

    /// Pending requests, oldest first.
    ///
    /// Requests that crossed the expiry threshold are moved to `expired` and
    /// left out of the result.
    pub fn list_pending(&self, now: u64) -> Vec<PairingRequest> {
        self.expire_overdue(now);

        let mut pending: Vec<PairingRequest> = self
            .requests
            .iter()
            .filter(|slot| slot.request.is_pending())
            .map(|slot| slot.request.clone())
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.sequence));
        pending
    }

    /// Look up a request, applying lazy expiry.
    pub fn get(&self, request_id: &RequestId, now: u64) -> Result<PairingRequest, PairingError> {
        let mut slot = self
            .requests
            .get_mut(request_id)
            .ok_or(PairingError::NotFound)?;
        self.expire_in_place(&mut slot.request, now);
        Ok(slot.request.clone())
    }

    /// Atomically move a pending request to `approved` or `dismissed`.
    ///
    /// Check and update happen under the request's shard lock, so of two
    /// racing transitions exactly one succeeds.
    pub fn transition(
        &self,
        request_id: &RequestId,
        to: RequestStatus,
        now: u64,
    ) -> Result<PairingRequest, PairingError> {
        let mut slot = self
            .requests
            .get_mut(request_id)
            .ok_or(PairingError::NotFound)?;
        self.expire_in_place(&mut slot.request, now);

        let from = slot.request.status;
        if from != RequestStatus::Pending
            || !matches!(to, RequestStatus::Approved | RequestStatus::Dismissed)
        {
            return Err(PairingError::InvalidTransition { from, to });
        }

        slot.request.status = to;
        slot.request.updated_at = now;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        info!(request_id = %request_id, status = %to, "Pairing request resolved");
        Ok(slot.request.clone())
    }

    /// Gate used to serialize approvals of one request.
    pub fn approval_gate(&self, request_id: &RequestId) -> Result<Arc<Mutex<()>>, PairingError> {
        self.requests
            .get(request_id)
            .map(|slot| slot.approval_gate.clone())
            .ok_or(PairingError::NotFound)
    }

    /// Expire every overdue pending request. Returns the newly expired ones.
    pub fn expire_overdue(&self, now: u64) -> Vec<PairingRequest> {
        let ttl = self.config.request_ttl.as_secs();
        let overdue: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|slot| slot.request.is_overdue(now, ttl))
            .map(|slot| *slot.key())
            .collect();

        let mut expired = Vec::new();
        for request_id in overdue {
            if let Some(mut slot) = self.requests.get_mut(&request_id) {
                if self.expire_in_place(&mut slot.request, now) {
                    expired.push(slot.request.clone());
                }
            }
        }
        expired
    }

    /// Drain the requests expired since the previous call.
    ///
    /// Each expiry is handed out exactly once, even with concurrent callers.
    pub fn take_expired(&self) -> Vec<PairingRequest> {
        let ids: Vec<RequestId> = self.expired_outbox.iter().map(|e| *e.key()).collect();
        let mut expired: Vec<PairingRequest> = ids
            .into_iter()
            .filter_map(|id| self.expired_outbox.remove(&id).map(|(_, request)| request))
            .collect();
        expired.sort_by_key(|r| (r.updated_at, r.sequence));
        expired
    }

    /// Expire overdue requests and drop terminal ones past retention.
    pub fn sweep(&self, now: u64) -> SweepReport {
        let expired = self.expire_overdue(now);
        let retention = self.config.retention.as_secs();

        let before = self.requests.len();
        self.requests.retain(|_, slot| {
            !slot.request.status.is_terminal()
                || now.saturating_sub(slot.request.updated_at) < retention
        });
        let collected = before.saturating_sub(self.requests.len());

        if !expired.is_empty() || collected > 0 {
            info!(
                expired = expired.len(),
                collected,
                "Swept pairing requests"
            );
        }

        SweepReport { expired, collected }
    }

    /// Number of requests currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of requests held, terminal ones included.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Move a request to `expired` if it is overdue. Must be called with the
    /// slot's shard lock held.
    fn expire_in_place(&self, request: &mut PairingRequest, now: u64) -> bool {
        if !request.is_overdue(now, self.config.request_ttl.as_secs()) {
            return false;
        }
        request.status = RequestStatus::Expired;
        request.updated_at = now;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.expired_outbox.insert(request.request_id, request.clone());
        info!(request_id = %request.request_id, "Pairing request expired");
        true
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
