//! Pairing service: the operations behind the operator's polling endpoints.
//!
//! `NotFound` and "already resolved" are reported as outcomes with
//! `ok() == false`; only failures that stop the daemon from proceeding safely
//! (capacity, ledger writes) come back as `Err`.
//!
//! Approvals of the same request are serialized on the request's approval
//! gate, so only one caller ever reaches the ledger for a given request.
//! Dismissal needs no gate: the store's compare-and-set picks the winner.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::errors::PairingError;
use crate::ledger::TrustLedger;
use crate::request_store::{RequestStore, SweepReport};
use crate::types::{
    ClientIdentity, Clock, PairingAttempt, PairingRequest, RequestId, RequestStatus, SystemClock,
    TrustedClient,
};

/// One row of the pending-requests listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    pub request_id: RequestId,
    pub client_ip: Option<String>,
    pub client_identity: ClientIdentity,
    pub message: String,
    pub status: RequestStatus,
    pub age_secs: u64,
}

impl RequestSummary {
    fn from_request(request: PairingRequest, now: u64) -> Self {
        let age_secs = request.age_secs(now);
        Self {
            request_id: request.request_id,
            client_ip: request.client_ip,
            client_identity: request.client_identity,
            message: request.message,
            status: request.status,
            age_secs,
        }
    }
}

/// Result of an approval attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApproveOutcome {
    /// The request moved to approved and the client is trusted.
    Approved {
        client: TrustedClient,
        newly_granted: bool,
    },
    /// The request was no longer pending when the approval ran.
    AlreadyResolved(RequestStatus),
    /// Trust was granted, then a concurrent dismiss or expiry resolved the
    /// request first. The grant stands; `status` is the request's real status.
    RaceLost {
        status: RequestStatus,
        client: TrustedClient,
    },
    /// Unknown request id.
    NotFound,
}

impl ApproveOutcome {
    pub fn ok(&self) -> bool {
        matches!(self, ApproveOutcome::Approved { .. })
    }

    /// Status of the request after the call, if the request is known.
    pub fn status(&self) -> Option<RequestStatus> {
        match self {
            ApproveOutcome::Approved { .. } => Some(RequestStatus::Approved),
            ApproveOutcome::AlreadyResolved(status) => Some(*status),
            ApproveOutcome::RaceLost { status, .. } => Some(*status),
            ApproveOutcome::NotFound => None,
        }
    }
}

/// Result of a dismissal. Every variant counts as satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissOutcome {
    Dismissed,
    AlreadyResolved(RequestStatus),
    NotFound,
}

impl DismissOutcome {
    /// Dismissal is idempotent: retries after a lost response still succeed.
    pub fn ok(&self) -> bool {
        true
    }

    pub fn status(&self) -> Option<RequestStatus> {
        match self {
            DismissOutcome::Dismissed => Some(RequestStatus::Dismissed),
            DismissOutcome::AlreadyResolved(status) => Some(*status),
            DismissOutcome::NotFound => None,
        }
    }
}

/// Result of a status lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Found(PairingRequest),
    NotFound,
}

/// Orchestrates the request store and the trust ledger.
#[derive(Clone)]
pub struct PairingService {
    store: Arc<RequestStore>,
    ledger: Arc<dyn TrustLedger>,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl PairingService {
    pub fn new(store: Arc<RequestStore>, ledger: Arc<dyn TrustLedger>) -> Self {
        Self {
            store,
            ledger,
            clock: Arc::new(SystemClock),
            audit: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Register an inbound pairing attempt.
    pub async fn admit(&self, attempt: PairingAttempt) -> Result<RequestId, PairingError> {
        let now = self.clock.now();
        let client_identity = attempt.client_identity.clone();
        let client_ip = attempt.client_ip.clone();

        let admitted = self.store.admit(attempt, now);
        self.record_expiries().await;
        let request_id = admitted?;
        info!(
            request_id = %request_id,
            client_identity = %client_identity,
            client_ip = client_ip.as_deref().unwrap_or("unknown"),
            "Pairing request admitted"
        );

        self.record(AuditEvent::RequestAdmitted {
            request_id,
            client_identity,
            client_ip,
            timestamp: now,
        })
        .await;
        Ok(request_id)
    }

    /// Pending requests, oldest first.
    pub async fn list_requests(&self) -> Vec<RequestSummary> {
        let now = self.clock.now();
        let pending = self.store.list_pending(now);
        self.record_expiries().await;

        pending
            .into_iter()
            .map(|request| RequestSummary::from_request(request, now))
            .collect()
    }

    /// Approve a pending request and trust its client.
    pub async fn approve(&self, request_id: &RequestId) -> Result<ApproveOutcome, PairingError> {
        let gate = match self.store.approval_gate(request_id) {
            Ok(gate) => gate,
            Err(PairingError::NotFound) => return Ok(ApproveOutcome::NotFound),
            Err(e) => return Err(e),
        };
        let _guard = gate.lock().await;

        // One timestamp for the whole approval
        let now = self.clock.now();
        let looked_up = self.store.get(request_id, now);
        self.record_expiries().await;
        let request = match looked_up {
            Ok(request) => request,
            Err(PairingError::NotFound) => return Ok(ApproveOutcome::NotFound),
            Err(e) => return Err(e),
        };
        if !request.is_pending() {
            debug!(request_id = %request_id, status = %request.status, "Approve on resolved request");
            return Ok(ApproveOutcome::AlreadyResolved(request.status));
        }

        let grant = self
            .ledger
            .grant(&request.client_identity, request_id, now)
            .await
            .map_err(|e| {
                error!(
                    request_id = %request_id,
                    client_identity = %request.client_identity,
                    error = %e,
                    "Trust ledger write failed; request left pending"
                );
                PairingError::from(e)
            })?;

        self.record(AuditEvent::TrustGranted {
            request_id: *request_id,
            client_identity: request.client_identity.clone(),
            newly_granted: grant.newly_granted,
            timestamp: now,
        })
        .await;

        let transitioned = self.store.transition(request_id, RequestStatus::Approved, now);
        self.record_expiries().await;
        match transitioned {
            Ok(_) => {
                self.record(AuditEvent::RequestApproved {
                    request_id: *request_id,
                    client_identity: request.client_identity,
                    timestamp: now,
                })
                .await;
                Ok(ApproveOutcome::Approved {
                    client: grant.client,
                    newly_granted: grant.newly_granted,
                })
            }
            Err(PairingError::InvalidTransition { from, .. }) => {
                warn!(
                    request_id = %request_id,
                    status = %from,
                    "Request resolved during approval; trust grant stands"
                );
                self.record(AuditEvent::ApprovalRaceLost {
                    request_id: *request_id,
                    client_identity: request.client_identity,
                    final_status: from,
                    timestamp: now,
                })
                .await;
                Ok(ApproveOutcome::RaceLost {
                    status: from,
                    client: grant.client,
                })
            }
            Err(PairingError::NotFound) => Ok(ApproveOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Dismiss a request. Unknown and already resolved requests count as done.
    pub async fn dismiss(&self, request_id: &RequestId) -> Result<DismissOutcome, PairingError> {
        let now = self.clock.now();
        let transitioned = self.store.transition(request_id, RequestStatus::Dismissed, now);
        self.record_expiries().await;
        match transitioned {
            Ok(_) => {
                self.record(AuditEvent::RequestDismissed {
                    request_id: *request_id,
                    timestamp: now,
                })
                .await;
                Ok(DismissOutcome::Dismissed)
            }
            Err(PairingError::InvalidTransition { from, .. }) => {
                debug!(request_id = %request_id, status = %from, "Dismiss on resolved request");
                Ok(DismissOutcome::AlreadyResolved(from))
            }
            Err(PairingError::NotFound) => Ok(DismissOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Current state of a single request.
    pub async fn status(&self, request_id: &RequestId) -> StatusOutcome {
        let looked_up = self.store.get(request_id, self.clock.now());
        self.record_expiries().await;
        match looked_up {
            Ok(request) => StatusOutcome::Found(request),
            Err(_) => StatusOutcome::NotFound,
        }
    }

    pub async fn is_trusted(&self, identity: &ClientIdentity) -> Result<bool, PairingError> {
        Ok(self.ledger.is_trusted(identity).await?)
    }

    pub async fn trusted_clients(&self) -> Result<Vec<TrustedClient>, PairingError> {
        Ok(self.ledger.list().await?)
    }

    /// Expire overdue requests and collect old terminal ones.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let report = self.store.sweep(now);
        self.record_expiries().await;
        report
    }

    /// Audit every expiry the store performed, on whichever path it happened.
    async fn record_expiries(&self) {
        for expired in self.store.take_expired() {
            self.record(AuditEvent::RequestExpired {
                request_id: expired.request_id,
                timestamp: expired.updated_at,
            })
            .await;
        }
    }

    async fn record(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            if let Err(e) = sink.emit(event).await {
                warn!(error = %e, "Failed to record audit event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::errors::LedgerError;
    use crate::ledger::{GrantOutcome, MemoryLedger};
    use crate::request_store::StoreConfig;
    use crate::types::ManualClock;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Harness {
        service: PairingService,
        ledger: Arc<MemoryLedger>,
        clock: Arc<ManualClock>,
        audit: Arc<MemoryAuditSink>,
    }

    fn harness(ttl: u64) -> Harness {
        let store = Arc::new(RequestStore::new(StoreConfig {
            request_ttl: Duration::from_secs(ttl),
            max_pending: 8,
            retention: Duration::from_secs(3600),
        }));
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let audit = Arc::new(MemoryAuditSink::default());
        let service = PairingService::new(store, ledger.clone())
            .with_clock(clock.clone())
            .with_audit_sink(audit.clone());
        Harness {
            service,
            ledger,
            clock,
            audit,
        }
    }

    fn attempt(identity: &str, ip: &str) -> PairingAttempt {
        PairingAttempt::new(ClientIdentity::parse(identity).unwrap()).with_client_ip(ip)
    }

    #[tokio::test]
    async fn test_approve_scenario() {
        let h = harness(600);
        let r1 = h.service.admit(attempt("host-r1", "10.0.0.5")).await.unwrap();

        let listed = h.service.list_requests().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, r1);
        assert_eq!(listed[0].client_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(listed[0].status, RequestStatus::Pending);

        let outcome = h.service.approve(&r1).await.unwrap();
        assert!(outcome.ok());
        assert_eq!(outcome.status(), Some(RequestStatus::Approved));

        assert!(h.service.list_requests().await.is_empty());

        let again = h.service.approve(&r1).await.unwrap();
        assert!(!again.ok());
        assert_eq!(again, ApproveOutcome::AlreadyResolved(RequestStatus::Approved));
        assert!(h.ledger.is_trusted(&ClientIdentity::parse("host-r1").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_dismiss_scenario() {
        let h = harness(600);
        let r2 = h.service.admit(attempt("host-r2", "")).await.unwrap();

        assert_eq!(h.service.dismiss(&r2).await.unwrap(), DismissOutcome::Dismissed);
        let second = h.service.dismiss(&r2).await.unwrap();
        assert!(second.ok());
        assert_eq!(second, DismissOutcome::AlreadyResolved(RequestStatus::Dismissed));

        let approve = h.service.approve(&r2).await.unwrap();
        assert!(!approve.ok());
        assert!(!h.ledger.is_trusted(&ClientIdentity::parse("host-r2").unwrap()).await.unwrap());

        let dismissals = h
            .audit
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::RequestDismissed { .. }))
            .count();
        assert_eq!(dismissals, 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_errors() {
        let h = harness(600);
        let unknown = RequestId::generate(404).unwrap();

        assert_eq!(h.service.approve(&unknown).await.unwrap(), ApproveOutcome::NotFound);
        let dismissed = h.service.dismiss(&unknown).await.unwrap();
        assert!(dismissed.ok());
        assert_eq!(dismissed, DismissOutcome::NotFound);
        assert_eq!(h.service.status(&unknown).await, StatusOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_expired_request_cannot_be_resolved() {
        let h = harness(60);
        let id = h.service.admit(attempt("host-x", "")).await.unwrap();
        h.clock.advance(60);

        assert!(h.service.list_requests().await.is_empty());
        assert_eq!(
            h.service.approve(&id).await.unwrap(),
            ApproveOutcome::AlreadyResolved(RequestStatus::Expired)
        );
        assert_eq!(
            h.service.dismiss(&id).await.unwrap(),
            DismissOutcome::AlreadyResolved(RequestStatus::Expired)
        );
        match h.service.status(&id).await {
            StatusOutcome::Found(request) => assert_eq!(request.status, RequestStatus::Expired),
            StatusOutcome::NotFound => panic!("expired request should still be visible"),
        }
        assert!(h.ledger.list().await.unwrap().is_empty());

        let expiries = h
            .audit
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::RequestExpired { .. }))
            .count();
        assert_eq!(expiries, 1);
    }

    #[tokio::test]
    async fn test_reapproval_of_trusted_identity_is_noop_grant() {
        let h = harness(600);
        let first = h.service.admit(attempt("host-same", "")).await.unwrap();
        h.service.approve(&first).await.unwrap();

        h.clock.advance(30);
        let second = h.service.admit(attempt("host-same", "")).await.unwrap();
        match h.service.approve(&second).await.unwrap() {
            ApproveOutcome::Approved { client, newly_granted } => {
                assert!(!newly_granted);
                assert_eq!(client.granted_at, 10_000);
                assert_eq!(client.request_id, first);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.ledger.list().await.unwrap().len(), 1);
    }

    struct FailingLedger;

    #[async_trait]
    impl TrustLedger for FailingLedger {
        async fn grant(
            &self,
            _identity: &ClientIdentity,
            _request_id: &RequestId,
            _now: u64,
        ) -> Result<GrantOutcome, LedgerError> {
            Err(LedgerError::Storage("disk full".to_string()))
        }

        async fn is_trusted(&self, _identity: &ClientIdentity) -> Result<bool, LedgerError> {
            Ok(false)
        }

        async fn get(&self, _identity: &ClientIdentity) -> Result<Option<TrustedClient>, LedgerError> {
            Ok(None)
        }

        async fn list(&self) -> Result<Vec<TrustedClient>, LedgerError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_ledger_failure_leaves_request_pending() {
        let store = Arc::new(RequestStore::default());
        let service = PairingService::new(store, Arc::new(FailingLedger));
        let id = service.admit(attempt("host-f", "")).await.unwrap();

        let err = service.approve(&id).await.unwrap_err();
        assert!(matches!(err, PairingError::LedgerWriteFailure(_)));
        assert!(err.is_fatal());

        let listed = service.list_requests().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, RequestStatus::Pending);
    }

    /// Ledger that lets a dismiss land while the grant is in flight.
    struct DismissDuringGrant {
        inner: MemoryLedger,
        store: Arc<RequestStore>,
    }

    #[async_trait]
    impl TrustLedger for DismissDuringGrant {
        async fn grant(
            &self,
            identity: &ClientIdentity,
            request_id: &RequestId,
            now: u64,
        ) -> Result<GrantOutcome, LedgerError> {
            self.store
                .transition(request_id, RequestStatus::Dismissed, now)
                .unwrap();
            self.inner.grant(identity, request_id, now).await
        }

        async fn is_trusted(&self, identity: &ClientIdentity) -> Result<bool, LedgerError> {
            self.inner.is_trusted(identity).await
        }

        async fn get(&self, identity: &ClientIdentity) -> Result<Option<TrustedClient>, LedgerError> {
            self.inner.get(identity).await
        }

        async fn list(&self) -> Result<Vec<TrustedClient>, LedgerError> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_dismiss_racing_approve_reports_actual_status() {
        let store = Arc::new(RequestStore::default());
        let ledger = Arc::new(DismissDuringGrant {
            inner: MemoryLedger::new(),
            store: store.clone(),
        });
        let service = PairingService::new(store, ledger.clone());
        let id = service.admit(attempt("host-race", "")).await.unwrap();

        let outcome = service.approve(&id).await.unwrap();
        assert!(!outcome.ok());
        assert_eq!(outcome.status(), Some(RequestStatus::Dismissed));
        assert!(matches!(outcome, ApproveOutcome::RaceLost { .. }));

        // The grant stands and the request reports what really happened
        assert!(ledger.is_trusted(&ClientIdentity::parse("host-race").unwrap()).await.unwrap());
        match service.status(&id).await {
            StatusOutcome::Found(request) => assert_eq!(request.status, RequestStatus::Dismissed),
            StatusOutcome::NotFound => panic!("request vanished"),
        }
    }

    #[tokio::test]
    async fn test_capacity_exceeded_is_fatal() {
        let store = Arc::new(RequestStore::new(StoreConfig {
            max_pending: 1,
            ..StoreConfig::default()
        }));
        let service = PairingService::new(store, Arc::new(MemoryLedger::new()));
        service.admit(attempt("a", "")).await.unwrap();

        let err = service.admit(attempt("b", "")).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_sweep_records_expiry() {
        let h = harness(5);
        h.service.admit(attempt("host-s", "")).await.unwrap();
        h.clock.advance(5);

        let report = h.service.sweep().await;
        assert_eq!(report.expired.len(), 1);
        assert!(h
            .audit
            .events()
            .await
            .iter()
            .any(|e| e.event_type() == "REQUEST_EXPIRED"));
    }

    #[tokio::test]
    async fn test_expiry_is_audited_without_listing() {
        let h = harness(60);
        let a = h.service.admit(attempt("host-a", "")).await.unwrap();
        let b = h.service.admit(attempt("host-b", "")).await.unwrap();
        h.clock.advance(60);

        assert_eq!(
            h.service.approve(&a).await.unwrap(),
            ApproveOutcome::AlreadyResolved(RequestStatus::Expired)
        );
        h.service.admit(attempt("host-c", "")).await.unwrap();

        let expired: Vec<RequestId> = h
            .audit
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::RequestExpired { .. }))
            .map(|e| *e.request_id())
            .collect();
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&a));
        assert!(expired.contains(&b));
    }

    #[tokio::test]
    async fn test_expiry_through_dismiss_and_status_is_audited_once() {
        let h = harness(60);
        let a = h.service.admit(attempt("host-a", "")).await.unwrap();
        let b = h.service.admit(attempt("host-b", "")).await.unwrap();
        h.clock.advance(61);

        assert_eq!(
            h.service.dismiss(&a).await.unwrap(),
            DismissOutcome::AlreadyResolved(RequestStatus::Expired)
        );
        assert!(matches!(h.service.status(&b).await, StatusOutcome::Found(_)));
        h.service.status(&b).await;
        h.service.sweep().await;

        let events = h.audit.events().await;
        let expiries: Vec<&AuditEvent> = events
            .iter()
            .filter(|e| matches!(e, AuditEvent::RequestExpired { .. }))
            .collect();
        assert_eq!(expiries.len(), 2);
        assert!(expiries.iter().all(|e| e.timestamp() == 10_061));
    }

    /// Ledger whose writes take long enough for the request window to pass.
    struct SlowLedger {
        inner: MemoryLedger,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl TrustLedger for SlowLedger {
        async fn grant(
            &self,
            identity: &ClientIdentity,
            request_id: &RequestId,
            now: u64,
        ) -> Result<GrantOutcome, LedgerError> {
            self.clock.advance(120);
            self.inner.grant(identity, request_id, now).await
        }

        async fn is_trusted(&self, identity: &ClientIdentity) -> Result<bool, LedgerError> {
            self.inner.is_trusted(identity).await
        }

        async fn get(&self, identity: &ClientIdentity) -> Result<Option<TrustedClient>, LedgerError> {
            self.inner.get(identity).await
        }

        async fn list(&self) -> Result<Vec<TrustedClient>, LedgerError> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_approval_started_in_window_completes() {
        let store = Arc::new(RequestStore::new(StoreConfig {
            request_ttl: Duration::from_secs(60),
            ..StoreConfig::default()
        }));
        let clock = Arc::new(ManualClock::new(5_000));
        let ledger = Arc::new(SlowLedger {
            inner: MemoryLedger::new(),
            clock: clock.clone(),
        });
        let service = PairingService::new(store, ledger).with_clock(clock.clone());

        let id = service.admit(attempt("host-slow", "")).await.unwrap();
        clock.advance(59);

        let outcome = service.approve(&id).await.unwrap();
        assert!(outcome.ok());
        match service.status(&id).await {
            StatusOutcome::Found(request) => {
                assert_eq!(request.status, RequestStatus::Approved);
                assert_eq!(request.updated_at, 5_059);
            }
            StatusOutcome::NotFound => panic!("request vanished"),
        }
    }
}
