//! Shared types for pairing requests and trusted clients.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::PairingError;

/// Length of a request id in bytes (8 sequence bytes + 8 random bytes).
pub const REQUEST_ID_LEN: usize = 16;

/// Maximum accepted length of a client identity, in bytes.
pub const MAX_IDENTITY_LEN: usize = 256;

/// Message shown to the operator when the admitting side supplies none.
pub const DEFAULT_REQUEST_MESSAGE: &str = "Pairing request pending approval";

// ============================================================================
// Request Id
// ============================================================================

/// Opaque pairing request identifier.
///
/// The first eight bytes are a per-store admission sequence, so ids stay unique
/// for the lifetime of a store even after old requests are collected. The last
/// eight bytes are random and keep ids unguessable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    /// Build a fresh id for the given admission sequence number.
    pub fn generate(sequence: u64) -> Result<Self, PairingError> {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        bytes[..8].copy_from_slice(&sequence.to_be_bytes());
        getrandom::getrandom(&mut bytes[8..])
            .map_err(|e| PairingError::RandomnessUnavailable(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded id, accepting either case.
    pub fn parse(raw: &str) -> Result<Self, PairingError> {
        let trimmed = raw.trim();
        if trimmed.len() != REQUEST_ID_LEN * 2 {
            return Err(PairingError::InvalidRequestId(format!(
                "expected {} hex characters, got {}",
                REQUEST_ID_LEN * 2,
                trimmed.len()
            )));
        }
        let decoded = hex::decode(trimmed)
            .map_err(|e| PairingError::InvalidRequestId(e.to_string()))?;
        let mut bytes = [0u8; REQUEST_ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Admission sequence encoded in the id.
    pub fn sequence(&self) -> u64 {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(seq)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

impl FromStr for RequestId {
    type Err = PairingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a pairing request.
///
/// `Pending` is the only non-terminal state and nothing ever transitions back
/// into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Dismissed,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Dismissed => "dismissed",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Client Identity
// ============================================================================

/// Trust key of a pairing client.
///
/// Supplied by whatever component admits the pairing attempt. It is kept apart
/// from the advisory `client_ip`, which is never used for trust decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn parse(raw: &str) -> Result<Self, PairingError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PairingError::InvalidIdentity("empty identity".to_string()));
        }
        if trimmed.len() > MAX_IDENTITY_LEN {
            return Err(PairingError::InvalidIdentity(format!(
                "identity longer than {} bytes",
                MAX_IDENTITY_LEN
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(PairingError::InvalidIdentity(
                "identity contains control characters".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientIdentity {
    type Error = PairingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ClientIdentity> for String {
    fn from(value: ClientIdentity) -> Self {
        value.0
    }
}

// ============================================================================
// Records
// ============================================================================

/// An inbound pairing attempt, as handed over by the admitting component.
#[derive(Debug, Clone)]
pub struct PairingAttempt {
    pub client_identity: ClientIdentity,
    pub client_ip: Option<String>,
    pub message: Option<String>,
}

impl PairingAttempt {
    pub fn new(client_identity: ClientIdentity) -> Self {
        Self {
            client_identity,
            client_ip: None,
            message: None,
        }
    }

    /// Attach the advisory client address. Blank values are dropped.
    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        let ip = client_ip.into();
        let ip = ip.trim();
        self.client_ip = if ip.is_empty() { None } else { Some(ip.to_string()) };
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = message.trim();
        self.message = if message.is_empty() { None } else { Some(message.to_string()) };
        self
    }
}

/// A pairing request held by the request store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequest {
    pub request_id: RequestId,
    pub client_ip: Option<String>,
    pub client_identity: ClientIdentity,
    pub message: String,
    pub status: RequestStatus,
    /// Unix timestamp (seconds) of admission
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change
    pub updated_at: u64,
    /// Admission order, used to break `created_at` ties
    pub sequence: u64,
}

impl PairingRequest {
    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// True when the request is still pending but its expiry window has passed.
    pub fn is_overdue(&self, now: u64, ttl_secs: u64) -> bool {
        self.is_pending() && now.saturating_sub(self.created_at) >= ttl_secs
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Client address for display; `"unknown"` when absent.
    pub fn client_ip_display(&self) -> &str {
        self.client_ip.as_deref().unwrap_or("unknown")
    }
}

/// A client that has been granted trust.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedClient {
    pub client_id: ClientIdentity,
    /// Unix timestamp (seconds) of the first grant
    pub granted_at: u64,
    /// Request whose approval created this record
    pub request_id: RequestId,
}

// ============================================================================
// Clock
// ============================================================================

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_hex_form() {
        let id = RequestId::generate(7).unwrap();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(id.sequence(), 7);
    }

    #[test]
    fn test_request_id_parse_normalizes_case() {
        let id = RequestId::generate(1).unwrap();
        let upper = id.to_string().to_uppercase();
        assert_eq!(RequestId::parse(&upper).unwrap(), id);
        assert_eq!(RequestId::parse(&format!("  {}  ", id)).unwrap(), id);
    }

    #[test]
    fn test_request_id_rejects_malformed() {
        assert!(RequestId::parse("").is_err());
        assert!(RequestId::parse("abc").is_err());
        assert!(RequestId::parse(&"z".repeat(32)).is_err());
        assert!(RequestId::parse(&"a".repeat(34)).is_err());
    }

    #[test]
    fn test_request_ids_differ_for_same_sequence() {
        let a = RequestId::generate(3).unwrap();
        let b = RequestId::generate(3).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&RequestStatus::Expired).unwrap();
        assert_eq!(json, "\"expired\"");
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(RequestStatus::Expired.is_terminal());
    }

    #[test]
    fn test_identity_validation() {
        assert_eq!(ClientIdentity::parse("  host-1 ").unwrap().as_str(), "host-1");
        assert!(ClientIdentity::parse("   ").is_err());
        assert!(ClientIdentity::parse("a\nb").is_err());
        assert!(ClientIdentity::parse(&"x".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }

    #[test]
    fn test_attempt_drops_blank_fields() {
        let attempt = PairingAttempt::new(ClientIdentity::parse("host").unwrap())
            .with_client_ip("  ")
            .with_message("");
        assert!(attempt.client_ip.is_none());
        assert!(attempt.message.is_none());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
