//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `edge_state` key holding the highest sequence ever assigned.
pub const STATE_LAST_SEQUENCE: &str = "hit_queue.last_sequence";

/// `edge_state` key holding the last reset-identities time (ms epoch).
pub const STATE_LAST_RESET_AT: &str = "identities.last_reset_at";

/// `edge_state` key holding the serialized [`LocationHintRecord`].
pub const STATE_LOCATION_HINT: &str = "edge.location_hint";

/// One persisted hit queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitQueueRow {
    pub sequence: i64,
    pub request_id: String,
    /// JSON-encoded hit payload.
    pub payload: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Input for inserting a hit.
#[derive(Debug, Clone)]
pub struct NewHit {
    pub request_id: String,
    pub payload: String,
}

/// An event waiting for consent.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldEventRow {
    pub arrival: i64,
    pub request_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted store payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorePayloadRecord {
    pub key: String,
    pub value: String,
    /// Seconds, as received.
    pub max_age: i64,
    /// Milliseconds since the Unix epoch.
    pub expires_at: i64,
    /// JSON-encoded attributes, if any.
    pub attrs: Option<String>,
}

/// Persisted location hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationHintRecord {
    pub hint: String,
    /// Milliseconds since the Unix epoch.
    pub expires_at: i64,
}
