//! Collect consent.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Consent standard sent in every request's consent block.
pub const CONSENT_STANDARD: &str = "Adobe";

/// Consent standard version.
pub const CONSENT_VERSION: &str = "2.0";

/// Collect consent decision.
///
/// Encoded on the wire and in shared state as `y`, `n` or `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentStatus {
    #[serde(rename = "y")]
    Yes,
    #[serde(rename = "n")]
    No,
    #[serde(rename = "p")]
    Pending,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "y",
            Self::No => "n",
            Self::Pending => "p",
        }
    }

    /// Parse `y`/`n`/`p`. Anything else is treated as pending.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "y" => Self::Yes,
            "n" => Self::No,
            _ => Self::Pending,
        }
    }

    /// Read `consents.collect.val` from a consent document.
    pub fn from_consents(document: &Value) -> Option<Self> {
        document
            .pointer("/consents/collect/val")
            .and_then(Value::as_str)
            .map(Self::parse)
    }
}

/// Current consent plus the standard used to encode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub status: ConsentStatus,
    pub standard: String,
    pub version: String,
}

impl ConsentRecord {
    pub fn new(status: ConsentStatus) -> Self {
        Self {
            status,
            standard: CONSENT_STANDARD.to_string(),
            version: CONSENT_VERSION.to_string(),
        }
    }

    /// The `meta.consent` entry for experience requests.
    pub fn to_request_block(&self) -> Value {
        json!({
            "standard": self.standard,
            "version": self.version,
            "value": { "collect": { "val": self.status.as_str() } }
        })
    }
}

impl Default for ConsentRecord {
    fn default() -> Self {
        Self::new(ConsentStatus::Yes)
    }
}
