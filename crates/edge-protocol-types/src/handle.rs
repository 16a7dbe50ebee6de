//! Response fragments returned by the collection endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Location hint scope that applies to the collection endpoint.
pub const EDGE_NETWORK_SCOPE: &str = "EdgeNetwork";

/// Handle type, decoded from the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HandleKind {
    /// `state:store`: payloads to persist and replay on later requests.
    StateStore,
    /// `locationHint:result`
    LocationHint,
    /// `identity:result`
    Identity,
    /// `personalization:decisions`
    Personalization,
    /// Any type this client does not interpret; still forwarded to listeners.
    Unknown(String),
}

impl HandleKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::StateStore => "state:store",
            Self::LocationHint => "locationHint:result",
            Self::Identity => "identity:result",
            Self::Personalization => "personalization:decisions",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<String> for HandleKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "state:store" => Self::StateStore,
            "locationHint:result" => Self::LocationHint,
            "identity:result" => Self::Identity,
            "personalization:decisions" => Self::Personalization,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<HandleKind> for String {
    fn from(kind: HandleKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One typed fragment of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHandle {
    #[serde(rename = "type")]
    pub kind: HandleKind,
    #[serde(default)]
    pub payload: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_index: Option<usize>,
    /// Filled in by the correlator once `event_index` is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_event_id: Option<String>,
}

/// `report` block of a structured error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_index: Option<usize>,
}

/// Structured error, either reported by the server or synthesized locally
/// for failed requests.
///
/// Accepts both the `{message, namespace}` and the
/// `{type, status, title, detail, report}` shapes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeEventError {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ErrorReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_event_id: Option<String>,
}

impl EdgeEventError {
    /// Locally generated error with an optional HTTP status.
    pub fn local(status: Option<u16>, title: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            status,
            title: Some(title.into()),
            detail,
            ..Default::default()
        }
    }

    pub fn event_index(&self) -> Option<usize> {
        self.report.as_ref().and_then(|report| report.event_index)
    }

    /// Best human-readable description.
    pub fn summary(&self) -> String {
        let headline = self
            .title
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("unknown error");
        match (&self.detail, self.status) {
            (Some(detail), Some(status)) => format!("{} ({}): {}", headline, status, detail),
            (Some(detail), None) => format!("{}: {}", headline, detail),
            (None, Some(status)) => format!("{} ({})", headline, status),
            (None, None) => headline.to_string(),
        }
    }
}

/// Payload entry of a `state:store` handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreResponsePayload {
    pub key: String,
    pub value: String,
    /// Seconds; zero or negative removes the key.
    #[serde(default)]
    pub max_age: i64,
    /// Cookie-like attributes (domain, path, ...), kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Value>,
}

/// Payload entry of a `locationHint:result` handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationHintPayload {
    pub scope: String,
    pub hint: String,
    #[serde(default)]
    pub ttl_seconds: i64,
}

/// What a response listener receives.
///
/// Zero or more `Handle`/`ServerError`/`Warning` notifications are followed
/// by exactly one terminal `Complete`, `Failed` or `Dropped`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseNotification {
    Handle(EventHandle),
    ServerError(EdgeEventError),
    Warning(EdgeEventError),
    Complete,
    Failed(EdgeEventError),
    /// Discarded before delivery because collect consent became `no`.
    Dropped,
}

impl ResponseNotification {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_) | Self::Dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handle_kind_decoding() {
        let handle: EventHandle = serde_json::from_value(json!({
            "type": "state:store",
            "payload": [{ "key": "k1", "value": "v1", "maxAge": 600 }],
            "eventIndex": 0
        }))
        .unwrap();
        assert_eq!(handle.kind, HandleKind::StateStore);
        assert_eq!(handle.event_index, Some(0));

        let unknown: EventHandle =
            serde_json::from_value(json!({ "type": "activation:push" })).unwrap();
        assert_eq!(unknown.kind, HandleKind::Unknown("activation:push".to_string()));
        assert!(unknown.payload.is_empty());
    }

    #[test]
    fn test_handle_kind_roundtrips_type_string() {
        let value = serde_json::to_value(HandleKind::LocationHint).unwrap();
        assert_eq!(value, json!("locationHint:result"));
    }

    #[test]
    fn test_error_both_shapes() {
        let legacy: EdgeEventError =
            serde_json::from_value(json!({ "message": "bad", "namespace": "global" })).unwrap();
        assert_eq!(legacy.summary(), "bad");
        assert_eq!(legacy.namespace.as_deref(), Some("global"));

        let problem: EdgeEventError = serde_json::from_value(json!({
            "type": "https://ns.adobe.com/aep/errors/EXEG-0201-503",
            "status": 503,
            "title": "Unavailable",
            "detail": "try later",
            "report": { "eventIndex": 1 }
        }))
        .unwrap();
        assert_eq!(problem.event_index(), Some(1));
        assert_eq!(problem.summary(), "Unavailable (503): try later");
    }

    #[test]
    fn test_store_payload_defaults() {
        let payload: StoreResponsePayload =
            serde_json::from_value(json!({ "key": "k", "value": "v" })).unwrap();
        assert_eq!(payload.max_age, 0);
        assert!(payload.attrs.is_none());
    }

    #[test]
    fn test_terminal_notifications() {
        assert!(ResponseNotification::Complete.is_terminal());
        assert!(ResponseNotification::Failed(EdgeEventError::default()).is_terminal());
        assert!(ResponseNotification::Dropped.is_terminal());
        assert!(!ResponseNotification::Warning(EdgeEventError::default()).is_terminal());
    }
}
