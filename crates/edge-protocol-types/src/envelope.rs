//! Experience events and the hits persisted for them.

use crate::ConsentStatus;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type used when the application does not name one.
pub const EDGE_EVENT_TYPE: &str = "com.adobe.eventType.edge";

/// ISO-8601 UTC with millisecond precision, e.g. `2024-01-01T00:00:00.000Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Application-level event as delivered by the host framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceEvent {
    pub event_type: String,
    pub xdm: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
}

impl ExperienceEvent {
    pub fn new(xdm: Value) -> Self {
        Self {
            event_type: EDGE_EVENT_TYPE.to_string(),
            xdm,
            data: None,
            dataset_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_dataset_id(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    /// The xdm payload must be a JSON object.
    pub fn is_valid(&self) -> bool {
        self.xdm.as_object().is_some_and(|xdm| !xdm.is_empty())
    }
}

/// One accepted experience event plus its delivery metadata.
///
/// Ids are assigned once in [`EventEnvelope::new`] and never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub request_id: String,
    pub request_event_id: String,
    pub event_type: String,
    pub dataset_id: Option<String>,
    pub xdm_payload: Value,
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub consent_status_at_enqueue: ConsentStatus,
}

impl EventEnvelope {
    pub fn new(event: ExperienceEvent, consent: ConsentStatus) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            request_event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event.event_type,
            dataset_id: event.dataset_id,
            xdm_payload: event.xdm,
            data: event.data,
            timestamp: Utc::now(),
            consent_status_at_enqueue: consent,
        }
    }

    /// The `events[]` entry for this envelope.
    ///
    /// `_id` and `timestamp` are filled in unless the application set them.
    pub fn to_request_event(&self) -> Value {
        let mut xdm = match &self.xdm_payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        xdm.entry("_id")
            .or_insert_with(|| Value::String(self.request_event_id.clone()));
        xdm.entry("timestamp")
            .or_insert_with(|| Value::String(format_timestamp(self.timestamp)));

        let mut event = Map::new();
        event.insert("xdm".to_string(), Value::Object(xdm));
        if let Some(data) = &self.data {
            event.insert("data".to_string(), data.clone());
        }
        Value::Object(event)
    }
}

/// Persisted payload of one hit queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeHit {
    /// A single experience event.
    ExperienceEvent { envelope: EventEnvelope },
    /// A consent preferences update.
    ConsentUpdate {
        request_id: String,
        request_event_id: String,
        consents: Value,
        timestamp: DateTime<Utc>,
    },
}

impl EdgeHit {
    pub fn experience(envelope: EventEnvelope) -> Self {
        Self::ExperienceEvent { envelope }
    }

    pub fn consent_update(consents: Value) -> Self {
        Self::ConsentUpdate {
            request_id: uuid::Uuid::new_v4().to_string(),
            request_event_id: uuid::Uuid::new_v4().to_string(),
            consents,
            timestamp: Utc::now(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::ExperienceEvent { envelope } => &envelope.request_id,
            Self::ConsentUpdate { request_id, .. } => request_id,
        }
    }

    /// Originating event ids, indexed the way the server's `eventIndex` is.
    pub fn request_event_ids(&self) -> Vec<String> {
        match self {
            Self::ExperienceEvent { envelope } => vec![envelope.request_event_id.clone()],
            Self::ConsentUpdate {
                request_event_id, ..
            } => vec![request_event_id.clone()],
        }
    }
}
