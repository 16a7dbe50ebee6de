//! Persistent store for server-issued state.
//!
//! Payloads from `state:store` handles are kept until they expire and
//! replayed in `meta.state.entries` of every experience request.

use crate::DispatchResult;
use chrono::{DateTime, TimeZone, Utc};
use edge_database::{queries, AsyncDatabase, LocationHintRecord, StorePayloadRecord};
use edge_protocol_types::StoreResponsePayload;
use serde_json::Value;
use tracing::{debug, info};

/// A live store payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StorePayload {
    pub key: String,
    pub value: String,
    pub max_age_secs: i64,
    pub expires_at: DateTime<Utc>,
    pub attributes: Option<Value>,
}

impl StorePayload {
    fn from_record(record: StorePayloadRecord) -> Self {
        Self {
            expires_at: ms_to_datetime(record.expires_at),
            attributes: record
                .attrs
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            key: record.key,
            value: record.value,
            max_age_secs: record.max_age,
        }
    }
}

/// Durable key/value state.
///
/// Every operation is one executor call, so readers never see a batch half
/// applied.
#[derive(Clone)]
pub struct PersistentStore {
    db: AsyncDatabase,
}

impl PersistentStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    /// Apply payloads from a response.
    pub async fn upsert(&self, payloads: Vec<StoreResponsePayload>) -> DispatchResult<()> {
        self.upsert_at(payloads, Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn upsert_at(
        &self,
        payloads: Vec<StoreResponsePayload>,
        now_ms: i64,
    ) -> DispatchResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for payload in payloads {
            if payload.max_age <= 0 {
                deletes.push(payload.key);
                continue;
            }
            upserts.push(StorePayloadRecord {
                expires_at: now_ms.saturating_add(payload.max_age.saturating_mul(1000)),
                attrs: payload.attrs.as_ref().map(Value::to_string),
                key: payload.key,
                value: payload.value,
                max_age: payload.max_age,
            });
        }

        debug!(
            upserts = upserts.len(),
            deletes = deletes.len(),
            "Applying store payloads"
        );
        self.db
            .call(move |conn| queries::apply_store_payloads(conn, &upserts, &deletes))
            .await?;
        Ok(())
    }

    /// Unexpired payloads, ordered by key. Expired ones are purged.
    pub async fn snapshot(&self) -> DispatchResult<Vec<StorePayload>> {
        self.snapshot_at(Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn snapshot_at(&self, now_ms: i64) -> DispatchResult<Vec<StorePayload>> {
        let records = self
            .db
            .call(move |conn| queries::live_store_payloads(conn, now_ms))
            .await?;
        Ok(records.into_iter().map(StorePayload::from_record).collect())
    }

    /// Clear payloads and the location hint, recording the reset time.
    pub async fn reset_identities(&self) -> DispatchResult<DateTime<Utc>> {
        let reset_at = Utc::now();
        let reset_ms = reset_at.timestamp_millis();
        let cleared = self
            .db
            .call(move |conn| queries::reset_identities(conn, reset_ms))
            .await?;
        info!(cleared, "Identities reset");
        Ok(reset_at)
    }

    pub async fn last_reset_at(&self) -> DispatchResult<Option<DateTime<Utc>>> {
        let raw = self.db.call(|conn| queries::last_reset_at(conn)).await?;
        Ok(raw.map(ms_to_datetime))
    }

    /// The location hint, if set and unexpired.
    pub async fn location_hint(&self) -> DispatchResult<Option<String>> {
        self.location_hint_at(Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn location_hint_at(&self, now_ms: i64) -> DispatchResult<Option<String>> {
        let record = self.db.call(|conn| queries::get_location_hint(conn)).await?;
        Ok(record
            .filter(|record| record.expires_at > now_ms)
            .map(|record| record.hint))
    }

    /// Set the location hint. An empty hint or non-positive TTL clears it.
    pub async fn set_location_hint(&self, hint: Option<&str>, ttl_secs: i64) -> DispatchResult<()> {
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());
        match hint {
            Some(hint) if ttl_secs > 0 => {
                let record = LocationHintRecord {
                    hint: hint.to_string(),
                    expires_at: Utc::now()
                        .timestamp_millis()
                        .saturating_add(ttl_secs.saturating_mul(1000)),
                };
                debug!(hint = %record.hint, ttl_secs, "Location hint updated");
                self.db
                    .call(move |conn| queries::set_location_hint(conn, &record))
                    .await?;
            }
            _ => {
                self.db
                    .call(|conn| queries::clear_location_hint(conn))
                    .await?;
                debug!("Location hint cleared");
            }
        }
        Ok(())
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
