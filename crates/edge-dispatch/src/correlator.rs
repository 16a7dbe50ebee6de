//! Response correlation.
//!
//! Parses response bodies, applies the state they carry, and routes every
//! fragment to the listener of the event it belongs to.

use crate::request::EdgeRequest;
use crate::store::PersistentStore;
use crate::{DispatchError, DispatchResult};
use edge_protocol_types::{
    EdgeEventError, EventHandle, HandleKind, LocationHintPayload, ResponseNotification,
    StoreResponsePayload, EDGE_NETWORK_SCOPE,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// TTL applied to a location hint that arrives without one.
pub const DEFAULT_LOCATION_HINT_TTL_SECS: i64 = 1800;

/// Parsed response body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeResponse {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub handle: Vec<EventHandle>,
    #[serde(default)]
    pub errors: Vec<EdgeEventError>,
    #[serde(default)]
    pub warnings: Vec<EdgeEventError>,
}

impl EdgeResponse {
    /// An empty body is a valid, empty response.
    pub fn parse(body: &str) -> serde_json::Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(body)
    }
}

/// How the event was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Queued,
    /// Waiting for consent.
    Held,
    /// Collect consent was `no`. Nothing will be delivered.
    Dropped,
}

/// Listeners keyed by request event id.
#[derive(Clone, Default)]
pub struct CompletionRegistry {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ResponseNotification>>>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and return its handle.
    pub fn register(&self, request_event_id: &str, disposition: Disposition) -> ResponseHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        if disposition != Disposition::Dropped {
            self.listeners.lock().insert(request_event_id.to_string(), tx);
        }
        ResponseHandle {
            request_event_id: request_event_id.to_string(),
            disposition,
            receiver: rx,
        }
    }

    /// Deliver a non-terminal notification. Returns false if nobody listens.
    pub fn notify(&self, request_event_id: &str, notification: ResponseNotification) -> bool {
        let listeners = self.listeners.lock();
        match listeners.get(request_event_id) {
            Some(tx) => tx.send(notification).is_ok(),
            None => false,
        }
    }

    pub fn complete(&self, request_event_id: &str) {
        self.finish(request_event_id, ResponseNotification::Complete);
    }

    pub fn fail(&self, request_event_id: &str, error: EdgeEventError) {
        self.finish(request_event_id, ResponseNotification::Failed(error));
    }

    /// Close the listener of an event discarded for consent.
    pub fn drop_listener(&self, request_event_id: &str) {
        self.finish(request_event_id, ResponseNotification::Dropped);
    }

    fn finish(&self, request_event_id: &str, terminal: ResponseNotification) {
        if let Some(tx) = self.listeners.lock().remove(request_event_id) {
            let _ = tx.send(terminal);
        }
    }

    /// Deregister without a terminal notification.
    pub fn remove(&self, request_event_id: &str) -> bool {
        self.listeners.lock().remove(request_event_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller's end of a listener.
#[derive(Debug)]
pub struct ResponseHandle {
    request_event_id: String,
    disposition: Disposition,
    receiver: mpsc::UnboundedReceiver<ResponseNotification>,
}

impl ResponseHandle {
    pub fn request_event_id(&self) -> &str {
        &self.request_event_id
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Next notification; `None` once the listener is closed.
    pub async fn next(&mut self) -> Option<ResponseNotification> {
        self.receiver.recv().await
    }

    /// Collect everything up to and including the terminal notification.
    pub async fn wait(mut self) -> ResponseOutcome {
        let mut outcome = ResponseOutcome {
            request_event_id: self.request_event_id.clone(),
            disposition: self.disposition,
            handles: Vec::new(),
            server_errors: Vec::new(),
            warnings: Vec::new(),
            failure: None,
            completed: false,
            dropped: false,
        };

        while let Some(notification) = self.receiver.recv().await {
            match notification {
                ResponseNotification::Handle(handle) => outcome.handles.push(handle),
                ResponseNotification::ServerError(error) => outcome.server_errors.push(error),
                ResponseNotification::Warning(warning) => outcome.warnings.push(warning),
                ResponseNotification::Complete => {
                    outcome.completed = true;
                    break;
                }
                ResponseNotification::Failed(error) => {
                    outcome.failure = Some(error);
                    break;
                }
                ResponseNotification::Dropped => {
                    outcome.dropped = true;
                    break;
                }
            }
        }
        outcome
    }
}

/// Everything one listener received.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutcome {
    pub request_event_id: String,
    pub disposition: Disposition,
    pub handles: Vec<EventHandle>,
    pub server_errors: Vec<EdgeEventError>,
    pub warnings: Vec<EdgeEventError>,
    /// Set when the request failed permanently.
    pub failure: Option<EdgeEventError>,
    /// Set when the request finished and every fragment was delivered.
    pub completed: bool,
    /// Set when the event was discarded for consent after acceptance.
    pub dropped: bool,
}

impl ResponseOutcome {
    /// Handles on success. Server-reported errors and failures become errors.
    ///
    /// A listener that closed without any terminal notification belonged to
    /// a dispatcher that shut down.
    pub fn into_result(self) -> DispatchResult<Vec<EventHandle>> {
        if self.dropped || self.disposition == Disposition::Dropped {
            return Err(DispatchError::ConsentDenied);
        }
        if let Some(failure) = self.failure {
            return Err(DispatchError::PermanentRequest(failure.summary()));
        }
        if !self.completed {
            return Err(DispatchError::ShutDown);
        }
        if let Some(error) = self.server_errors.first() {
            return Err(DispatchError::ServerReported(error.summary()));
        }
        Ok(self.handles)
    }
}

/// Applies and routes responses.
#[derive(Clone)]
pub struct ResponseCorrelator {
    store: PersistentStore,
    registry: CompletionRegistry,
}

impl ResponseCorrelator {
    pub fn new(store: PersistentStore, registry: CompletionRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &CompletionRegistry {
        &self.registry
    }

    /// Persist state, route fragments, then complete every listener of the
    /// request. Listeners are completed even when persisting fails; the
    /// storage error is returned afterwards.
    pub async fn handle_success(
        &self,
        request: &EdgeRequest,
        response: EdgeResponse,
    ) -> DispatchResult<()> {
        let persisted = self.persist(&response).await;

        let ids = &request.request_event_ids;
        for handle in response.handle {
            for target in targets(ids, handle.event_index) {
                let mut handle = handle.clone();
                handle.request_event_id = Some(target.clone());
                if !self.registry.notify(target, ResponseNotification::Handle(handle)) {
                    debug!(request_event_id = %target, "No listener for handle");
                }
            }
        }

        for error in response.errors {
            warn!(request_id = %request.request_id, error = %error.summary(), "Server reported error");
            for target in targets(ids, error.event_index()) {
                let mut error = error.clone();
                error.request_event_id = Some(target.clone());
                self.registry
                    .notify(target, ResponseNotification::ServerError(error));
            }
        }

        for warning in response.warnings {
            debug!(request_id = %request.request_id, warning = %warning.summary(), "Server warning");
            for target in targets(ids, warning.event_index()) {
                let mut warning = warning.clone();
                warning.request_event_id = Some(target.clone());
                self.registry
                    .notify(target, ResponseNotification::Warning(warning));
            }
        }

        for id in ids {
            self.registry.complete(id);
        }
        persisted
    }

    /// Report a permanent failure to every listener of the request.
    pub fn handle_failure(&self, request_event_ids: &[String], error: &EdgeEventError) {
        for id in request_event_ids {
            let mut error = error.clone();
            error.request_event_id = Some(id.clone());
            self.registry.fail(id, error);
        }
    }

    /// Store payloads and the location hint are written independently; the
    /// first error is returned once both have been attempted.
    async fn persist(&self, response: &EdgeResponse) -> DispatchResult<()> {
        let mut payloads = Vec::new();
        let mut hints = Vec::new();
        for handle in &response.handle {
            match handle.kind {
                HandleKind::StateStore => {
                    payloads.extend(decode_payloads::<StoreResponsePayload>(handle));
                }
                HandleKind::LocationHint => {
                    hints.extend(
                        decode_payloads::<LocationHintPayload>(handle)
                            .into_iter()
                            .filter(|hint| hint.scope == EDGE_NETWORK_SCOPE),
                    );
                }
                _ => {}
            }
        }

        let stored = self.store.upsert(payloads).await;
        let mut hinted = Ok(());
        for hint in hints {
            let ttl = if hint.ttl_seconds > 0 {
                hint.ttl_seconds
            } else {
                DEFAULT_LOCATION_HINT_TTL_SECS
            };
            if let Err(e) = self.store.set_location_hint(Some(&hint.hint), ttl).await {
                warn!(error = %e, "Failed to persist location hint");
                hinted = Err(e);
                break;
            }
        }
        stored.and(hinted)
    }
}

fn decode_payloads<T: serde::de::DeserializeOwned>(handle: &EventHandle) -> Vec<T> {
    handle
        .payload
        .iter()
        .filter_map(|raw| match serde_json::from_value(raw.clone()) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(kind = handle.kind.as_str(), error = %e, "Skipping malformed handle payload");
                None
            }
        })
        .collect()
}

/// The listener an `eventIndex` points at, or all of them when untagged or
/// out of range.
fn targets(ids: &[String], event_index: Option<usize>) -> &[String] {
    match event_index {
        Some(index) if index < ids.len() => &ids[index..=index],
        _ => ids,
    }
}
