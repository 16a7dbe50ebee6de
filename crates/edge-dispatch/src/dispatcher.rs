//! Application-facing entry point.

use crate::consent::{ConsentChange, ConsentGate, GateDecision};
use crate::correlator::{
    CompletionRegistry, Disposition, ResponseCorrelator, ResponseHandle,
    DEFAULT_LOCATION_HINT_TTL_SECS,
};
use crate::processor::{self, DispatchDiagnostic, Shared, SharedStates};
use crate::queue::HitQueue;
use crate::request::ImplementationDetails;
use crate::sender::{HttpTransport, NetworkDispatcher, ReqwestTransport, SenderConfig};
use crate::store::PersistentStore;
use crate::{DispatchError, DispatchResult};
use chrono::{DateTime, Utc};
use edge_config_and_utils::{Config, Paths};
use edge_database::AsyncDatabase;
use edge_protocol_types::{
    ConsentStatus, EdgeConfiguration, EdgeHit, EventEnvelope, ExperienceEvent, IdentityMap,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const DIAGNOSTICS_CAPACITY: usize = 64;

/// Dispatcher construction options.
#[derive(Debug, Clone, Default)]
pub struct DispatcherOptions {
    pub sender: SenderConfig,
    pub implementation: ImplementationDetails,
    /// Replaces scheme and host of every request URL.
    pub endpoint_override: Option<Url>,
}

impl DispatcherOptions {
    pub fn from_config(config: &Config) -> DispatchResult<Self> {
        config.validate()?;
        Ok(Self {
            sender: SenderConfig::from(config),
            implementation: ImplementationDetails::default(),
            endpoint_override: config.endpoint_override()?,
        })
    }
}

/// Queue and listener counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Entries waiting in the hit queue.
    pub queued: usize,
    /// Events waiting for consent.
    pub held: usize,
    /// Registered response listeners.
    pub listeners: usize,
    /// Events dropped for consent since start.
    pub dropped: u64,
}

/// Accepts events and shared-state updates and owns the processor task.
pub struct EdgeDispatcher {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    processor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl EdgeDispatcher {
    /// Open over `db` and start processing.
    pub async fn open(
        db: AsyncDatabase,
        options: DispatcherOptions,
        transport: Arc<dyn HttpTransport>,
    ) -> DispatchResult<Self> {
        let queue = HitQueue::open(db.clone()).await?;
        let store = PersistentStore::new(db);
        let correlator = ResponseCorrelator::new(store.clone(), CompletionRegistry::new());
        let (diagnostics, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);

        let shared = Arc::new(Shared {
            queue,
            gate: ConsentGate::new(),
            store,
            correlator,
            network: NetworkDispatcher::new(transport, &options.sender),
            states: RwLock::new(SharedStates::default()),
            admission: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            diagnostics,
            implementation: options.implementation,
            endpoint_override: options.endpoint_override,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let processor = tokio::spawn(processor::run(shared.clone(), shutdown_rx));

        info!("Edge dispatcher started");
        Ok(Self {
            shared,
            shutdown,
            processor: parking_lot::Mutex::new(Some(processor)),
        })
    }

    /// Open with the database and HTTP client described by local settings.
    pub async fn from_config(config: &Config, paths: &Paths) -> DispatchResult<Self> {
        paths.ensure_dirs()?;
        let options = DispatcherOptions::from_config(config)?;
        let db = AsyncDatabase::open(&config.database_path(paths)).await?;
        let transport = Arc::new(ReqwestTransport::new(&options.sender)?);
        Self::open(db, options, transport).await
    }

    /// Stop the processor, abandoning any in-flight request or retry wait.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.processor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Hit processor task failed");
            }
        }
    }

    /// Submit an experience event.
    ///
    /// The listener is registered before the event becomes visible to the
    /// processor, so no response can be missed.
    pub async fn send_event(&self, event: ExperienceEvent) -> DispatchResult<ResponseHandle> {
        if !event.is_valid() {
            return Err(DispatchError::InvalidEvent(
                "xdm must be a non-empty object".to_string(),
            ));
        }

        let _admission = self.shared.admission.lock().await;
        let status = self.shared.gate.current().await;
        let envelope = EventEnvelope::new(event, status);
        let request_event_id = envelope.request_event_id.clone();
        let registry = self.shared.correlator.registry();
        let hit = EdgeHit::experience(envelope);

        match GateDecision::from(status) {
            GateDecision::Allow => {
                let handle = registry.register(&request_event_id, Disposition::Queued);
                if let Err(e) = self.shared.queue.enqueue(hit).await {
                    registry.remove(&request_event_id);
                    return Err(e);
                }
                self.shared.wake.notify_one();
                Ok(handle)
            }
            GateDecision::Hold => {
                let handle = registry.register(&request_event_id, Disposition::Held);
                if let Err(e) = self.shared.queue.hold(&hit).await {
                    registry.remove(&request_event_id);
                    return Err(e);
                }
                Ok(handle)
            }
            GateDecision::Drop => {
                self.shared.gate.record_drop();
                self.shared.emit(DispatchDiagnostic::EventDropped {
                    request_event_id: request_event_id.clone(),
                });
                Ok(registry.register(&request_event_id, Disposition::Dropped))
            }
        }
    }

    /// Send a consent preferences update (`{"consents": {...}}`).
    ///
    /// Its `collect.val` takes effect locally at once unless a consent
    /// collaborator owns consent.
    pub async fn update_consents(&self, consents: Value) -> DispatchResult<ResponseHandle> {
        if !consents.is_object() {
            return Err(DispatchError::InvalidEvent(
                "consents must be an object".to_string(),
            ));
        }

        let _admission = self.shared.admission.lock().await;
        let status = ConsentStatus::from_consents(&consents);
        let hit = EdgeHit::consent_update(consents);
        let request_event_id = hit
            .request_event_ids()
            .into_iter()
            .next()
            .unwrap_or_default();
        let registry = self.shared.correlator.registry();
        let handle = registry.register(&request_event_id, Disposition::Queued);

        if let Some(status) = status {
            let change = self.shared.gate.set_local(status).await;
            self.apply_consent_change(change).await?;
        }

        if let Err(e) = self.shared.queue.enqueue(hit).await {
            registry.remove(&request_event_id);
            return Err(e);
        }
        self.shared.wake.notify_one();
        Ok(handle)
    }

    /// Configuration shared state changed.
    pub async fn update_configuration(&self, state: &Value) -> DispatchResult<()> {
        let configuration = EdgeConfiguration::from_shared_state(state);
        debug!(
            config_id = configuration.config_id.as_deref().unwrap_or(""),
            environment = ?configuration.environment,
            "Configuration updated"
        );

        let _admission = self.shared.admission.lock().await;
        let default_consent = configuration.default_consent;
        self.shared.states.write().await.configuration = configuration;
        let change = self.shared.gate.set_default(default_consent).await;
        if change.changed() {
            self.apply_consent_change(change).await?;
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Identity shared state changed.
    pub async fn update_identity(&self, state: &Value) {
        self.shared.states.write().await.identity = IdentityMap::from_shared_state(state);
    }

    /// Consent shared state changed. Held events are re-evaluated on every
    /// call.
    pub async fn update_consent_state(&self, state: &Value) -> DispatchResult<()> {
        let _admission = self.shared.admission.lock().await;
        let status = ConsentStatus::from_consents(state);
        let change = self.shared.gate.set_collaborator_status(status).await;
        self.apply_consent_change(change).await
    }

    /// Assurance shared state changed (`integrationid`).
    pub async fn update_assurance(&self, state: &Value) {
        let token = state
            .get("integrationid")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string);
        self.shared.states.write().await.validation_token = token;
    }

    /// Lifecycle shared state changed. Object fields are merged into the
    /// top-level `xdm` of later experience requests.
    pub async fn update_lifecycle(&self, state: &Value) {
        self.shared.states.write().await.lifecycle = state.as_object().cloned();
    }

    /// Clear store payloads and the location hint.
    pub async fn reset_identities(&self) -> DispatchResult<DateTime<Utc>> {
        self.shared.store.reset_identities().await
    }

    pub async fn location_hint(&self) -> DispatchResult<Option<String>> {
        self.shared.store.location_hint().await
    }

    /// Set or clear the location hint. `ttl_secs` defaults to 30 minutes.
    pub async fn set_location_hint(
        &self,
        hint: Option<&str>,
        ttl_secs: Option<i64>,
    ) -> DispatchResult<()> {
        self.shared
            .store
            .set_location_hint(hint, ttl_secs.unwrap_or(DEFAULT_LOCATION_HINT_TTL_SECS))
            .await
    }

    /// Subscribe to queue-wide diagnostics.
    pub fn diagnostics(&self) -> broadcast::Receiver<DispatchDiagnostic> {
        self.shared.diagnostics.subscribe()
    }

    pub async fn queue_status(&self) -> DispatchResult<QueueStatus> {
        Ok(QueueStatus {
            queued: self.shared.queue.len().await?,
            held: self.shared.queue.held_count().await?,
            listeners: self.shared.correlator.registry().len(),
            dropped: self.shared.gate.dropped_count(),
        })
    }

    pub async fn consent(&self) -> ConsentStatus {
        self.shared.gate.current().await
    }

    /// Re-evaluate the wait set and queue against the current consent.
    /// Callers hold the admission lock.
    async fn apply_consent_change(&self, change: ConsentChange) -> DispatchResult<()> {
        let registry = self.shared.correlator.registry();
        match change.current {
            ConsentStatus::Yes => {
                let released = self.shared.queue.release_held().await?;
                if !released.is_empty() {
                    debug!(count = released.len(), "Held events queued");
                }
            }
            ConsentStatus::No => {
                let held = self.shared.queue.discard_held().await?;
                let queued = self.shared.queue.clear().await?;
                let dropped = held
                    .iter()
                    .chain(queued.iter().map(|entry| &entry.hit))
                    .flat_map(EdgeHit::request_event_ids);
                for request_event_id in dropped {
                    registry.drop_listener(&request_event_id);
                    self.shared.gate.record_drop();
                    self.shared
                        .emit(DispatchDiagnostic::EventDropped { request_event_id });
                }
            }
            ConsentStatus::Pending => {}
        }
        self.shared.wake.notify_one();
        Ok(())
    }
}

impl Drop for EdgeDispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
