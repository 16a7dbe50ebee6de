//! The hit processor task.
//!
//! Drains the hit queue strictly in sequence order, one request in flight at
//! a time. The task parks when the queue is empty, when configuration is
//! missing, or while consent is pending, and wakes on [`Shared::wake`].

use crate::consent::{ConsentGate, GateDecision};
use crate::correlator::ResponseCorrelator;
use crate::queue::{HitEntry, HitQueue, ProcessorGuard};
use crate::request::{ImplementationDetails, RequestBuilder, RequestContext};
use crate::sender::{DispatchOutcome, NetworkDispatcher};
use crate::store::PersistentStore;
use crate::{DispatchError, DispatchResult};
use edge_protocol_types::{EdgeConfiguration, EdgeEventError, EdgeHit, IdentityMap};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

/// Pause before retrying after a local storage failure.
const STORAGE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Queue-wide conditions, published on the diagnostics channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchDiagnostic {
    /// The head entry cannot be sent until `edge.configId` is configured.
    ConfigurationMissing { sequence: i64 },
    /// Local persistence failed.
    StorageFailure { message: String },
    /// An event was discarded because collect consent is `no`.
    EventDropped { request_event_id: String },
    /// The head entry will be retried after `delay`.
    RetryScheduled { sequence: i64, delay: Duration },
}

/// Latest shared-state snapshots from other extensions.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedStates {
    pub configuration: EdgeConfiguration,
    pub identity: IdentityMap,
    pub validation_token: Option<String>,
    pub lifecycle: Option<Map<String, Value>>,
}

/// State shared by the dispatcher facade and the processor task.
pub(crate) struct Shared {
    pub queue: HitQueue,
    pub gate: ConsentGate,
    pub store: PersistentStore,
    pub correlator: ResponseCorrelator,
    pub network: NetworkDispatcher,
    pub states: RwLock<SharedStates>,
    /// Serializes event admission against consent changes.
    pub admission: Mutex<()>,
    pub wake: Notify,
    pub diagnostics: broadcast::Sender<DispatchDiagnostic>,
    pub implementation: ImplementationDetails,
    pub endpoint_override: Option<Url>,
}

impl Shared {
    pub fn emit(&self, diagnostic: DispatchDiagnostic) {
        // No subscribers is fine.
        let _ = self.diagnostics.send(diagnostic);
    }

    pub fn storage_failure(&self, e: &DispatchError) {
        error!(error = %e, "Storage failure");
        self.emit(DispatchDiagnostic::StorageFailure {
            message: e.to_string(),
        });
    }

    /// Snapshot everything a request is built from.
    pub async fn request_context(&self) -> DispatchResult<RequestContext> {
        let states = self.states.read().await.clone();
        Ok(RequestContext {
            configuration: states.configuration,
            identity: states.identity,
            consent: self.gate.record().await,
            store_payloads: self.store.snapshot().await?,
            location_hint: self.store.location_hint().await?,
            validation_token: states.validation_token,
            lifecycle: states.lifecycle,
            implementation: self.implementation.clone(),
            endpoint_override: self.endpoint_override.clone(),
        })
    }
}

enum Step {
    /// Go straight to the next entry.
    Continue,
    /// Wait for a wake-up.
    Park,
    /// Wait, then look at the head again.
    Sleep(Duration),
}

/// Run until `shutdown` flips or its sender is dropped.
pub(crate) async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let Some(guard) = shared.queue.acquire_processor() else {
        warn!("Hit processor already running");
        return;
    };

    info!("Hit processor started");
    let mut reported_missing: Option<i64> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let step = tokio::select! {
            _ = shutdown.changed() => break,
            step = process_head(&shared, &guard, &mut reported_missing) => step,
        };

        match step {
            Step::Continue => {}
            Step::Park => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = shared.wake.notified() => {}
                }
            }
            Step::Sleep(delay) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("Hit processor stopped");
}

async fn process_head(
    shared: &Shared,
    guard: &ProcessorGuard,
    reported_missing: &mut Option<i64>,
) -> Step {
    let entry = match shared.queue.process_next(guard).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return Step::Park,
        Err(e) => {
            shared.storage_failure(&e);
            return Step::Sleep(STORAGE_RETRY_DELAY);
        }
    };

    if let EdgeHit::ExperienceEvent { envelope } = &entry.hit {
        match shared.gate.evaluate().await {
            GateDecision::Allow => {}
            GateDecision::Hold => {
                debug!(sequence = entry.sequence, "Collect consent pending, queue parked");
                return Step::Park;
            }
            GateDecision::Drop => {
                shared.gate.record_drop();
                shared.correlator.registry().drop_listener(&envelope.request_event_id);
                shared.emit(DispatchDiagnostic::EventDropped {
                    request_event_id: envelope.request_event_id.clone(),
                });
                return remove(shared, &entry).await;
            }
        }
    }

    let ctx = match shared.request_context().await {
        Ok(ctx) => ctx,
        Err(e) => {
            shared.storage_failure(&e);
            return Step::Sleep(STORAGE_RETRY_DELAY);
        }
    };

    let request = match RequestBuilder::build(&entry, &ctx) {
        Ok(request) => request,
        Err(DispatchError::MissingConfiguration) => {
            if *reported_missing != Some(entry.sequence) {
                warn!(sequence = entry.sequence, "Missing edge.configId, holding queue");
                shared.emit(DispatchDiagnostic::ConfigurationMissing {
                    sequence: entry.sequence,
                });
                *reported_missing = Some(entry.sequence);
            }
            return Step::Park;
        }
        Err(e) => {
            error!(sequence = entry.sequence, error = %e, "Cannot build request");
            shared.correlator.handle_failure(
                &entry.hit.request_event_ids(),
                &EdgeEventError::local(None, "Invalid request", Some(e.to_string())),
            );
            return remove(shared, &entry).await;
        }
    };

    match shared.network.send(&request).await {
        DispatchOutcome::Success { status, response } => {
            info!(
                sequence = entry.sequence,
                request_id = %request.request_id,
                status,
                handles = response.handle.len(),
                "Hit delivered"
            );
            if let Err(e) = shared.correlator.handle_success(&request, response).await {
                shared.storage_failure(&e);
            }
            remove(shared, &entry).await
        }
        DispatchOutcome::RetryableFailure { delay, reason } => {
            warn!(
                sequence = entry.sequence,
                attempts = entry.attempts + 1,
                delay_secs = delay.as_secs_f64(),
                reason = %reason,
                "Hit send failed, will retry"
            );
            if let Err(e) = shared.queue.record_attempt(entry.sequence, &reason).await {
                shared.storage_failure(&e);
            }
            shared.emit(DispatchDiagnostic::RetryScheduled {
                sequence: entry.sequence,
                delay,
            });
            Step::Sleep(delay)
        }
        DispatchOutcome::NonRetryableFailure(failure) => {
            warn!(
                sequence = entry.sequence,
                request_id = %request.request_id,
                error = %failure.summary(),
                "Hit rejected"
            );
            shared
                .correlator
                .handle_failure(&request.request_event_ids, &failure);
            remove(shared, &entry).await
        }
    }
}

async fn remove(shared: &Shared, entry: &HitEntry) -> Step {
    match shared.queue.remove(entry.sequence).await {
        Ok(_) => Step::Continue,
        Err(e) => {
            shared.storage_failure(&e);
            Step::Sleep(STORAGE_RETRY_DELAY)
        }
    }
}
