//! Consent-gated, durable dispatch of experience events to the edge
//! collection endpoint.
//!
//! This crate provides:
//! - [`EdgeDispatcher`]: accepts events and shared-state updates, owns the
//!   processor task
//! - [`HitQueue`]: SQLite-backed queue with a single processor at a time
//! - [`ConsentGate`]: allow / hold / drop per collect consent
//! - [`RequestBuilder`] and [`NetworkDispatcher`]: one request per entry,
//!   classified by status and `Retry-After`
//! - [`ResponseCorrelator`]: applies `state:store` payloads and routes
//!   handles back to [`ResponseHandle`]s
//!
//! ```ignore
//! let dispatcher = EdgeDispatcher::from_config(&config, &paths).await?;
//! dispatcher.update_configuration(&json!({ "edge.configId": "..." })).await?;
//! let handle = dispatcher.send_event(ExperienceEvent::new(xdm)).await?;
//! let handles = handle.wait().await.into_result()?;
//! ```

mod consent;
mod correlator;
mod dispatcher;
mod error;
mod processor;
mod queue;
mod request;
mod sender;
mod store;

pub use consent::{ConsentChange, ConsentGate, GateDecision};
pub use correlator::{
    CompletionRegistry, Disposition, EdgeResponse, ResponseCorrelator, ResponseHandle,
    ResponseOutcome, DEFAULT_LOCATION_HINT_TTL_SECS,
};
pub use dispatcher::{DispatcherOptions, EdgeDispatcher, QueueStatus};
pub use error::{DispatchError, DispatchResult};
pub use processor::DispatchDiagnostic;
pub use queue::{HitEntry, HitQueue, ProcessorGuard};
pub use request::{
    EdgeRequest, ImplementationDetails, RequestBuilder, RequestContext, CONTENT_TYPE_JSON,
    HEADER_ACCEPT, HEADER_CONTENT_TYPE, HEADER_VALIDATION_TOKEN,
};
pub use sender::{
    classify, parse_retry_after, DispatchOutcome, HttpResponse, HttpTransport, NetworkDispatcher,
    ReqwestTransport, SenderConfig,
};
pub use store::{PersistentStore, StorePayload};

pub use edge_protocol_types::{
    ConsentStatus, EdgeEventError, EventHandle, ExperienceEvent, HandleKind,
    ResponseNotification,
};
