//! Data types shared by the edge dispatch crates.
//!
//! - [`ExperienceEvent`] / [`EventEnvelope`] / [`EdgeHit`]: what the application
//!   submits and what the hit queue persists
//! - [`ConsentStatus`] / [`ConsentRecord`]: collect consent
//! - [`EdgeConfiguration`], [`IdentityMap`]: shared-state snapshots
//! - [`EventHandle`], [`EdgeEventError`], [`ResponseNotification`]: what the
//!   collection endpoint sends back and what listeners receive

mod consent;
mod envelope;
mod handle;
mod shared_state;

pub use consent::{ConsentRecord, ConsentStatus, CONSENT_STANDARD, CONSENT_VERSION};
pub use envelope::{format_timestamp, EdgeHit, EventEnvelope, ExperienceEvent, EDGE_EVENT_TYPE};
pub use handle::{
    EdgeEventError, ErrorReport, EventHandle, HandleKind, LocationHintPayload,
    ResponseNotification, StoreResponsePayload, EDGE_NETWORK_SCOPE,
};
pub use shared_state::{EdgeConfiguration, EdgeEnvironment, IdentityMap};
