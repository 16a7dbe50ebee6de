//! Consent gate.
//!
//! Resolves the effective collect consent and decides, per event, whether it
//! may be queued, must wait, or is dropped.

use edge_protocol_types::{ConsentRecord, ConsentStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// What to do with an event under the current consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Queue for dispatch.
    Allow,
    /// Keep in the wait set until consent is resolved.
    Hold,
    /// Discard without any network activity.
    Drop,
}

impl From<ConsentStatus> for GateDecision {
    fn from(status: ConsentStatus) -> Self {
        match status {
            ConsentStatus::Yes => Self::Allow,
            ConsentStatus::Pending => Self::Hold,
            ConsentStatus::No => Self::Drop,
        }
    }
}

/// Old and new effective status after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentChange {
    pub previous: ConsentStatus,
    pub current: ConsentStatus,
}

impl ConsentChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Debug, Default)]
struct ConsentState {
    /// Published by the consent collaborator, if one is registered.
    collaborator: Option<ConsentStatus>,
    /// `consent.default` from configuration.
    configured_default: Option<ConsentStatus>,
    /// Set through consent update requests when no collaborator owns consent.
    local: Option<ConsentStatus>,
}

impl ConsentState {
    fn effective(&self) -> ConsentStatus {
        self.collaborator
            .or(self.local)
            .or(self.configured_default)
            .unwrap_or(ConsentStatus::Yes)
    }
}

/// Cached consent record with a single writer path per source.
#[derive(Debug, Default)]
pub struct ConsentGate {
    state: RwLock<ConsentState>,
    dropped: AtomicU64,
}

impl ConsentGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decision for an event arriving now.
    pub async fn evaluate(&self) -> GateDecision {
        self.current().await.into()
    }

    /// Effective status: collaborator, then local update, then configured
    /// default, then `yes`.
    pub async fn current(&self) -> ConsentStatus {
        self.state.read().await.effective()
    }

    /// The consent block for the next request.
    pub async fn record(&self) -> ConsentRecord {
        ConsentRecord::new(self.current().await)
    }

    pub async fn has_collaborator(&self) -> bool {
        self.state.read().await.collaborator.is_some()
    }

    /// Consent shared state published. `None` means the collaborator has no
    /// decision yet.
    pub async fn set_collaborator_status(&self, status: Option<ConsentStatus>) -> ConsentChange {
        self.update(|state| state.collaborator = status).await
    }

    /// Configuration shared state published.
    pub async fn set_default(&self, status: Option<ConsentStatus>) -> ConsentChange {
        self.update(|state| state.configured_default = status).await
    }

    /// Consent update request accepted. Ignored while a collaborator owns
    /// consent.
    pub async fn set_local(&self, status: ConsentStatus) -> ConsentChange {
        self.update(|state| {
            if state.collaborator.is_none() {
                state.local = Some(status);
            }
        })
        .await
    }

    async fn update(&self, apply: impl FnOnce(&mut ConsentState)) -> ConsentChange {
        let mut state = self.state.write().await;
        let previous = state.effective();
        apply(&mut state);
        let change = ConsentChange {
            previous,
            current: state.effective(),
        };
        drop(state);

        if change.changed() {
            info!(
                previous = change.previous.as_str(),
                current = change.current.as_str(),
                "Collect consent changed"
            );
        }
        change
    }

    /// Count an event dropped for consent.
    pub fn record_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(total, "Event dropped, collect consent is no");
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_to_yes() {
        let gate = ConsentGate::new();
        assert_eq!(gate.current().await, ConsentStatus::Yes);
        assert_eq!(gate.evaluate().await, GateDecision::Allow);
    }

    #[tokio::test]
    async fn test_configured_default_applies_without_collaborator() {
        let gate = ConsentGate::new();
        let change = gate.set_default(Some(ConsentStatus::Pending)).await;
        assert!(change.changed());
        assert_eq!(gate.evaluate().await, GateDecision::Hold);
    }

    #[tokio::test]
    async fn test_collaborator_overrides_default() {
        let gate = ConsentGate::new();
        gate.set_default(Some(ConsentStatus::Pending)).await;
        let change = gate.set_collaborator_status(Some(ConsentStatus::No)).await;
        assert_eq!(change.previous, ConsentStatus::Pending);
        assert_eq!(change.current, ConsentStatus::No);
        assert_eq!(gate.evaluate().await, GateDecision::Drop);
        assert!(gate.has_collaborator().await);
    }

    #[tokio::test]
    async fn test_local_update_ignored_when_collaborator_present() {
        let gate = ConsentGate::new();
        gate.set_local(ConsentStatus::No).await;
        assert_eq!(gate.current().await, ConsentStatus::No);

        gate.set_collaborator_status(Some(ConsentStatus::Yes)).await;
        let change = gate.set_local(ConsentStatus::No).await;
        assert!(!change.changed());
        assert_eq!(gate.current().await, ConsentStatus::Yes);
    }

    #[tokio::test]
    async fn test_record_block() {
        let gate = ConsentGate::new();
        gate.set_collaborator_status(Some(ConsentStatus::Pending)).await;
        let block = gate.record().await.to_request_block();
        assert_eq!(block["value"]["collect"]["val"], "p");
        assert_eq!(block["standard"], "Adobe");
    }

    #[test]
    fn test_drop_counter() {
        let gate = ConsentGate::new();
        gate.record_drop();
        gate.record_drop();
        assert_eq!(gate.dropped_count(), 2);
    }
}
