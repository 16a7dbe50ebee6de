//! Shared-state snapshots published by other extensions.

use crate::ConsentStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Collection endpoint environment (`edge.environment`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeEnvironment {
    #[default]
    Production,
    PreProduction,
    Integration,
}

impl EdgeEnvironment {
    /// `prod`, `pre-prod`, `int`; anything else is production.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pre-prod" | "preprod" => Self::PreProduction,
            "int" | "integration" => Self::Integration,
            _ => Self::Production,
        }
    }

    pub fn host(&self) -> &'static str {
        match self {
            Self::Production | Self::PreProduction => "edge.adobedc.net",
            Self::Integration => "edge-int.adobedc.net",
        }
    }

    /// First path segment of the interact endpoint.
    pub fn path_prefix(&self) -> &'static str {
        match self {
            Self::Production | Self::Integration => "ee",
            Self::PreProduction => "ee-pre-prd",
        }
    }
}

/// Configuration shared state, reduced to what request building needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfiguration {
    pub config_id: Option<String>,
    pub org_id: Option<String>,
    pub environment: EdgeEnvironment,
    /// Custom first-party domain replacing the default host.
    pub domain: Option<String>,
    /// `consent.default` → `consents.collect.val`.
    pub default_consent: Option<ConsentStatus>,
}

impl EdgeConfiguration {
    /// Read the flat configuration document (`edge.configId`, ...).
    pub fn from_shared_state(state: &Value) -> Self {
        let text = |key: &str| {
            state
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            config_id: text("edge.configId"),
            org_id: text("experienceCloud.org"),
            environment: text("edge.environment")
                .map(|raw| EdgeEnvironment::parse(&raw))
                .unwrap_or_default(),
            domain: text("edge.domain"),
            default_consent: state
                .get("consent.default")
                .and_then(ConsentStatus::from_consents),
        }
    }

    /// The configured `edge.configId`, if present and non-empty.
    pub fn config_id(&self) -> Option<&str> {
        self.config_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Identity shared state (`identityMap`), forwarded verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityMap(pub Map<String, Value>);

impl IdentityMap {
    /// Read `identityMap` from an identity shared-state document.
    pub fn from_shared_state(state: &Value) -> Self {
        state
            .get("identityMap")
            .and_then(Value::as_object)
            .cloned()
            .map(Self)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_configuration_from_shared_state() {
        let config = EdgeConfiguration::from_shared_state(&json!({
            "edge.configId": "cfg-123",
            "experienceCloud.org": "ORG@AdobeOrg",
            "edge.environment": "int",
            "edge.domain": "  ",
            "consent.default": { "consents": { "collect": { "val": "p" } } }
        }));
        assert_eq!(config.config_id.as_deref(), Some("cfg-123"));
        assert_eq!(config.environment, EdgeEnvironment::Integration);
        assert!(config.domain.is_none());
        assert_eq!(config.default_consent, Some(ConsentStatus::Pending));
        assert_eq!(config.config_id(), Some("cfg-123"));
    }

    #[test]
    fn test_missing_config_id() {
        let config = EdgeConfiguration::from_shared_state(&json!({ "edge.configId": "" }));
        assert!(config.config_id().is_none());
        assert_eq!(config.environment, EdgeEnvironment::Production);
    }

    #[test]
    fn test_environment_hosts() {
        assert_eq!(EdgeEnvironment::parse("pre-prod").path_prefix(), "ee-pre-prd");
        assert_eq!(EdgeEnvironment::Integration.host(), "edge-int.adobedc.net");
        assert_eq!(EdgeEnvironment::parse("anything"), EdgeEnvironment::Production);
    }

    #[test]
    fn test_identity_map() {
        let identity = IdentityMap::from_shared_state(&json!({
            "identityMap": { "ECID": [{ "id": "123", "primary": true }] }
        }));
        assert!(!identity.is_empty());
        assert_eq!(identity.to_value()["ECID"][0]["id"], "123");
        assert!(IdentityMap::from_shared_state(&json!({})).is_empty());
    }
}
