//! Request building.

use crate::queue::HitEntry;
use crate::store::StorePayload;
use crate::{DispatchError, DispatchResult};
use edge_protocol_types::{ConsentRecord, EdgeConfiguration, EdgeHit, EventEnvelope, IdentityMap};
use serde_json::{json, Map, Value};
use url::Url;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_VALIDATION_TOKEN: &str = "X-Adobe-AEP-Validation-Token";
pub const CONTENT_TYPE_JSON: &str = "application/json";

const INTERACT_PATH: &str = "v1/interact";
const CONSENT_PATH: &str = "v1/privacy/set-consent";

/// `xdm.implementationDetails` of every experience request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplementationDetails {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl Default for ImplementationDetails {
    fn default() -> Self {
        Self {
            name: format!("https://ns.adobe.com/experience/{}", env!("CARGO_PKG_NAME")),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "app".to_string(),
        }
    }
}

impl ImplementationDetails {
    fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "version": self.version,
            "environment": self.environment,
        })
    }
}

/// Everything a request is built from, captured at one instant.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub configuration: EdgeConfiguration,
    pub identity: IdentityMap,
    pub consent: ConsentRecord,
    pub store_payloads: Vec<StorePayload>,
    pub location_hint: Option<String>,
    pub validation_token: Option<String>,
    /// Lifecycle fields merged into the top-level `xdm`.
    pub lifecycle: Option<Map<String, Value>>,
    pub implementation: ImplementationDetails,
    /// Replaces scheme and host of the collection endpoint.
    pub endpoint_override: Option<Url>,
}

/// A fully built POST to the collection endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub request_id: String,
    /// Position `i` is the event the server calls `eventIndex = i`.
    pub request_event_ids: Vec<String>,
}

impl EdgeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Turns queue entries into requests.
pub struct RequestBuilder;

impl RequestBuilder {
    pub fn build(entry: &HitEntry, ctx: &RequestContext) -> DispatchResult<EdgeRequest> {
        let config_id = ctx
            .configuration
            .config_id()
            .ok_or(DispatchError::MissingConfiguration)?;

        let (path, body) = match &entry.hit {
            EdgeHit::ExperienceEvent { envelope } => {
                (INTERACT_PATH, Self::experience_body(envelope, ctx))
            }
            EdgeHit::ConsentUpdate { consents, .. } => {
                (CONSENT_PATH, Self::consent_body(consents, ctx))
            }
        };

        let mut url = Self::endpoint(ctx, path)?;
        url.query_pairs_mut()
            .append_pair("configId", config_id)
            .append_pair("requestId", entry.hit.request_id());

        let mut headers = vec![
            (HEADER_ACCEPT.to_string(), CONTENT_TYPE_JSON.to_string()),
            (HEADER_CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string()),
        ];
        if let Some(token) = ctx.validation_token.as_deref().filter(|t| !t.is_empty()) {
            headers.push((HEADER_VALIDATION_TOKEN.to_string(), token.to_string()));
        }

        Ok(EdgeRequest {
            url,
            headers,
            body,
            request_id: entry.hit.request_id().to_string(),
            request_event_ids: entry.hit.request_event_ids(),
        })
    }

    /// `{base}/{prefix}[/{hint}]/v1/interact` for events,
    /// `{base}/{prefix}/v1/privacy/set-consent` for consent updates.
    fn endpoint(ctx: &RequestContext, path: &str) -> DispatchResult<Url> {
        let env = ctx.configuration.environment;
        let base = match &ctx.endpoint_override {
            Some(url) => url.as_str().trim_end_matches('/').to_string(),
            None => {
                let host = ctx
                    .configuration
                    .domain
                    .as_deref()
                    .map(|d| d.trim_start_matches("https://").trim_end_matches('/'))
                    .filter(|d| !d.is_empty())
                    .unwrap_or(env.host());
                format!("https://{}", host)
            }
        };

        let hint = match (path, ctx.location_hint.as_deref()) {
            (INTERACT_PATH, Some(hint)) if !hint.is_empty() => format!("/{}", hint),
            _ => String::new(),
        };

        Ok(Url::parse(&format!(
            "{}/{}{}/{}",
            base,
            env.path_prefix(),
            hint,
            path
        ))?)
    }

    fn experience_body(envelope: &EventEnvelope, ctx: &RequestContext) -> Value {
        let mut xdm = Map::new();
        if let Some(lifecycle) = &ctx.lifecycle {
            for (key, value) in lifecycle {
                xdm.insert(key.clone(), value.clone());
            }
        }
        if !ctx.identity.is_empty() {
            xdm.insert("identityMap".to_string(), ctx.identity.to_value());
        }
        xdm.insert(
            "implementationDetails".to_string(),
            ctx.implementation.to_value(),
        );

        let mut meta = Map::new();
        if let Some(dataset_id) = &envelope.dataset_id {
            meta.insert("collect".to_string(), json!({ "datasetId": dataset_id }));
        }
        meta.insert(
            "consent".to_string(),
            json!([ctx.consent.to_request_block()]),
        );
        if let Some(state) = Self::state_block(&ctx.store_payloads) {
            meta.insert("state".to_string(), state);
        }

        json!({
            "xdm": xdm,
            "events": [envelope.to_request_event()],
            "meta": meta,
        })
    }

    fn consent_body(consents: &Value, ctx: &RequestContext) -> Value {
        let value = consents.get("consents").unwrap_or(consents);

        let mut body = Map::new();
        if !ctx.identity.is_empty() {
            body.insert("identityMap".to_string(), ctx.identity.to_value());
        }
        body.insert(
            "consent".to_string(),
            json!([{
                "standard": ctx.consent.standard,
                "version": ctx.consent.version,
                "value": value,
            }]),
        );
        if let Some(state) = Self::state_block(&ctx.store_payloads) {
            body.insert("meta".to_string(), json!({ "state": state }));
        }
        Value::Object(body)
    }

    fn state_block(payloads: &[StorePayload]) -> Option<Value> {
        if payloads.is_empty() {
            return None;
        }
        let entries: Vec<Value> = payloads
            .iter()
            .map(|p| json!({ "key": p.key, "value": p.value, "maxAge": p.max_age_secs }))
            .collect();
        Some(json!({ "entries": entries }))
    }
}
