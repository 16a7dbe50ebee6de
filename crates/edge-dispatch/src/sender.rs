//! Network dispatcher: one HTTP exchange per call, classified into a
//! delivery outcome.

use crate::correlator::EdgeResponse;
use crate::request::EdgeRequest;
use crate::{DispatchError, DispatchResult};
use async_trait::async_trait;
use edge_config_and_utils::Config;
use edge_protocol_types::EdgeEventError;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub connect_timeout: Duration,
    /// Upper bound on the whole exchange once connected.
    pub read_timeout: Duration,
    /// Delay for retryable failures without a usable `Retry-After`.
    pub default_retry_delay: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            default_retry_delay: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for SenderConfig {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            default_retry_delay: Duration::from_secs(config.default_retry_delay_secs),
        }
    }
}

/// Raw HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// `Retry-After` header, verbatim.
    pub retry_after: Option<String>,
    pub body: String,
}

/// Performs the POST. Errors must be [`DispatchError::TransientNetwork`]
/// for anything that failed below HTTP.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, request: &EdgeRequest) -> DispatchResult<HttpResponse>;
}

/// Production transport.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &SenderConfig) -> DispatchResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.connect_timeout + config.read_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: &EdgeRequest) -> DispatchResult<HttpResponse> {
        let mut builder = self.client.post(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body.to_string())
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(network_error)?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn network_error(e: reqwest::Error) -> DispatchError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        DispatchError::TransientNetwork(e.to_string())
    } else {
        DispatchError::Http(e)
    }
}

/// Classified result of one exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success {
        status: u16,
        response: EdgeResponse,
    },
    /// Keep the entry at the head and try again after `delay`.
    RetryableFailure { delay: Duration, reason: String },
    /// Remove the entry and report the error to its listeners.
    NonRetryableFailure(EdgeEventError),
}

/// Sends requests and classifies the result.
pub struct NetworkDispatcher {
    transport: Arc<dyn HttpTransport>,
    default_retry_delay: Duration,
}

impl NetworkDispatcher {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &SenderConfig) -> Self {
        Self {
            transport,
            default_retry_delay: config.default_retry_delay,
        }
    }

    pub async fn send(&self, request: &EdgeRequest) -> DispatchOutcome {
        debug!(
            url = %request.url,
            request_id = %request.request_id,
            events = request.request_event_ids.len(),
            "Sending request"
        );

        match self.transport.post(request).await {
            Ok(response) => classify(response, self.default_retry_delay),
            Err(DispatchError::TransientNetwork(reason)) => {
                warn!(request_id = %request.request_id, error = %reason, "Network error");
                DispatchOutcome::RetryableFailure {
                    delay: self.default_retry_delay,
                    reason,
                }
            }
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Request could not be sent");
                DispatchOutcome::NonRetryableFailure(EdgeEventError::local(
                    None,
                    "Request failed",
                    Some(e.to_string()),
                ))
            }
        }
    }
}

/// Map a status to an outcome.
pub fn classify(response: HttpResponse, default_delay: Duration) -> DispatchOutcome {
    let status = response.status;
    match status {
        200..=299 => match EdgeResponse::parse(&response.body) {
            Ok(parsed) => DispatchOutcome::Success {
                status,
                response: parsed,
            },
            Err(e) => DispatchOutcome::NonRetryableFailure(EdgeEventError::local(
                Some(status),
                "Malformed response",
                Some(e.to_string()),
            )),
        },
        429 | 502 | 503 | 504 => DispatchOutcome::RetryableFailure {
            delay: parse_retry_after(response.retry_after.as_deref()).unwrap_or(default_delay),
            reason: format!("HTTP {}", status),
        },
        _ => {
            let mut error = serde_json::from_str::<EdgeEventError>(&response.body)
                .ok()
                .filter(|e| e.title.is_some() || e.message.is_some())
                .unwrap_or_else(|| {
                    EdgeEventError::local(
                        Some(status),
                        "Request failed",
                        Some(truncate(&response.body, 256)),
                    )
                });
            error.status.get_or_insert(status);
            DispatchOutcome::NonRetryableFailure(error)
        }
    }
}

/// `Retry-After` as whole seconds. Dates and garbage yield `None`.
pub fn parse_retry_after(raw: Option<&str>) -> Option<Duration> {
    raw?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
