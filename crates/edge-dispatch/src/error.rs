//! Dispatch error types.

use thiserror::Error;

/// Dispatch error type.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No `edge.configId` in the configuration shared state.
    #[error("Missing configuration: edge.configId is not set")]
    MissingConfiguration,

    /// Collect consent is `no`; the event was dropped.
    #[error("Consent denied")]
    ConsentDenied,

    /// Connection failure, timeout, 429 or 503: retried with server pacing.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Non-retryable HTTP status or malformed payload.
    #[error("Request failed: {0}")]
    PermanentRequest(String),

    /// Structured error inside an otherwise successful response.
    #[error("Server reported error: {0}")]
    ServerReported(String),

    /// The application event cannot be sent.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Queue misuse or corrupted queue state.
    #[error("Queue error: {0}")]
    Queue(String),

    /// The dispatcher stopped before the request finished.
    #[error("Dispatcher shut down")]
    ShutDown,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] edge_database::DatabaseError),

    /// Local settings error
    #[error("Config error: {0}")]
    Core(#[from] edge_config_and_utils::CoreError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;
