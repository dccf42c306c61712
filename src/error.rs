use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The request was cancelled via its cancellation token.
    #[error("Request was cancelled")]
    Cancelled,

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A composer edit referenced a stage name that is not in the chain.
    ///
    /// Non-fatal: the chain is left unchanged and remains usable.
    #[error("No middleware stage named '{0}'")]
    UnknownStage(String),

    /// Tool-call recursion exceeded the hard depth ceiling.
    #[error("Tool recursion limit exceeded at depth {depth} (max {max})")]
    RecursionLimit {
        /// The depth the next round would have reached.
        depth: u32,
        /// The configured ceiling.
        max: u32,
    },

    /// A provider call failed before any stream was produced.
    #[error("Provider call failed: {0}")]
    Provider(String),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by transport helpers when the provider responds with a
    /// non-success status. `retry_after` is populated from the `Retry-After`
    /// response header when present.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
