//! Transport-level retry with exponential backoff and jitter.
//!
//! [`BackoffConfig`] controls how transient HTTP errors (429, 5xx) are
//! retried with increasing delays before a stream is established. Once a
//! chunk stream is live, failures surface as terminal `Error` chunks and
//! are never retried here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::events::{emit, EventHandler, PipelineEvent};

/// Configuration for transport-level retry with exponential backoff.
///
/// Handles transient HTTP errors (429 rate limit, 500/502/503 server
/// errors, connection failures) by retrying the connection attempt with
/// increasing delays.
///
/// # Example
///
/// ```
/// use completion_pipeline::backoff::BackoffConfig;
///
/// let none = BackoffConfig::none();
/// assert_eq!(none.max_retries, 0);
///
/// let standard = BackoffConfig::standard();
/// assert_eq!(standard.max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of transport retries. Default: 0 (no retry).
    pub max_retries: u32,

    /// Initial delay before the first retry. Default: 1 second.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry. Default: 2.0.
    pub multiplier: f64,

    /// Maximum delay between retries. Default: 60 seconds.
    pub max_delay: Duration,

    /// Jitter strategy. Default: Full.
    pub jitter: JitterStrategy,

    /// HTTP status codes that trigger retry. Default: `[429, 500, 502, 503, 504]`.
    pub retryable_statuses: Vec<u16>,

    /// Whether to honor `Retry-After` headers from the provider.
    /// Default: `true`.
    pub respect_retry_after: bool,
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// No jitter. Delay is exactly the calculated value.
    None,
    /// Full jitter: random value in `[0, calculated_delay]`.
    Full,
    /// Equal jitter: `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

impl BackoffConfig {
    /// No transport retry. For local providers or when the caller handles
    /// errors itself.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Sensible defaults for cloud APIs: 3 retries, 1s initial, 2x
    /// multiplier, 60s max, full jitter, honors Retry-After.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// Conservative retry for interactive use (a user is waiting):
    /// 2 retries, 500ms initial, 10s max.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// Calculate the delay for attempt N (0-indexed).
    ///
    /// The base delay is `initial_delay * multiplier^attempt`, capped at
    /// `max_delay`, with jitter applied afterwards.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}

/// Whether an error warrants a transport retry under this config.
///
/// Retryable conditions:
/// - [`PipelineError::HttpError`] with a status in `retryable_statuses`
/// - [`PipelineError::Request`] (connection/transport errors)
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) => true,
        _ => false,
    }
}

/// Run a connection attempt with retry and exponential backoff.
///
/// `attempt` is invoked up to `max_retries + 1` times; the first success
/// wins. A [`PipelineEvent::TransportRetry`] is emitted before each
/// retry. Cancellation is checked before every attempt and again after
/// each sleep.
pub async fn with_backoff<T, F, Fut>(
    config: &BackoffConfig,
    cancel: Option<&CancelToken>,
    events: &Option<Arc<dyn EventHandler>>,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<PipelineError> = None;

    for n in 0..=config.max_retries {
        if cancel.is_some_and(|t| t.is_cancelled()) {
            return Err(PipelineError::Cancelled);
        }

        if n > 0 {
            let delay = match &last_error {
                Some(PipelineError::HttpError {
                    retry_after: Some(ra),
                    ..
                }) if config.respect_retry_after => *ra,
                _ => config.delay_for_attempt(n - 1),
            };
            emit(
                events,
                PipelineEvent::TransportRetry {
                    attempt: n,
                    delay_ms: delay.as_millis() as u64,
                    reason: last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                },
            );
            tokio::time::sleep(delay).await;
            if cancel.is_some_and(|t| t.is_cancelled()) {
                return Err(PipelineError::Cancelled);
            }
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if n < config.max_retries && is_retryable(&e, config) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| PipelineError::Other("backoff loop exited unexpectedly".into())))
}
