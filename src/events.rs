//! Event system for pipeline lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe a request as it
//! moves through the middleware chain. Stages emit events when they are
//! entered, when configuration degrades, when tool rounds run, and when
//! transport retries or cancellation occur. Users can implement
//! [`EventHandler`] to receive these for logging or progress UIs.

use std::sync::Arc;

/// Events emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A middleware stage is about to run.
    StageStart {
        /// The stage's registered name.
        name: String,
    },
    /// A non-fatal configuration or runtime degradation.
    Warning {
        /// The stage reporting the condition.
        stage: &'static str,
        /// What went wrong and how the pipeline degraded.
        message: String,
    },
    /// A tool-execution round is starting.
    ToolRoundStart {
        /// Recursion depth of the round about to run (1-indexed).
        depth: u32,
        /// Names of the tools being executed.
        tools: Vec<String>,
    },
    /// One tool call finished.
    ToolResult {
        /// The call id the result answers.
        call_id: String,
        /// Whether the execution succeeded.
        ok: bool,
    },
    /// A transport-level retry of the provider call.
    TransportRetry {
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this attempt in milliseconds.
        delay_ms: u64,
        /// Reason for the retry (error description).
        reason: String,
    },
    /// The request was cancelled.
    Cancelled {
        /// Message id the cancellation token was scoped to.
        message_id: String,
    },
}

/// Handler for pipeline lifecycle events.
///
/// Entirely optional — the pipeline works without one.
///
/// # Example
///
/// ```
/// use completion_pipeline::events::{EventHandler, PipelineEvent};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: PipelineEvent) {
///         if let PipelineEvent::Warning { stage, message } = event {
///             eprintln!("[{stage}] {message}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when a stage emits an event.
    fn on_event(&self, event: PipelineEvent);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: PipelineEvent) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use completion_pipeline::events::{FnEventHandler, PipelineEvent};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: PipelineEvent| {
///     if let PipelineEvent::StageStart { name } = event {
///         eprintln!("entering {name}");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(PipelineEvent) + Send + Sync>(pub F);

impl<F: Fn(PipelineEvent) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: PipelineEvent) {
        (self.0)(event);
    }
}
