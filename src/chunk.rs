//! The normalized chunk vocabulary flowing through the pipeline.
//!
//! Every provider stream, whatever its wire shape, is adapted into a
//! sequence of [`Chunk`]s before the rest of the chain sees it. Each
//! stream the pipeline hands to a caller terminates in exactly one
//! terminal chunk: [`ResponseComplete`](Chunk::ResponseComplete) or
//! [`Error`](Chunk::Error) — never both, never neither. Cancellation
//! substitutes an `Error` terminal; a stream never just goes silent.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// A pinned, boxed, `Send` stream of [`Chunk`]s.
///
/// This is the type every middleware stage receives from its `next`
/// continuation and returns upward. Consume it with
/// [`StreamExt`](futures::StreamExt).
pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// One normalized event in the streaming vocabulary.
#[derive(Debug)]
pub enum Chunk {
    /// A fragment of the model's visible text output.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// The full accumulated text, synthesized once immediately before the
    /// terminal chunk.
    TextComplete {
        /// Full text with post-processing (citation links) applied.
        text: String,
    },
    /// A fragment of the model's reasoning output.
    ThinkingDelta {
        /// The reasoning fragment.
        text: String,
        /// Milliseconds since reasoning started for this block.
        elapsed_ms: u64,
    },
    /// A completed reasoning block.
    ThinkingComplete {
        /// The block's full reasoning text.
        text: String,
        /// Total milliseconds the block took.
        elapsed_ms: u64,
    },
    /// The provider requested one or more tool invocations.
    ///
    /// Intercepted by the tool-recursion stage; callers never see this
    /// chunk unless they run a chain without that stage.
    ToolInvocationDetected {
        /// The requested calls, in provider order.
        calls: Vec<ToolCall>,
    },
    /// A web search finished; carries citation records for link completion.
    WebSearchComplete {
        /// Citation records observed for this response.
        results: Vec<Citation>,
    },
    /// Terminal: the response finished normally.
    ResponseComplete {
        /// Token accounting, when the provider reported it.
        usage: Option<Usage>,
    },
    /// Terminal: the response failed or was cancelled mid-stream.
    Error {
        /// The failure. Cancellation arrives as [`PipelineError::Cancelled`].
        error: PipelineError,
    },
}

impl Chunk {
    /// Whether this chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Chunk::ResponseComplete { .. } | Chunk::Error { .. })
    }

    /// Short variant name, for events and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Chunk::TextDelta { .. } => "text-delta",
            Chunk::TextComplete { .. } => "text-complete",
            Chunk::ThinkingDelta { .. } => "thinking-delta",
            Chunk::ThinkingComplete { .. } => "thinking-complete",
            Chunk::ToolInvocationDetected { .. } => "tool-invocation",
            Chunk::WebSearchComplete { .. } => "web-search-complete",
            Chunk::ResponseComplete { .. } => "response-complete",
            Chunk::Error { .. } => "error",
        }
    }

    /// Convenience constructor for a text delta.
    pub fn text(text: impl Into<String>) -> Self {
        Chunk::TextDelta { text: text.into() }
    }

    /// Convenience constructor for an error terminal.
    pub fn error(error: PipelineError) -> Self {
        Chunk::Error { error }
    }
}

/// A tool invocation requested by the model.
///
/// Produced by a provider adapter, consumed by the recursion engine for
/// the duration of one recursion round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back on the result message.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as raw JSON.
    pub arguments: Value,
}

/// A citation record from the web-search collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Marker id as it appears in the model's text (e.g. `3` for `[3]`).
    pub id: String,
    /// Source URL.
    pub url: String,
    /// Human-readable title.
    pub title: String,
}

/// Token accounting reported on [`Chunk::ResponseComplete`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated in the completion.
    pub completion_tokens: u64,
}

impl Usage {
    /// Total tokens for the request.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}
