//! # Completion Pipeline
//!
//! Client-side middleware pipeline for streaming chat completions.
//!
//! Every completion request flows through an ordered chain of middleware
//! stages. The innermost stage calls the provider and adapts its wire
//! protocol into a normalized stream of [`Chunk`]s; the stages above it
//! transform that stream — splitting reasoning out of visible text,
//! accumulating the final answer, executing tool calls and recursing,
//! enforcing cancellation, and teeing chunks into a sink. Callers see
//! one seamless stream that always ends in exactly one terminal chunk.
//!
//! ## Core Concepts
//!
//! - **[`Chunk`]** — the normalized streaming vocabulary. Text and
//!   reasoning deltas, tool invocations, search citations, and exactly
//!   one terminal (`ResponseComplete` or `Error`) per stream.
//! - **[`Middleware`]** — object-safe trait for a stage. Receives the
//!   shared [`ExecutionContext`], the request params, and an owned
//!   `Next` continuation it may defer into the stream it returns.
//! - **[`Composer`]** — named, editable stage list, frozen into an
//!   immutable [`Pipeline`] snapshot by `build()`.
//! - **[`ProviderAdapter`]** — boundary to one provider's wire protocol:
//!   payload construction, stream opening, event mapping.
//! - **[`CompletionEngine`]** — facade wiring the default chain and the
//!   per-request context, with cancel-by-id via [`CancelRegistry`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use completion_pipeline::{
//!     ChatMessage, CompletionEngine, CompletionParams, HttpTransport, NdjsonAdapter,
//! };
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = HttpTransport::new("http://localhost:11434");
//!     let engine = CompletionEngine::builder()
//!         .adapter(Arc::new(NdjsonAdapter::new(transport, "api/chat")))
//!         .build()?;
//!
//!     let params = CompletionParams::builder("llama3.2")
//!         .message(ChatMessage::user("Why is the sky blue?"))
//!         .reasoning(true)
//!         .build();
//!
//!     let mut stream = engine.run_completion(params).await?;
//!     while let Some(chunk) = stream.next().await {
//!         println!("{}: {:?}", chunk.kind(), chunk);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Tool Calls
//!
//! With a [`ToolExecutor`] configured, the tool-recursion stage
//! intercepts tool invocations, executes them, appends the results to
//! the conversation, and re-enters the whole chain — up to a hard depth
//! ceiling of 20 rounds. The recursive stream is spliced into the outer
//! one, so a multi-round tool conversation still reads as a single
//! response.

pub mod backoff;
pub mod cancel;
pub mod chunk;
pub mod composer;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod extract;
pub mod provider;
pub mod request;
pub mod sink;
pub mod tools;
pub mod transport;

pub use backoff::BackoffConfig;
pub use cancel::{CancelRegistry, CancelToken, CancellationStage};
pub use chunk::{Chunk, ChunkStream, Citation, ToolCall, Usage};
pub use composer::{Composer, Middleware, MiddlewareEntry, Next, Pipeline};
pub use context::{Capabilities, ExecutionContext};
pub use engine::{CompletionEngine, CompletionEngineBuilder};
pub use error::{PipelineError, Result};
pub use events::{EventHandler, FnEventHandler, PipelineEvent};
pub use extract::{TextExtractionStage, ThinkingExtractionStage};
pub use provider::{NdjsonAdapter, ProviderAdapter, ProviderStage, ScriptedAdapter};
pub use request::{ChatMessage, CompletionParams, Role, ToolSpec};
pub use sink::{ChunkObserver, ConsumptionStage, FnChunkObserver};
pub use tools::{FnToolExecutor, ToolCallStage, ToolExecutor, MAX_RECURSION_DEPTH};
pub use transport::{HttpTransport, NdjsonDecoder, RawStream};
