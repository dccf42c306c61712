//! Final consumption stage: tees chunks into a caller-provided sink.
//!
//! Sits outermost in the default chain so the sink observes exactly the
//! chunks the caller's stream yields, in the same order, including the
//! terminal. Only the outermost invocation tees; recursive rounds pass
//! through untouched, since their chunks flow up through the outer
//! stream anyway.

use std::sync::Arc;

use futures::StreamExt;

use crate::chunk::{Chunk, ChunkStream};
use crate::composer::{BoxFut, Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::request::CompletionParams;

/// Receiver for chunks as they leave the pipeline.
///
/// Called synchronously from the stream, once per chunk, terminal
/// included. Implementations should hand off quickly (channel send, UI
/// notify) rather than block.
pub trait ChunkObserver: Send + Sync {
    /// Observe one outgoing chunk.
    fn on_chunk(&self, chunk: &Chunk);
}

/// A [`ChunkObserver`] backed by a closure.
pub struct FnChunkObserver<F: Fn(&Chunk) + Send + Sync>(pub F);

impl<F: Fn(&Chunk) + Send + Sync> ChunkObserver for FnChunkObserver<F> {
    fn on_chunk(&self, chunk: &Chunk) {
        (self.0)(chunk);
    }
}

/// Middleware that delivers every outgoing chunk to a sink.
pub struct ConsumptionStage {
    sink: Arc<dyn ChunkObserver>,
}

impl ConsumptionStage {
    /// Stage name used in the default chain.
    pub const NAME: &'static str = "consumption";

    /// Create the stage with the given sink.
    pub fn new(sink: Arc<dyn ChunkObserver>) -> Self {
        Self { sink }
    }
}

impl Middleware for ConsumptionStage {
    fn handle(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
        next: Next,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        Box::pin(async move {
            let recursive = ctx.is_recursive();
            let inner = next.run(ctx, params).await?;
            if recursive {
                return Ok(inner);
            }
            let sink = Arc::clone(&self.sink);
            Ok(inner.inspect(move |chunk| sink.on_chunk(chunk)).boxed() as ChunkStream)
        })
    }
}
