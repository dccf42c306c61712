//! High-level engine: default chain assembly and per-request setup.
//!
//! [`CompletionEngine`] wires the standard stage order, mints a fresh
//! [`ExecutionContext`] per request, and exposes cancel-by-id through
//! its [`CancelRegistry`]. Callers who need a non-standard chain can
//! edit the [`Composer`] from
//! [`CompletionEngineBuilder::composer`] and freeze it themselves.

use std::sync::Arc;

use futures::StreamExt;

use crate::backoff::BackoffConfig;
use crate::cancel::{CancelRegistry, CancellationStage};
use crate::chunk::{Chunk, ChunkStream};
use crate::composer::{Composer, MiddlewareEntry, Pipeline};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::events::EventHandler;
use crate::extract::{TextExtractionStage, ThinkingExtractionStage};
use crate::provider::{ProviderAdapter, ProviderStage};
use crate::request::CompletionParams;
use crate::sink::{ChunkObserver, ConsumptionStage};
use crate::tools::{ToolCallStage, ToolExecutor};

/// Builder for [`CompletionEngine`].
pub struct CompletionEngineBuilder {
    adapter: Option<Arc<dyn ProviderAdapter>>,
    executor: Option<Arc<dyn ToolExecutor>>,
    registry: Arc<CancelRegistry>,
    events: Option<Arc<dyn EventHandler>>,
    sink: Option<Arc<dyn ChunkObserver>>,
    delimiters: (String, String),
    backoff: BackoffConfig,
}

impl CompletionEngineBuilder {
    /// Set the provider adapter. Required.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Set the tool executor. Without one, the tool-recursion stage is
    /// omitted and tool invocation chunks pass through to the caller.
    pub fn tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use a shared cancellation registry instead of a private one.
    pub fn cancel_registry(mut self, registry: Arc<CancelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Receive pipeline lifecycle events.
    pub fn events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Tee outgoing chunks into a sink via the consumption stage.
    pub fn sink(mut self, sink: Arc<dyn ChunkObserver>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Override the reasoning delimiters. Default: `<think>`/`</think>`.
    pub fn thinking_delimiters(
        mut self,
        open: impl Into<String>,
        close: impl Into<String>,
    ) -> Self {
        self.delimiters = (open.into(), close.into());
        self
    }

    /// Enable transport retry for the provider call.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Assemble the default chain as an editable [`Composer`].
    ///
    /// Stage order, outermost first: consumption (if a sink is set),
    /// cancellation, text-extraction, thinking-extraction, tool-recursion
    /// (if an executor is set), provider-call.
    pub fn composer(&self) -> Result<Composer> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidConfig("no provider adapter configured".into()))?;

        let mut composer = Composer::new();
        if let Some(ref sink) = self.sink {
            composer.add(MiddlewareEntry::new(
                ConsumptionStage::NAME,
                Arc::new(ConsumptionStage::new(Arc::clone(sink))),
            ));
        }
        composer
            .add(MiddlewareEntry::new(
                CancellationStage::NAME,
                Arc::new(CancellationStage::new(Arc::clone(&self.registry))),
            ))
            .add(MiddlewareEntry::new(
                TextExtractionStage::NAME,
                Arc::new(TextExtractionStage),
            ))
            .add(MiddlewareEntry::new(
                ThinkingExtractionStage::NAME,
                Arc::new(ThinkingExtractionStage::with_delimiters(
                    self.delimiters.0.clone(),
                    self.delimiters.1.clone(),
                )),
            ));
        if let Some(ref executor) = self.executor {
            composer.add(MiddlewareEntry::new(
                ToolCallStage::NAME,
                Arc::new(ToolCallStage::new(Arc::clone(executor))),
            ));
        }
        composer.add(MiddlewareEntry::new(
            ProviderStage::NAME,
            Arc::new(ProviderStage::new(Arc::clone(adapter)).with_backoff(self.backoff.clone())),
        ));
        Ok(composer)
    }

    /// Freeze the default chain into an engine.
    pub fn build(self) -> Result<CompletionEngine> {
        let pipeline = self.composer()?.build();
        Ok(CompletionEngine {
            pipeline,
            registry: self.registry,
            events: self.events,
        })
    }
}

/// Facade over a frozen pipeline plus the per-request plumbing.
pub struct CompletionEngine {
    pipeline: Pipeline,
    registry: Arc<CancelRegistry>,
    events: Option<Arc<dyn EventHandler>>,
}

impl CompletionEngine {
    /// Start building an engine.
    pub fn builder() -> CompletionEngineBuilder {
        CompletionEngineBuilder {
            adapter: None,
            executor: None,
            registry: Arc::new(CancelRegistry::new()),
            events: None,
            sink: None,
            delimiters: ("<think>".into(), "</think>".into()),
            backoff: BackoffConfig::none(),
        }
    }

    /// Wrap a hand-built pipeline.
    pub fn from_pipeline(
        pipeline: Pipeline,
        registry: Arc<CancelRegistry>,
        events: Option<Arc<dyn EventHandler>>,
    ) -> Self {
        Self {
            pipeline,
            registry,
            events,
        }
    }

    /// The cancellation registry, for cancel-by-id from other tasks.
    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }

    /// Cancel the request scoped to `message_id`, if it is in flight.
    pub fn cancel(&self, message_id: &str) -> bool {
        self.registry.cancel(message_id)
    }

    /// Run one completion with a generated message id.
    pub async fn run_completion(&self, params: CompletionParams) -> Result<ChunkStream> {
        let message_id = format!("msg-{:016x}", fastrand::u64(..));
        self.run_completion_with_id(message_id, params).await
    }

    /// Run one completion under a caller-chosen message id.
    ///
    /// The id scopes cancellation: `engine.cancel(id)` aborts this
    /// request and every recursion round it spawned.
    pub async fn run_completion_with_id(
        &self,
        message_id: impl Into<String>,
        params: CompletionParams,
    ) -> Result<ChunkStream> {
        let ctx = ExecutionContext::new(message_id, params.clone(), self.events.clone());
        self.pipeline.run(ctx, params).await
    }

    /// Run a completion and return only the final accumulated text.
    ///
    /// A terminal `Error` chunk becomes an `Err` return.
    pub async fn complete_text(&self, params: CompletionParams) -> Result<String> {
        let mut stream = self.run_completion(params).await?;
        let mut complete = None;
        let mut accumulated = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Chunk::TextDelta { text } => accumulated.push_str(&text),
                Chunk::TextComplete { text } => complete = Some(text),
                Chunk::Error { error } => return Err(error),
                _ => {}
            }
        }
        Ok(complete.unwrap_or(accumulated))
    }
}
