//! Tool execution and the recursion engine.
//!
//! The [`ToolCallStage`] watches the chunk stream for
//! `ToolInvocationDetected` chunks. They are intercepted — never
//! forwarded — and accumulated until the upstream stream reaches its
//! natural end. If any calls were seen, the stage executes them through
//! the [`ToolExecutor`] collaborator, appends the assistant's partial
//! message plus the tool results to the conversation, and re-invokes the
//! entire pipeline with the augmented request. The recursive stream is
//! spliced onto the outer one, so the caller observes a single seamless
//! response regardless of how many rounds occurred.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};

use crate::chunk::{Chunk, ChunkStream, ToolCall, Usage};
use crate::composer::{BoxFut, Middleware, Next, Pipeline};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::events::{emit, PipelineEvent};
use crate::request::{ChatMessage, CompletionParams};

/// Hard ceiling on tool-call recursion depth.
pub const MAX_RECURSION_DEPTH: u32 = 20;

/// External collaborator that executes tool calls.
///
/// Failures from individual executions are captured per call and fed
/// back into the conversation as error-annotated tool results; they
/// never abort the recursion round.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Whether this executor knows the named tool.
    ///
    /// Calls for unknown tools are discarded before execution; if every
    /// call in a round is unknown, the round completes without recursion
    /// and a warning event is emitted.
    fn supports(&self, _name: &str) -> bool {
        true
    }

    /// Execute one tool call, returning its result content.
    async fn execute(&self, call: &ToolCall) -> Result<String>;
}

/// A [`ToolExecutor`] backed by a closure, for tests and simple tools.
pub struct FnToolExecutor<F>(pub F)
where
    F: Fn(&ToolCall) -> Result<String> + Send + Sync;

#[async_trait]
impl<F> ToolExecutor for FnToolExecutor<F>
where
    F: Fn(&ToolCall) -> Result<String> + Send + Sync,
{
    async fn execute(&self, call: &ToolCall) -> Result<String> {
        (self.0)(call)
    }
}

enum RoundOutput {
    Forward(Vec<Chunk>),
    Recurse {
        usage: Option<Usage>,
    },
    Drop,
}

struct RoundState {
    assistant_text: String,
    saw_calls: bool,
    latched: bool,
}

impl RoundState {
    /// Classify one upstream chunk. Interception and accumulation happen
    /// here; the actual recursion runs in the stream map.
    fn on_chunk(&mut self, ctx: &ExecutionContext, chunk: Chunk) -> RoundOutput {
        if self.latched {
            // Recursion already triggered for this stream instance; a
            // malformed upstream emitting more chunks is ignored.
            return RoundOutput::Drop;
        }
        match chunk {
            Chunk::ToolInvocationDetected { calls } => {
                self.saw_calls = self.saw_calls || !calls.is_empty();
                ctx.push_pending_calls(calls);
                RoundOutput::Drop
            }
            Chunk::TextDelta { text } => {
                self.assistant_text.push_str(&text);
                RoundOutput::Forward(vec![Chunk::TextDelta { text }])
            }
            Chunk::ResponseComplete { usage } if self.saw_calls => {
                self.latched = true;
                RoundOutput::Recurse { usage }
            }
            other => RoundOutput::Forward(vec![other]),
        }
    }
}

/// Middleware implementing the tool-call recursion state machine.
pub struct ToolCallStage {
    executor: Arc<dyn ToolExecutor>,
    max_depth: u32,
}

impl ToolCallStage {
    /// Stage name used in the default chain.
    pub const NAME: &'static str = "tool-recursion";

    /// Create the stage with the default depth ceiling.
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            executor,
            max_depth: MAX_RECURSION_DEPTH,
        }
    }

    /// Override the depth ceiling (tests use small values).
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl Middleware for ToolCallStage {
    fn handle(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
        next: Next,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        Box::pin(async move {
            let pipeline = next.pipeline();
            let inner = next.run(Arc::clone(&ctx), params.clone()).await?;
            if !ctx.capabilities.tools {
                return Ok(inner);
            }

            let state = RoundState {
                assistant_text: String::new(),
                saw_calls: false,
                latched: false,
            };
            let executor = Arc::clone(&self.executor);
            let max_depth = self.max_depth;

            let out = inner
                .scan(state, move |state, chunk| {
                    let output = state.on_chunk(&ctx, chunk);
                    let piece: ChunkStream = match output {
                        RoundOutput::Drop => stream::iter(Vec::<Chunk>::new()).boxed(),
                        RoundOutput::Forward(chunks) => stream::iter(chunks).boxed(),
                        RoundOutput::Recurse { usage } => {
                            let fut = run_tool_round(
                                Arc::clone(&ctx),
                                params.clone(),
                                pipeline.clone(),
                                Arc::clone(&executor),
                                std::mem::take(&mut state.assistant_text),
                                usage,
                                max_depth,
                            );
                            stream::once(fut).flatten().boxed()
                        }
                    };
                    future::ready(Some(piece))
                })
                .flatten()
                .boxed();
            Ok(out as ChunkStream)
        })
    }
}

/// Execute one round of accumulated tool calls and re-enter the chain.
async fn run_tool_round(
    ctx: Arc<ExecutionContext>,
    params: CompletionParams,
    pipeline: Pipeline,
    executor: Arc<dyn ToolExecutor>,
    assistant_text: String,
    usage: Option<Usage>,
    max_depth: u32,
) -> ChunkStream {
    let calls = ctx.take_pending_calls();
    let supported: Vec<ToolCall> = calls
        .into_iter()
        .filter(|call| {
            let known = executor.supports(&call.name);
            if !known {
                emit(
                    &ctx.events,
                    PipelineEvent::Warning {
                        stage: ToolCallStage::NAME,
                        message: format!("discarding call to unknown tool '{}'", call.name),
                    },
                );
            }
            known
        })
        .collect();

    if supported.is_empty() {
        emit(
            &ctx.events,
            PipelineEvent::Warning {
                stage: ToolCallStage::NAME,
                message: "no valid tool conversions; completing without recursion".into(),
            },
        );
        return stream::iter(vec![Chunk::ResponseComplete { usage }]).boxed();
    }

    let depth = ctx.recursion_depth() + 1;
    if depth > max_depth {
        return stream::iter(vec![Chunk::error(PipelineError::RecursionLimit {
            depth,
            max: max_depth,
        })])
        .boxed();
    }

    emit(
        &ctx.events,
        PipelineEvent::ToolRoundStart {
            depth,
            tools: supported.iter().map(|c| c.name.clone()).collect(),
        },
    );

    let results = future::join_all(supported.iter().map(|call| {
        let executor = Arc::clone(&executor);
        async move { executor.execute(call).await }
    }))
    .await;

    let mut messages = params.messages.clone();
    messages.push(ChatMessage::assistant(assistant_text).with_tool_calls(supported.clone()));
    for (call, result) in supported.iter().zip(results) {
        let (content, ok) = match result {
            Ok(content) => (content, true),
            Err(e) => (format!("error: tool '{}' failed: {}", call.name, e), false),
        };
        emit(
            &ctx.events,
            PipelineEvent::ToolResult {
                call_id: call.id.clone(),
                ok,
            },
        );
        messages.push(ChatMessage::tool_result(call.id.clone(), content));
    }

    let mut new_params = params;
    new_params.messages = messages;
    ctx.enter_recursion();

    match pipeline.run(Arc::clone(&ctx), new_params).await {
        Ok(stream) => stream,
        Err(e) => stream::iter(vec![Chunk::error(e)]).boxed(),
    }
}
