//! Execution context shared across middleware stages.
//!
//! One [`ExecutionContext`] is created per top-level request and shared
//! (by `Arc`, never copied) across every stage and every recursive
//! re-entry of the chain. Independent top-level requests must each get
//! their own instance — [`CompletionEngine`](crate::engine::CompletionEngine)
//! enforces this by construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::cancel::CancelToken;
use crate::chunk::{Citation, ToolCall};
use crate::events::EventHandler;
use crate::request::CompletionParams;

/// Flags resolved once from the request parameters.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Streamed output requested.
    pub streaming: bool,
    /// Tool use enabled (at least one tool offered).
    pub tools: bool,
    /// Reasoning output enabled.
    pub reasoning: bool,
}

impl Capabilities {
    fn resolve(params: &CompletionParams) -> Self {
        Self {
            streaming: params.stream,
            tools: !params.tools.is_empty(),
            reasoning: params.reasoning,
        }
    }
}

/// Tool-processing state, mutated by the recursion engine.
#[derive(Debug, Default)]
pub struct ToolState {
    /// Tool calls intercepted from the current stream, awaiting flush.
    pub pending: Vec<ToolCall>,
    /// Whether the current chain invocation is a recursive re-entry.
    pub is_recursive: bool,
    /// How many recursion rounds have been entered. Monotonically
    /// non-decreasing for the lifetime of the context.
    pub recursion_depth: u32,
}

struct InternalState {
    sdk_payload: Option<Value>,
    tool: ToolState,
    citations: Vec<Citation>,
    cancel: Option<CancelToken>,
    custom: HashMap<String, Value>,
}

/// Per-request state container threaded through every stage.
///
/// The immutable parts (`method`, `message_id`, `original_params`,
/// `capabilities`) are plain fields; the mutable internal state sits
/// behind a `Mutex` because stage streams run on the same cooperative
/// task but hold the context across suspension points.
pub struct ExecutionContext {
    /// Which operation is running (e.g. `"run_completion"`).
    pub method: &'static str,
    /// Id of the triggering message; scopes the cancellation token.
    pub message_id: String,
    /// The caller's input, never mutated. Recursion rounds build new
    /// params from this plus accumulated history.
    pub original_params: CompletionParams,
    /// Flags resolved once at construction.
    pub capabilities: Capabilities,
    /// Optional lifecycle event handler.
    pub events: Option<Arc<dyn EventHandler>>,
    state: Mutex<InternalState>,
}

impl ExecutionContext {
    /// Create a context for one top-level request.
    pub fn new(
        message_id: impl Into<String>,
        params: CompletionParams,
        events: Option<Arc<dyn EventHandler>>,
    ) -> Arc<Self> {
        let capabilities = Capabilities::resolve(&params);
        Arc::new(Self {
            method: "run_completion",
            message_id: message_id.into(),
            original_params: params,
            capabilities,
            events,
            state: Mutex::new(InternalState {
                sdk_payload: None,
                tool: ToolState::default(),
                citations: Vec::new(),
                cancel: None,
                custom: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InternalState> {
        // A poisoned lock means a stage panicked; the state is still
        // structurally valid for reads, so recover rather than unwrap.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the last-built provider payload.
    pub fn set_sdk_payload(&self, payload: Value) {
        self.lock().sdk_payload = Some(payload);
    }

    /// The last-built provider payload, if any.
    pub fn sdk_payload(&self) -> Option<Value> {
        self.lock().sdk_payload.clone()
    }

    /// Store the cancellation token for this request.
    pub fn set_cancel_token(&self, token: CancelToken) {
        self.lock().cancel = Some(token);
    }

    /// The cancellation token, if the cancellation stage installed one.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.lock().cancel.clone()
    }

    /// Request cancellation of this request and all of its recursion rounds.
    pub fn cancel(&self) {
        if let Some(token) = self.cancel_token() {
            token.cancel();
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token().is_some_and(|t| t.is_cancelled())
    }

    /// Whether the current invocation is a recursive re-entry.
    pub fn is_recursive(&self) -> bool {
        self.lock().tool.is_recursive
    }

    /// Current recursion depth (0 until the first tool round).
    pub fn recursion_depth(&self) -> u32 {
        self.lock().tool.recursion_depth
    }

    /// Mark the context as entering one more recursion round.
    ///
    /// Returns the depth of the round being entered.
    pub fn enter_recursion(&self) -> u32 {
        let mut state = self.lock();
        state.tool.is_recursive = true;
        state.tool.recursion_depth += 1;
        state.tool.recursion_depth
    }

    /// Append intercepted tool calls to the pending set.
    pub fn push_pending_calls(&self, calls: Vec<ToolCall>) {
        self.lock().tool.pending.extend(calls);
    }

    /// Take and clear the pending tool calls.
    pub fn take_pending_calls(&self) -> Vec<ToolCall> {
        std::mem::take(&mut self.lock().tool.pending)
    }

    /// Record citations observed on a `WebSearchComplete` chunk.
    ///
    /// Records are deduplicated by id; recursion rounds share the set.
    pub fn add_citations(&self, results: &[Citation]) {
        let mut state = self.lock();
        for citation in results {
            if !state.citations.iter().any(|c| c.id == citation.id) {
                state.citations.push(citation.clone());
            }
        }
    }

    /// All citations observed so far for this request.
    pub fn citations(&self) -> Vec<Citation> {
        self.lock().citations.clone()
    }

    /// Store a free-form extension value.
    pub fn set_custom(&self, key: impl Into<String>, value: Value) {
        self.lock().custom.insert(key.into(), value);
    }

    /// Read a free-form extension value.
    pub fn custom(&self, key: &str) -> Option<Value> {
        self.lock().custom.get(key).cloned()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ExecutionContext")
            .field("method", &self.method)
            .field("message_id", &self.message_id)
            .field("model", &self.original_params.model)
            .field("capabilities", &self.capabilities)
            .field("recursion_depth", &state.tool.recursion_depth)
            .field("is_recursive", &state.tool.is_recursive)
            .field("pending_calls", &state.tool.pending.len())
            .field("has_cancel_token", &state.cancel.is_some())
            .finish()
    }
}
