//! Provider adapter boundary and the source stage of the chain.
//!
//! A [`ProviderAdapter`] translates between the pipeline's normalized
//! vocabulary and one provider's wire protocol: it builds the outgoing
//! payload, opens the streaming call, and maps each raw wire event into
//! a [`Chunk`]. The [`ProviderStage`] sits innermost in the chain and
//! turns an adapter into a well-formed chunk stream: exactly one
//! terminal per stream, transport retry before the stream starts, and
//! mid-stream failures surfaced as a terminal `Error` chunk.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use serde_json::{json, Value};

use crate::backoff::{with_backoff, BackoffConfig};
use crate::cancel::CancelToken;
use crate::chunk::{Chunk, ChunkStream, Citation, ToolCall, Usage};
use crate::composer::{BoxFut, Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::request::CompletionParams;
use crate::transport::{HttpTransport, RawStream};

/// Translates between the normalized pipeline types and one provider's
/// wire protocol.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Human-readable name for diagnostics.
    fn name(&self) -> &'static str;

    /// Build the provider-specific request payload.
    fn build_payload(&self, params: &CompletionParams, ctx: &ExecutionContext) -> Result<Value>;

    /// Open the streaming call, yielding raw wire events.
    async fn invoke(&self, payload: Value, cancel: Option<CancelToken>) -> Result<RawStream>;

    /// Map one wire event into a [`Chunk`]. `None` skips the event.
    fn map_event(&self, event: Value) -> Option<Chunk>;
}

/// Map one event of the reference NDJSON wire format into a [`Chunk`].
///
/// Events are objects tagged by `"type"`:
///
/// - `{"type": "text_delta", "text": "..."}`
/// - `{"type": "tool_call", "id": "...", "name": "...", "arguments": {...}}`
/// - `{"type": "web_search", "results": [{"id", "url", "title"}, ...]}`
/// - `{"type": "done", "usage": {"prompt_tokens", "completion_tokens"}}`
/// - `{"type": "error", "message": "..."}`
///
/// Unknown types map to `None`.
pub fn map_wire_event(event: Value) -> Option<Chunk> {
    match event.get("type").and_then(|t| t.as_str())? {
        "text_delta" => {
            let text = event.get("text").and_then(|t| t.as_str())?.to_string();
            Some(Chunk::TextDelta { text })
        }
        "tool_call" => {
            let call = ToolCall {
                id: event.get("id").and_then(|v| v.as_str())?.to_string(),
                name: event.get("name").and_then(|v| v.as_str())?.to_string(),
                arguments: event.get("arguments").cloned().unwrap_or_else(|| json!({})),
            };
            Some(Chunk::ToolInvocationDetected { calls: vec![call] })
        }
        "web_search" => {
            let results = event
                .get("results")
                .and_then(|r| serde_json::from_value::<Vec<Citation>>(r.clone()).ok())
                .unwrap_or_default();
            Some(Chunk::WebSearchComplete { results })
        }
        "done" => {
            let usage = event
                .get("usage")
                .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
            Some(Chunk::ResponseComplete { usage })
        }
        "error" => {
            let message = event
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("provider reported an error")
                .to_string();
            Some(Chunk::error(PipelineError::Provider(message)))
        }
        _ => None,
    }
}

/// Build the reference request payload from normalized params.
fn build_reference_payload(params: &CompletionParams) -> Result<Value> {
    let mut payload = json!({
        "model": params.model,
        "messages": serde_json::to_value(&params.messages)?,
        "stream": params.stream,
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
    });
    if !params.tools.is_empty() {
        payload["tools"] = serde_json::to_value(&params.tools)?;
    }
    if params.reasoning {
        payload["reasoning"] = json!(true);
    }
    if let Some(ref options) = params.options {
        if let (Some(base), Some(extra)) = (payload.as_object_mut(), options.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(payload)
}

/// Innermost stage: calls the provider and adapts its stream.
///
/// Guarantees the stage contract regardless of adapter behavior:
///
/// - connection errors are retried per the [`BackoffConfig`] before any
///   chunk is produced; once the stream is live, failures surface as a
///   terminal [`Chunk::Error`] instead
/// - the output is fused after the first terminal chunk
/// - a wire stream that ends without a terminal event gets a synthesized
///   `ResponseComplete` so downstream stages can rely on one
pub struct ProviderStage {
    adapter: Arc<dyn ProviderAdapter>,
    backoff: BackoffConfig,
}

impl ProviderStage {
    /// Stage name used in the default chain.
    pub const NAME: &'static str = "provider-call";

    /// Create the stage with no transport retry.
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            backoff: BackoffConfig::none(),
        }
    }

    /// Enable transport retry with the given config.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Middleware for ProviderStage {
    fn handle(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
        _next: Next,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        Box::pin(async move {
            let payload = self.adapter.build_payload(&params, &ctx)?;
            ctx.set_sdk_payload(payload.clone());

            let cancel = ctx.cancel_token();
            let adapter = Arc::clone(&self.adapter);
            let raw = with_backoff(&self.backoff, cancel.as_ref(), &ctx.events, || {
                let adapter = Arc::clone(&adapter);
                let payload = payload.clone();
                let cancel = cancel.clone();
                async move { adapter.invoke(payload, cancel).await }
            })
            .await?;

            let adapter = Arc::clone(&self.adapter);
            let terminated = Arc::new(AtomicBool::new(false));
            let terminated_tail = Arc::clone(&terminated);

            let mapped = raw
                .scan(false, move |done, item| {
                    let out: Vec<Chunk> = if *done {
                        Vec::new()
                    } else {
                        match item {
                            Ok(event) => match adapter.map_event(event) {
                                Some(chunk) => {
                                    if chunk.is_terminal() {
                                        *done = true;
                                        terminated.store(true, Ordering::SeqCst);
                                    }
                                    vec![chunk]
                                }
                                None => Vec::new(),
                            },
                            Err(e) => {
                                *done = true;
                                terminated.store(true, Ordering::SeqCst);
                                vec![Chunk::error(e)]
                            }
                        }
                    };
                    future::ready(Some(out))
                })
                .flat_map(stream::iter);

            // Polled only after the wire stream ends; supplies the
            // missing terminal when the provider never sent one.
            let tail = stream::once(async move {
                if terminated_tail.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(Chunk::ResponseComplete { usage: None })
                }
            })
            .filter_map(future::ready);

            Ok(mapped.chain(tail).boxed() as ChunkStream)
        })
    }
}

/// Adapter for providers speaking the reference NDJSON wire format over
/// HTTP.
pub struct NdjsonAdapter {
    transport: HttpTransport,
    path: String,
}

impl NdjsonAdapter {
    /// Create an adapter posting to `path` under the transport's base URL.
    pub fn new(transport: HttpTransport, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for NdjsonAdapter {
    fn name(&self) -> &'static str {
        "ndjson"
    }

    fn build_payload(&self, params: &CompletionParams, _ctx: &ExecutionContext) -> Result<Value> {
        build_reference_payload(params)
    }

    async fn invoke(&self, payload: Value, _cancel: Option<CancelToken>) -> Result<RawStream> {
        self.transport.post_stream(&self.path, &payload).await
    }

    fn map_event(&self, event: Value) -> Option<Chunk> {
        map_wire_event(event)
    }
}

/// A test adapter that replays scripted wire events in order.
///
/// Scripts are consumed one per invocation and cycle back to the
/// beginning when exhausted, so multi-round tool conversations can be
/// scripted as consecutive entries.
///
/// # Example
///
/// ```
/// use completion_pipeline::provider::ScriptedAdapter;
/// use serde_json::json;
///
/// let adapter = ScriptedAdapter::new(vec![vec![
///     json!({"type": "text_delta", "text": "hi"}),
///     json!({"type": "done"}),
/// ]]);
/// ```
pub struct ScriptedAdapter {
    scripts: Vec<Vec<Value>>,
    index: AtomicUsize,
}

impl ScriptedAdapter {
    /// Create an adapter with one script per expected invocation.
    pub fn new(scripts: Vec<Vec<Value>>) -> Self {
        assert!(!scripts.is_empty(), "ScriptedAdapter requires at least one script");
        Self {
            scripts,
            index: AtomicUsize::new(0),
        }
    }

    /// An adapter that always replays the same script.
    pub fn fixed(script: Vec<Value>) -> Self {
        Self::new(vec![script])
    }

    fn next_script(&self) -> Vec<Value> {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.scripts.len();
        self.scripts[idx].clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn build_payload(&self, params: &CompletionParams, _ctx: &ExecutionContext) -> Result<Value> {
        build_reference_payload(params)
    }

    async fn invoke(&self, _payload: Value, _cancel: Option<CancelToken>) -> Result<RawStream> {
        let events = self.next_script();
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    fn map_event(&self, event: Value) -> Option<Chunk> {
        map_wire_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::{Composer, MiddlewareEntry};

    fn provider_pipeline(adapter: ScriptedAdapter) -> crate::composer::Pipeline {
        let mut composer = Composer::new();
        composer.add(MiddlewareEntry::new(
            ProviderStage::NAME,
            Arc::new(ProviderStage::new(Arc::new(adapter))),
        ));
        composer.build()
    }

    async fn run(adapter: ScriptedAdapter) -> Vec<Chunk> {
        let params = CompletionParams::builder("test").build();
        let ctx = ExecutionContext::new("m1", params.clone(), None);
        provider_pipeline(adapter)
            .run(ctx, params)
            .await
            .unwrap()
            .collect()
            .await
    }

    #[test]
    fn test_map_wire_events() {
        let chunk = map_wire_event(json!({"type": "text_delta", "text": "hi"})).unwrap();
        assert!(matches!(chunk, Chunk::TextDelta { text } if text == "hi"));

        let chunk = map_wire_event(json!({
            "type": "tool_call", "id": "c1", "name": "search", "arguments": {"q": "x"}
        }))
        .unwrap();
        assert!(matches!(
            chunk,
            Chunk::ToolInvocationDetected { calls } if calls.len() == 1 && calls[0].name == "search"
        ));

        let chunk = map_wire_event(json!({
            "type": "done", "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        }))
        .unwrap();
        assert!(matches!(
            chunk,
            Chunk::ResponseComplete { usage: Some(u) } if u.total() == 7
        ));

        assert!(map_wire_event(json!({"type": "keepalive"})).is_none());
        assert!(map_wire_event(json!("not an object")).is_none());
    }

    #[test]
    fn test_payload_carries_tools_and_options() {
        let params = CompletionParams::builder("m")
            .message(crate::request::ChatMessage::user("hi"))
            .tool(crate::request::ToolSpec {
                name: "search".into(),
                description: "Search".into(),
                parameters: json!({"type": "object"}),
            })
            .options(json!({"top_p": 0.9}))
            .build();
        let payload = build_reference_payload(&params).unwrap();

        assert_eq!(payload["model"], "m");
        assert_eq!(payload["tools"][0]["name"], "search");
        assert_eq!(payload["top_p"], 0.9);
        assert_eq!(payload["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_stream_maps_and_terminates() {
        let chunks = run(ScriptedAdapter::fixed(vec![
            json!({"type": "text_delta", "text": "a"}),
            json!({"type": "keepalive"}),
            json!({"type": "text_delta", "text": "b"}),
            json!({"type": "done"}),
        ]))
        .await;

        let kinds: Vec<&str> = chunks.iter().map(Chunk::kind).collect();
        assert_eq!(kinds, vec!["text-delta", "text-delta", "response-complete"]);
    }

    #[tokio::test]
    async fn test_fused_after_terminal() {
        let chunks = run(ScriptedAdapter::fixed(vec![
            json!({"type": "done"}),
            json!({"type": "text_delta", "text": "late"}),
            json!({"type": "done"}),
        ]))
        .await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Chunk::ResponseComplete { .. }));
    }

    #[tokio::test]
    async fn test_missing_terminal_synthesized() {
        let chunks = run(ScriptedAdapter::fixed(vec![
            json!({"type": "text_delta", "text": "a"}),
        ]))
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Chunk::ResponseComplete { usage: None }));
    }

    #[tokio::test]
    async fn test_error_event_is_terminal() {
        let chunks = run(ScriptedAdapter::fixed(vec![
            json!({"type": "text_delta", "text": "a"}),
            json!({"type": "error", "message": "overloaded"}),
            json!({"type": "text_delta", "text": "late"}),
        ]))
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(
            &chunks[1],
            Chunk::Error { error: PipelineError::Provider(m) } if m == "overloaded"
        ));
    }

    #[tokio::test]
    async fn test_scripts_cycle_per_invocation() {
        let adapter = ScriptedAdapter::new(vec![
            vec![json!({"type": "text_delta", "text": "first"}), json!({"type": "done"})],
            vec![json!({"type": "text_delta", "text": "second"}), json!({"type": "done"})],
        ]);
        let params = CompletionParams::builder("test").build();
        let pipeline = provider_pipeline(adapter);

        for expected in ["first", "second", "first"] {
            let ctx = ExecutionContext::new("m1", params.clone(), None);
            let chunks: Vec<Chunk> = pipeline
                .run(ctx, params.clone())
                .await
                .unwrap()
                .collect()
                .await;
            assert!(matches!(
                &chunks[0],
                Chunk::TextDelta { text } if text == expected
            ));
        }
    }

    #[tokio::test]
    async fn test_payload_recorded_on_context() {
        let params = CompletionParams::builder("test").build();
        let ctx = ExecutionContext::new("m1", params.clone(), None);
        let pipeline = provider_pipeline(ScriptedAdapter::fixed(vec![json!({"type": "done"})]));
        let _: Vec<Chunk> = pipeline
            .run(Arc::clone(&ctx), params)
            .await
            .unwrap()
            .collect()
            .await;

        let payload = ctx.sdk_payload().expect("payload recorded");
        assert_eq!(payload["model"], "test");
    }
}
