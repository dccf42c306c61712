//! End-to-end tests over the public API: default chain assembly,
//! tool-call recursion, reasoning extraction, cancellation, and
//! composer customization, all against the scripted provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::json;

use completion_pipeline::{
    ChatMessage, Chunk, ChunkStream, CompletionEngine, CompletionParams, ExecutionContext,
    FnChunkObserver, FnEventHandler, FnToolExecutor, Middleware, MiddlewareEntry, Next,
    PipelineError, PipelineEvent, ScriptedAdapter, ToolCall, ToolSpec,
};

fn text_event(text: &str) -> serde_json::Value {
    json!({"type": "text_delta", "text": text})
}

fn tool_event(id: &str, name: &str) -> serde_json::Value {
    json!({"type": "tool_call", "id": id, "name": name, "arguments": {}})
}

fn done() -> serde_json::Value {
    json!({"type": "done"})
}

fn tool_params() -> CompletionParams {
    CompletionParams::builder("test-model")
        .message(ChatMessage::user("go"))
        .tool(ToolSpec {
            name: "lookup".into(),
            description: "Look things up".into(),
            parameters: json!({"type": "object"}),
        })
        .build()
}

fn kinds(chunks: &[Chunk]) -> Vec<&'static str> {
    chunks.iter().map(Chunk::kind).collect()
}

#[tokio::test]
async fn plain_completion_has_one_terminal_and_text_complete() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![
            text_event("Hello, "),
            text_event("world"),
            done(),
        ])))
        .build()
        .unwrap();

    let chunks: Vec<Chunk> = engine
        .run_completion(CompletionParams::builder("test-model").build())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        kinds(&chunks),
        vec!["text-delta", "text-delta", "text-complete", "response-complete"]
    );
    assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    assert!(matches!(
        &chunks[2],
        Chunk::TextComplete { text } if text == "Hello, world"
    ));
}

#[tokio::test]
async fn stream_without_done_event_still_terminates() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![text_event("a")])))
        .build()
        .unwrap();

    let chunks: Vec<Chunk> = engine
        .run_completion(CompletionParams::builder("test-model").build())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    assert!(matches!(
        chunks.last().unwrap(),
        Chunk::ResponseComplete { usage: None }
    ));
}

#[tokio::test]
async fn tool_round_reads_as_one_seamless_response() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::new(vec![
            vec![
                text_event("A"),
                text_event("B"),
                tool_event("c1", "lookup"),
                done(),
            ],
            vec![text_event("C"), text_event("D"), done()],
        ])))
        .tool_executor(Arc::new(FnToolExecutor(|call: &ToolCall| {
            Ok(format!("result for {}", call.name))
        })))
        .build()
        .unwrap();

    let chunks: Vec<Chunk> = engine
        .run_completion(tool_params())
        .await
        .unwrap()
        .collect()
        .await;

    let texts: Vec<&str> = chunks
        .iter()
        .filter_map(|c| match c {
            Chunk::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["A", "B", "C", "D"]);

    // The invocation chunk never reaches the caller, the first round's
    // terminal is consumed, and the final text spans both rounds.
    assert!(!chunks
        .iter()
        .any(|c| matches!(c, Chunk::ToolInvocationDetected { .. })));
    assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    let complete: Vec<&Chunk> = chunks
        .iter()
        .filter(|c| matches!(c, Chunk::TextComplete { .. }))
        .collect();
    assert_eq!(complete.len(), 1);
    assert!(matches!(complete[0], Chunk::TextComplete { text } if text == "ABCD"));
}

#[tokio::test]
async fn recursion_stops_at_depth_ceiling() {
    let rounds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&rounds);

    // Every round requests another tool call, forever.
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![
            tool_event("c", "lookup"),
            done(),
        ])))
        .tool_executor(Arc::new(FnToolExecutor(|_: &ToolCall| Ok("more".into()))))
        .events(Arc::new(FnEventHandler(move |event: PipelineEvent| {
            if matches!(event, PipelineEvent::ToolRoundStart { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })))
        .build()
        .unwrap();

    let chunks: Vec<Chunk> = engine
        .run_completion(tool_params())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(rounds.load(Ordering::SeqCst), 20);
    assert!(matches!(
        chunks.last().unwrap(),
        Chunk::Error {
            error: PipelineError::RecursionLimit { max: 20, .. }
        }
    ));
    assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
}

#[tokio::test]
async fn reasoning_split_across_chunk_boundaries() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![
            text_event("<thi"),
            text_event("nk>reas"),
            text_event("on</think>"),
            text_event("answer"),
            done(),
        ])))
        .build()
        .unwrap();

    let params = CompletionParams::builder("test-model").reasoning(true).build();
    let chunks: Vec<Chunk> = engine.run_completion(params).await.unwrap().collect().await;

    assert_eq!(
        kinds(&chunks),
        vec![
            "thinking-delta",
            "thinking-delta",
            "thinking-complete",
            "text-delta",
            "text-complete",
            "response-complete",
        ]
    );
    assert!(matches!(
        &chunks[2],
        Chunk::ThinkingComplete { text, .. } if text == "reason"
    ));
    // The final text carries only the visible part.
    assert!(matches!(
        &chunks[4],
        Chunk::TextComplete { text } if text == "answer"
    ));
}

#[tokio::test]
async fn separator_inserted_when_text_resumes_after_thinking() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![
            text_event("intro "),
            text_event("<think>hm</think>"),
            text_event("conclusion"),
            done(),
        ])))
        .build()
        .unwrap();

    let params = CompletionParams::builder("test-model").reasoning(true).build();
    let text = engine.complete_text(params).await.unwrap();
    assert_eq!(text, "intro \nconclusion");
}

#[tokio::test]
async fn reasoning_disabled_leaves_delimiters_in_text() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![
            text_event("<think>hm</think>ok"),
            done(),
        ])))
        .build()
        .unwrap();

    let text = engine
        .complete_text(CompletionParams::builder("test-model").build())
        .await
        .unwrap();
    assert_eq!(text, "<think>hm</think>ok");
}

#[tokio::test]
async fn cancel_by_id_is_idempotent_and_releases_token() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![
            text_event("never seen"),
            done(),
        ])))
        .build()
        .unwrap();

    let stream = engine
        .run_completion_with_id("msg-42", CompletionParams::builder("test-model").build())
        .await
        .unwrap();
    assert_eq!(engine.registry().active(), 1);
    assert!(engine.cancel("msg-42"));
    assert!(engine.cancel("msg-42")); // still live until the stream ends

    let chunks: Vec<Chunk> = stream.collect().await;
    assert_eq!(chunks.len(), 1);
    assert!(matches!(
        chunks[0],
        Chunk::Error {
            error: PipelineError::Cancelled
        }
    ));
    assert_eq!(engine.registry().active(), 0);
    assert!(!engine.cancel("msg-42"));
}

#[tokio::test]
async fn sink_observes_exactly_the_callers_chunks() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);

    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::new(vec![
            vec![text_event("A"), tool_event("c1", "lookup"), done()],
            vec![text_event("B"), done()],
        ])))
        .tool_executor(Arc::new(FnToolExecutor(|_: &ToolCall| Ok("r".into()))))
        .sink(Arc::new(FnChunkObserver(move |chunk: &Chunk| {
            seen2.lock().unwrap().push(chunk.kind().to_string());
        })))
        .build()
        .unwrap();

    let chunks: Vec<Chunk> = engine
        .run_completion(tool_params())
        .await
        .unwrap()
        .collect()
        .await;

    // Tool recursion must not double-deliver to the sink: one entry per
    // chunk the caller saw, in the same order.
    let caller: Vec<String> = chunks.iter().map(|c| c.kind().to_string()).collect();
    assert_eq!(*seen.lock().unwrap(), caller);
}

#[tokio::test]
async fn composer_can_be_customized_before_freezing() {
    struct Shout;
    impl Middleware for Shout {
        fn handle(
            self: Arc<Self>,
            ctx: Arc<ExecutionContext>,
            params: CompletionParams,
            next: Next,
        ) -> completion_pipeline::composer::BoxFut<'static, completion_pipeline::Result<ChunkStream>>
        {
            Box::pin(async move {
                let inner = next.run(ctx, params).await?;
                Ok(inner
                    .map(|chunk| match chunk {
                        Chunk::TextDelta { text } => Chunk::TextDelta {
                            text: text.to_uppercase(),
                        },
                        other => other,
                    })
                    .boxed() as ChunkStream)
            })
        }
    }

    let builder = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::fixed(vec![text_event("hi"), done()])));
    let mut composer = builder.composer().unwrap();
    composer
        .insert_after("text-extraction", MiddlewareEntry::new("shout", Arc::new(Shout)))
        .unwrap();
    assert!(composer.remove("no-such-stage").is_err());

    let engine = CompletionEngine::from_pipeline(
        composer.build(),
        Arc::new(completion_pipeline::CancelRegistry::new()),
        None,
    );

    let chunks: Vec<Chunk> = engine
        .run_completion(CompletionParams::builder("test-model").build())
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(
        &chunks[0],
        Chunk::TextDelta { text } if text == "HI"
    ));
    // TextComplete accumulates upstream of the inserted stage.
    assert!(chunks
        .iter()
        .any(|c| matches!(c, Chunk::TextComplete { .. })));
}

#[tokio::test]
async fn citations_completed_across_tool_rounds() {
    let engine = CompletionEngine::builder()
        .adapter(Arc::new(ScriptedAdapter::new(vec![
            vec![
                json!({"type": "web_search", "results": [
                    {"id": "1", "url": "https://rust-lang.org", "title": "Rust"}
                ]}),
                text_event("Rust is fast [1]"),
                done(),
            ],
        ])))
        .build()
        .unwrap();

    let text = engine
        .complete_text(CompletionParams::builder("test-model").build())
        .await
        .unwrap();
    assert_eq!(text, "Rust is fast [Rust](https://rust-lang.org)");
}
