//! Cooperative cancellation: tokens, registry, and the cancellation stage.
//!
//! A [`CancelToken`] is a cheap shared flag. The [`CancelRegistry`] keys
//! live tokens by the triggering message id so surrounding application
//! code can cancel an in-flight request it only knows by id. The
//! [`CancellationStage`] installs one token per top-level invocation,
//! wraps the downstream chunk stream with per-chunk cancellation checks,
//! and guarantees exactly-once cleanup when the stream ends — naturally,
//! by cancellation, or by being dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;

use crate::chunk::{Chunk, ChunkStream};
use crate::composer::{BoxFut, Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::events::{emit, EventHandler, PipelineEvent};
use crate::request::CompletionParams;

/// Cooperative cancellation signal shared by one logical request,
/// including all of its recursion rounds.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Message-id-keyed registry of live cancellation tokens.
///
/// # Example
///
/// ```
/// use completion_pipeline::cancel::CancelRegistry;
///
/// let registry = CancelRegistry::new();
/// let token = registry.issue("msg-1");
/// assert!(registry.cancel("msg-1"));
/// assert!(token.is_cancelled());
/// ```
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a fresh token scoped to `message_id`, replacing any stale one.
    pub fn issue(&self, message_id: impl Into<String>) -> CancelToken {
        let token = CancelToken::new();
        self.lock().insert(message_id.into(), token.clone());
        token
    }

    /// Cancel the token for `message_id`. Returns false if none is live.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.lock().get(message_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token for `message_id` (called by stream cleanup).
    pub fn release(&self, message_id: &str) {
        self.lock().remove(message_id);
    }

    /// Number of live tokens.
    pub fn active(&self) -> usize {
        self.lock().len()
    }
}

/// Runs its closure exactly once, on demand or on drop.
pub(crate) struct CleanupGuard {
    done: AtomicBool,
    cleanup: Box<dyn Fn() + Send + Sync>,
}

impl CleanupGuard {
    pub(crate) fn new(cleanup: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            done: AtomicBool::new(false),
            cleanup: Box::new(cleanup),
        }
    }

    pub(crate) fn run(&self) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (self.cleanup)();
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.run();
    }
}

/// Middleware that scopes a cancellation token to each top-level request.
///
/// Top-level invocations get a fresh token from the registry; recursive
/// re-entries reuse the existing one and pass through unwrapped, so the
/// whole recursion cancels as a single unit and cleanup fires only when
/// the outermost stream finishes. Built without a registry, the stage
/// warns once and passes through uncancellable.
pub struct CancellationStage {
    registry: Option<Arc<CancelRegistry>>,
}

impl CancellationStage {
    /// Stage name used in the default chain.
    pub const NAME: &'static str = "cancellation";

    /// Create the stage backed by a token registry.
    pub fn new(registry: Arc<CancelRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Create the stage without cancellation capability.
    ///
    /// Every request passes through uncancellable with a warning event.
    pub fn disabled() -> Self {
        Self { registry: None }
    }
}

impl Middleware for CancellationStage {
    fn handle(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
        next: Next,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        Box::pin(async move {
            // Recursive rounds reuse the top-level token; the top-level
            // wrapper already covers every spliced chunk.
            if ctx.is_recursive() {
                return next.run(ctx, params).await;
            }

            let registry = match &self.registry {
                Some(registry) => Arc::clone(registry),
                None => {
                    emit(
                        &ctx.events,
                        PipelineEvent::Warning {
                            stage: Self::NAME,
                            message: "no cancellation registry configured; \
                                      request is not cancellable"
                                .into(),
                        },
                    );
                    return next.run(ctx, params).await;
                }
            };

            let message_id = ctx.message_id.clone();
            let token = registry.issue(&message_id);
            ctx.set_cancel_token(token.clone());

            let events = ctx.events.clone();
            let inner = match next.run(Arc::clone(&ctx), params).await {
                Ok(stream) => stream,
                Err(e) => {
                    // No stream was produced; release the token now.
                    registry.release(&message_id);
                    return Err(e);
                }
            };

            let guard = {
                let registry = Arc::clone(&registry);
                let id = message_id.clone();
                CleanupGuard::new(move || registry.release(&id))
            };

            Ok(Box::pin(CancelWrap {
                inner,
                token,
                guard,
                events,
                message_id,
                finished: false,
            }) as ChunkStream)
        })
    }
}

/// Stream transform enforcing the cancellation contract.
struct CancelWrap {
    inner: ChunkStream,
    token: CancelToken,
    guard: CleanupGuard,
    events: Option<Arc<dyn EventHandler>>,
    message_id: String,
    finished: bool,
}

impl Stream for CancelWrap {
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.finished {
            this.guard.run();
            return Poll::Ready(None);
        }

        // Checked before each pull, so a token cancelled while the
        // upstream is still mid-flight replaces the next chunk with the
        // Error terminal and drops everything after it.
        if this.token.is_cancelled() {
            this.finished = true;
            this.guard.run();
            emit(
                &this.events,
                PipelineEvent::Cancelled {
                    message_id: this.message_id.clone(),
                },
            );
            return Poll::Ready(Some(Chunk::error(PipelineError::Cancelled)));
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_terminal() {
                    this.finished = true;
                    this.guard.run();
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.guard.run();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::{Composer, MiddlewareEntry};
    use crate::events::FnEventHandler;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;

    struct Emit {
        chunks: Mutex<Option<Vec<Chunk>>>,
    }

    impl Emit {
        fn new(chunks: Vec<Chunk>) -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(Some(chunks)),
            })
        }
    }

    impl Middleware for Emit {
        fn handle(
            self: Arc<Self>,
            _ctx: Arc<ExecutionContext>,
            _params: CompletionParams,
            _next: Next,
        ) -> BoxFut<'static, Result<ChunkStream>> {
            let chunks = self.chunks.lock().unwrap().take().unwrap_or_default();
            Box::pin(async move { Ok(futures::stream::iter(chunks).boxed() as ChunkStream) })
        }
    }

    fn chain(registry: Arc<CancelRegistry>, source: Arc<dyn Middleware>) -> crate::composer::Pipeline {
        let mut composer = Composer::new();
        composer
            .add(MiddlewareEntry::new(
                CancellationStage::NAME,
                Arc::new(CancellationStage::new(registry)),
            ))
            .add(MiddlewareEntry::new("emit", source));
        composer.build()
    }

    fn ctx_with(events: Option<Arc<dyn EventHandler>>) -> Arc<ExecutionContext> {
        ExecutionContext::new("msg-1", CompletionParams::builder("test").build(), events)
    }

    #[test]
    fn test_cleanup_guard_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let guard = CleanupGuard::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        guard.run();
        guard.run();
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_cancel_and_release() {
        let registry = CancelRegistry::new();
        let token = registry.issue("m1");
        assert_eq!(registry.active(), 1);
        assert!(registry.cancel("m1"));
        assert!(token.is_cancelled());
        registry.release("m1");
        assert_eq!(registry.active(), 0);
        assert!(!registry.cancel("m1"));
    }

    #[tokio::test]
    async fn test_natural_end_releases_token() {
        let registry = Arc::new(CancelRegistry::new());
        let pipeline = chain(
            Arc::clone(&registry),
            Emit::new(vec![
                Chunk::text("a"),
                Chunk::ResponseComplete { usage: None },
            ]),
        );

        let chunks: Vec<Chunk> = pipeline
            .run(ctx_with(None), CompletionParams::builder("test").build())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_terminal());
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_yields_single_error() {
        let registry = Arc::new(CancelRegistry::new());
        let pipeline = chain(
            Arc::clone(&registry),
            Emit::new(vec![
                Chunk::text("never seen"),
                Chunk::ResponseComplete { usage: None },
            ]),
        );

        let ctx = ctx_with(None);
        let stream = pipeline
            .run(Arc::clone(&ctx), CompletionParams::builder("test").build())
            .await
            .unwrap();
        // Cancel before the first pull.
        registry.cancel("msg-1");

        let chunks: Vec<Chunk> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0],
            Chunk::Error {
                error: PipelineError::Cancelled
            }
        ));
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn test_double_cancel_one_error_chunk() {
        let registry = Arc::new(CancelRegistry::new());
        let cancel_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancel_events);
        let events: Arc<dyn EventHandler> = Arc::new(FnEventHandler(move |e| {
            if matches!(e, PipelineEvent::Cancelled { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let pipeline = chain(
            Arc::clone(&registry),
            Emit::new(vec![
                Chunk::text("a"),
                Chunk::ResponseComplete { usage: None },
            ]),
        );
        let ctx = ctx_with(Some(events));
        let stream = pipeline
            .run(Arc::clone(&ctx), CompletionParams::builder("test").build())
            .await
            .unwrap();

        ctx.cancel();
        ctx.cancel();

        let chunks: Vec<Chunk> = stream.collect().await;
        let errors = chunks
            .iter()
            .filter(|c| matches!(c, Chunk::Error { .. }))
            .count();
        assert_eq!(chunks.len(), 1);
        assert_eq!(errors, 1);
        assert_eq!(cancel_events.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_still_cleans_up() {
        let registry = Arc::new(CancelRegistry::new());
        let pipeline = chain(
            Arc::clone(&registry),
            Emit::new(vec![
                Chunk::text("a"),
                Chunk::ResponseComplete { usage: None },
            ]),
        );
        let stream = pipeline
            .run(ctx_with(None), CompletionParams::builder("test").build())
            .await
            .unwrap();
        assert_eq!(registry.active(), 1);
        drop(stream);
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn test_missing_registry_warns_and_passes_through() {
        let warned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&warned);
        let events: Arc<dyn EventHandler> = Arc::new(FnEventHandler(move |e| {
            if matches!(e, PipelineEvent::Warning { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let mut composer = Composer::new();
        composer
            .add(MiddlewareEntry::new(
                CancellationStage::NAME,
                Arc::new(CancellationStage::disabled()),
            ))
            .add(MiddlewareEntry::new(
                "emit",
                Emit::new(vec![Chunk::ResponseComplete { usage: None }]) as Arc<dyn Middleware>,
            ));

        let chunks: Vec<Chunk> = composer
            .build()
            .run(ctx_with(Some(events)), CompletionParams::builder("test").build())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(warned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recursive_invocation_reuses_token() {
        let registry = Arc::new(CancelRegistry::new());
        let pipeline = chain(
            Arc::clone(&registry),
            Emit::new(vec![Chunk::ResponseComplete { usage: None }]),
        );

        let ctx = ctx_with(None);
        let token = registry.issue("msg-1");
        ctx.set_cancel_token(token.clone());
        ctx.enter_recursion();

        let _stream = pipeline
            .run(Arc::clone(&ctx), CompletionParams::builder("test").build())
            .await
            .unwrap();

        // The stage must not have replaced the token.
        assert!(!ctx.cancel_token().unwrap().is_cancelled());
        token.cancel();
        assert!(ctx.cancel_token().unwrap().is_cancelled());
    }
}
