//! Middleware composer: named stages folded into an invocable pipeline.
//!
//! A [`Composer`] holds an ordered list of named stages and supports
//! editing the list (`add`, `prepend`, `insert_before`, `insert_after`,
//! `replace`, `remove`) until [`build`](Composer::build) freezes it into
//! a [`Pipeline`]. Built pipelines are immutable snapshots — later edits
//! to the composer never affect them.
//!
//! Stages execute in onion order: stage *i* receives an owned [`Next`]
//! that invokes stage *i+1*. A stage may run logic before calling `next`,
//! and may wrap or transform the [`ChunkStream`] `next` returns before
//! handing it upward. `Next` also exposes the whole chain as a
//! [`Pipeline`] handle so the tool-recursion stage can re-enter it from
//! inside a stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::chunk::ChunkStream;
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::events::{emit, PipelineEvent};
use crate::request::CompletionParams;

/// A boxed, pinned, `Send` future — the return type of [`Middleware::handle`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One link in the middleware chain.
///
/// Implementations take the shared context, the request params for this
/// invocation (recursion rounds pass augmented params), and the `next`
/// continuation. The receiver is `Arc<Self>` so a stage can move itself
/// into the stream it returns.
pub trait Middleware: Send + Sync {
    /// Run the stage, producing the (possibly wrapped) chunk stream.
    fn handle(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
        next: Next,
    ) -> BoxFut<'static, Result<ChunkStream>>;
}

/// A named stage in the chain.
#[derive(Clone)]
pub struct MiddlewareEntry {
    /// Name used by the composer's edit operations.
    pub name: String,
    /// The stage itself.
    pub stage: Arc<dyn Middleware>,
}

impl MiddlewareEntry {
    /// Create a named entry.
    pub fn new(name: impl Into<String>, stage: Arc<dyn Middleware>) -> Self {
        Self {
            name: name.into(),
            stage,
        }
    }
}

impl std::fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered, editable collection of named stages.
///
/// # Example
///
/// ```
/// use completion_pipeline::composer::Composer;
///
/// let mut composer = Composer::new();
/// assert!(composer.is_empty());
/// assert!(!composer.has("provider-call"));
/// assert!(composer.remove("provider-call").is_err());
/// ```
#[derive(Default)]
pub struct Composer {
    entries: Vec<MiddlewareEntry>,
}

impl Composer {
    /// Create an empty composer.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// Append a stage to the end of the chain (innermost so far).
    pub fn add(&mut self, entry: MiddlewareEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    /// Insert a stage at the front of the chain (outermost).
    pub fn prepend(&mut self, entry: MiddlewareEntry) -> &mut Self {
        self.entries.insert(0, entry);
        self
    }

    /// Insert a stage immediately before the named one.
    ///
    /// An unknown name leaves the chain unchanged and returns
    /// [`PipelineError::UnknownStage`].
    pub fn insert_before(&mut self, name: &str, entry: MiddlewareEntry) -> Result<()> {
        let pos = self.position(name)?;
        self.entries.insert(pos, entry);
        Ok(())
    }

    /// Insert a stage immediately after the named one.
    pub fn insert_after(&mut self, name: &str, entry: MiddlewareEntry) -> Result<()> {
        let pos = self.position(name)?;
        self.entries.insert(pos + 1, entry);
        Ok(())
    }

    /// Replace the named stage in place.
    pub fn replace(&mut self, name: &str, entry: MiddlewareEntry) -> Result<()> {
        let pos = self.position(name)?;
        self.entries[pos] = entry;
        Ok(())
    }

    /// Remove the named stage.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let pos = self.position(name)?;
        self.entries.remove(pos);
        Ok(())
    }

    /// Whether a stage with this name is present.
    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Number of stages in the chain.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stage names in execution order, outermost first.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Freeze the current chain into an immutable [`Pipeline`] snapshot.
    ///
    /// Edits made to the composer afterwards do not affect the returned
    /// pipeline.
    pub fn build(&self) -> Pipeline {
        Pipeline {
            layers: self.entries.clone().into(),
        }
    }
}

/// An immutable, invocable snapshot of a middleware chain.
///
/// Cheap to clone; the recursion engine clones one per re-entry.
#[derive(Clone)]
pub struct Pipeline {
    layers: Arc<[MiddlewareEntry]>,
}

impl Pipeline {
    /// Execute the full chain for one invocation.
    pub fn run(
        &self,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        Next {
            layers: Arc::clone(&self.layers),
            index: 0,
        }
        .run(ctx, params)
    }

    /// Number of stages in the snapshot.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the snapshot has no stages.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Continuation handle invoking the rest of the chain.
///
/// Owned and `'static` so a stage can defer the call into the stream it
/// builds (the recursion engine re-enters the chain long after its own
/// `handle` returned).
#[derive(Clone)]
pub struct Next {
    layers: Arc<[MiddlewareEntry]>,
    index: usize,
}

impl Next {
    /// Invoke the next stage in the chain.
    ///
    /// Reaching the end of the chain without any stage having produced a
    /// stream is a configuration error: the innermost stage must be a
    /// provider (or equivalent source) stage.
    pub fn run(
        self,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        match self.layers.get(self.index) {
            Some(entry) => {
                emit(
                    &ctx.events,
                    PipelineEvent::StageStart {
                        name: entry.name.clone(),
                    },
                );
                let stage = Arc::clone(&entry.stage);
                let next = Next {
                    layers: self.layers,
                    index: self.index + 1,
                };
                stage.handle(ctx, params, next)
            }
            None => Box::pin(async {
                Err(PipelineError::InvalidConfig(
                    "middleware chain exhausted without a source stage".into(),
                ))
            }),
        }
    }

    /// A handle to the entire chain, for recursive re-entry.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            layers: Arc::clone(&self.layers),
        }
    }
}
