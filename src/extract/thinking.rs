//! Delimiter-tagged reasoning extraction.
//!
//! Some model/provider combinations interleave reasoning into the text
//! stream between delimiter tags (commonly `<think>` / `</think>`).
//! [`ThinkScanner`] is the stateful splitter; [`ThinkingExtractionStage`]
//! applies it to the chunk stream, re-emitting tagged text as
//! `ThinkingDelta`/`ThinkingComplete` chunks and everything else as
//! ordinary `TextDelta`s.

use std::sync::Arc;
use std::time::Instant;

use futures::{future, stream, StreamExt};

use crate::chunk::{Chunk, ChunkStream};
use crate::composer::{BoxFut, Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::request::CompletionParams;

/// A piece of scanned output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Visible text outside the delimiters.
    Text(String),
    /// Reasoning text inside the delimiters.
    Thinking(String),
    /// A closing delimiter was crossed (or the stream ended mid-block).
    BlockEnd,
}

/// Incremental scanner splitting delimiter-tagged reasoning from text.
///
/// Delimiters split across chunk boundaries are buffered: the scanner
/// holds back the longest suffix of pending text that is a prefix of the
/// delimiter it is looking for, and only resolves it once later input
/// confirms a full match or a definite non-match. An opening delimiter
/// never closed by stream end is treated as reasoning to end-of-stream.
///
/// # Example
///
/// ```
/// use completion_pipeline::extract::thinking::{Segment, ThinkScanner};
///
/// let mut scanner = ThinkScanner::new("<think>", "</think>");
/// assert_eq!(scanner.push("<th"), vec![]);
/// assert_eq!(
///     scanner.push("ink>hm</think>hi"),
///     vec![
///         Segment::Thinking("hm".into()),
///         Segment::BlockEnd,
///         Segment::Text("hi".into()),
///     ],
/// );
/// ```
pub struct ThinkScanner {
    open: String,
    close: String,
    buf: String,
    in_think: bool,
}

impl ThinkScanner {
    /// Create a scanner for the given delimiter pair.
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            buf: String::new(),
            in_think: false,
        }
    }

    /// Feed a text fragment and return the segments it resolves.
    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        self.buf.push_str(fragment);
        let mut out = Vec::new();

        loop {
            let delim = if self.in_think { &self.close } else { &self.open };
            if let Some(pos) = self.buf.find(delim.as_str()) {
                if pos > 0 {
                    let resolved = self.buf[..pos].to_string();
                    out.push(if self.in_think {
                        Segment::Thinking(resolved)
                    } else {
                        Segment::Text(resolved)
                    });
                }
                self.buf.drain(..pos + delim.len());
                if self.in_think {
                    out.push(Segment::BlockEnd);
                }
                self.in_think = !self.in_think;
            } else {
                // Hold back any tail that might be the start of the delimiter.
                let keep = longest_suffix_prefix(&self.buf, delim);
                let emit_len = self.buf.len() - keep;
                if emit_len > 0 {
                    let resolved: String = self.buf.drain(..emit_len).collect();
                    out.push(if self.in_think {
                        Segment::Thinking(resolved)
                    } else {
                        Segment::Text(resolved)
                    });
                }
                break;
            }
        }

        out
    }

    /// Resolve everything still buffered at end of stream.
    pub fn flush(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let remaining = std::mem::take(&mut self.buf);
        if self.in_think {
            if !remaining.is_empty() {
                out.push(Segment::Thinking(remaining));
            }
            out.push(Segment::BlockEnd);
            self.in_think = false;
        } else if !remaining.is_empty() {
            // A partial-delimiter tail is a definite non-match at EOS.
            out.push(Segment::Text(remaining));
        }
        out
    }
}

/// Length of the longest proper suffix of `s` that is a prefix of `delim`.
fn longest_suffix_prefix(s: &str, delim: &str) -> usize {
    let max = delim.len().saturating_sub(1).min(s.len());
    (1..=max)
        .rev()
        .filter(|&k| delim.is_char_boundary(k))
        .find(|&k| s.ends_with(&delim[..k]))
        .unwrap_or(0)
}

struct ThinkingState {
    scanner: ThinkScanner,
    block_text: String,
    block_started: Option<Instant>,
    emitted_visible: bool,
    boundary_crossed: bool,
}

impl ThinkingState {
    fn chunks_for(&mut self, segments: Vec<Segment>) -> Vec<Chunk> {
        let mut out = Vec::new();
        for segment in segments {
            match segment {
                Segment::Text(mut text) => {
                    // Separator only when a delimiter boundary was just
                    // crossed, so unrelated words don't glue together.
                    if self.boundary_crossed && self.emitted_visible {
                        text.insert(0, '\n');
                    }
                    self.boundary_crossed = false;
                    self.emitted_visible = true;
                    out.push(Chunk::TextDelta { text });
                }
                Segment::Thinking(text) => {
                    let started = *self.block_started.get_or_insert_with(Instant::now);
                    self.block_text.push_str(&text);
                    out.push(Chunk::ThinkingDelta {
                        text,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Segment::BlockEnd => {
                    let text = std::mem::take(&mut self.block_text);
                    if !text.is_empty() {
                        let elapsed_ms = self
                            .block_started
                            .map(|s| s.elapsed().as_millis() as u64)
                            .unwrap_or(0);
                        out.push(Chunk::ThinkingComplete { text, elapsed_ms });
                    }
                    self.block_started = None;
                    self.boundary_crossed = true;
                }
            }
        }
        out
    }
}

/// Middleware that splits reasoning out of the text stream.
///
/// Active only when the context's reasoning capability is on; otherwise
/// the stream passes through untouched. On `ResponseComplete` any
/// unflushed reasoning is emitted as `ThinkingComplete` before the
/// terminal.
pub struct ThinkingExtractionStage {
    open: String,
    close: String,
}

impl ThinkingExtractionStage {
    /// Stage name used in the default chain.
    pub const NAME: &'static str = "thinking-extraction";

    /// Create the stage with the conventional `<think>`/`</think>` pair.
    pub fn new() -> Self {
        Self::with_delimiters("<think>", "</think>")
    }

    /// Create the stage with a model-specific delimiter pair.
    pub fn with_delimiters(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

impl Default for ThinkingExtractionStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for ThinkingExtractionStage {
    fn handle(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
        next: Next,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        Box::pin(async move {
            let reasoning = ctx.capabilities.reasoning;
            let inner = next.run(ctx, params).await?;
            if !reasoning {
                return Ok(inner);
            }

            let state = ThinkingState {
                scanner: ThinkScanner::new(self.open.clone(), self.close.clone()),
                block_text: String::new(),
                block_started: None,
                emitted_visible: false,
                boundary_crossed: false,
            };

            let out = inner
                .scan(state, |state, chunk| {
                    let out = match chunk {
                        Chunk::TextDelta { text } => {
                            let segments = state.scanner.push(&text);
                            state.chunks_for(segments)
                        }
                        terminal if terminal.is_terminal() => {
                            let segments = state.scanner.flush();
                            let mut chunks = state.chunks_for(segments);
                            chunks.push(terminal);
                            chunks
                        }
                        other => vec![other],
                    };
                    future::ready(Some(out))
                })
                .flat_map(stream::iter)
                .boxed();
            Ok(out as ChunkStream)
        })
    }
}
