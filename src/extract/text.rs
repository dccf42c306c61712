//! Text accumulation and citation-link completion.

use std::sync::Arc;

use futures::{future, stream, StreamExt};

use crate::chunk::{Chunk, ChunkStream, Citation};
use crate::composer::{BoxFut, Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::request::CompletionParams;

/// Middleware that accumulates `TextDelta` chunks in arrival order and,
/// on `ResponseComplete`, synthesizes one `TextComplete` chunk carrying
/// the full text immediately before the terminal.
///
/// Citation records observed on `WebSearchComplete` chunks are stored in
/// the shared context and used to complete `[id]` markers into
/// `[title](url)` links in the final text. Recursive re-entries pass
/// through so only the outermost stream carries the cumulative
/// `TextComplete` (the outer instance sees every spliced round's deltas).
pub struct TextExtractionStage;

impl TextExtractionStage {
    /// Stage name used in the default chain.
    pub const NAME: &'static str = "text-extraction";
}

impl Middleware for TextExtractionStage {
    fn handle(
        self: Arc<Self>,
        ctx: Arc<ExecutionContext>,
        params: CompletionParams,
        next: Next,
    ) -> BoxFut<'static, Result<ChunkStream>> {
        Box::pin(async move {
            let recursive = ctx.is_recursive();
            let stream_ctx = Arc::clone(&ctx);
            let inner = next.run(ctx, params).await?;
            if recursive {
                return Ok(inner);
            }

            let out = inner
                .scan(String::new(), move |buffer, chunk| {
                    let out: Vec<Chunk> = match chunk {
                        Chunk::TextDelta { text } => {
                            buffer.push_str(&text);
                            vec![Chunk::TextDelta { text }]
                        }
                        Chunk::WebSearchComplete { results } => {
                            stream_ctx.add_citations(&results);
                            vec![Chunk::WebSearchComplete { results }]
                        }
                        terminal @ Chunk::ResponseComplete { .. } => {
                            let text =
                                complete_citation_links(buffer, &stream_ctx.citations());
                            vec![Chunk::TextComplete { text }, terminal]
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

/// Replace `[id]` citation markers with `[title](url)` links.
///
/// Markers with no matching citation record are left untouched.
pub fn complete_citation_links(text: &str, citations: &[Citation]) -> String {
    let mut result = text.to_string();
    for citation in citations {
        let marker = format!("[{}]", citation.id);
        if result.contains(&marker) {
            let link = format!("[{}]({})", citation.title, citation.url);
            result = result.replace(&marker, &link);
        }
    }
    result
}
