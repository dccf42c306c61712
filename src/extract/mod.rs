//! Content-extraction stages: stateful scanners over the chunk stream.
//!
//! [`TextExtractionStage`] accumulates visible text and synthesizes the
//! final `TextComplete` chunk; [`ThinkingExtractionStage`] splits
//! delimiter-tagged reasoning out of the text stream.

pub mod text;
pub mod thinking;

pub use text::TextExtractionStage;
pub use thinking::{ThinkingExtractionStage, ThinkScanner};
