//! Incremental line parser for subprocess output streams.
//!
//! [`LineStreamParser`] accepts arbitrarily sized byte chunks, reassembles
//! newline-terminated lines, and hands each validated [`StreamEvent`] to an
//! [`EventSink`]. Per-line failures are reported to the sink and never abort
//! the stream.

mod parser;
mod sink;

pub use parser::{EXCERPT_CHARS, LineStreamParser, strip_ansi};
pub use sink::{CollectingSink, EventSink};

use thiserror::Error;

use crate::ndjson::StreamEvent;

/// Recoverable stream conditions, delivered to [`EventSink::on_error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Unterminated input grew past the buffer limit and was discarded.
    #[error("Stream buffer overflow: {size} bytes buffered without a newline (limit {max})")]
    Overflow { size: usize, max: usize },

    /// A line that looks truncated (unbalanced braces or brackets).
    #[error("Incomplete JSON line, likely a chunk boundary artifact: {excerpt}")]
    IncompleteLine { excerpt: String },

    /// A balanced line that still failed to parse.
    #[error("Malformed JSON line ({reason}): {excerpt}")]
    MalformedLine { excerpt: String, reason: String },

    /// Parsed JSON that matched no event shape, not even the fallback.
    #[error("Event failed schema validation: {excerpt}")]
    SchemaValidation { excerpt: String },
}
