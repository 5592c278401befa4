use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{EventSink, StreamError};
use crate::config::DEFAULT_MAX_BUFFER_BYTES;
use crate::ndjson::validate_event;

/// Number of characters of a bad line kept in diagnostics.
pub const EXCERPT_CHARS: usize = 100;

/// CSI (`ESC [ params intermediates final`), OSC (`ESC ] ... BEL|ST`) and
/// charset designators (`ESC ( B`).
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]")
        .expect("static regex is valid")
});

/// Remove terminal escape sequences from a line.
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_RE.replace_all(line, "")
}

/// Per-execution NDJSON line reassembler.
///
/// The buffer holds raw bytes so a chunk boundary inside a multi-byte UTF-8
/// sequence is harmless: lines are only decoded once complete.
#[derive(Debug)]
pub struct LineStreamParser {
    buffer: Vec<u8>,
    max_buffer_size: usize,
}

impl Default for LineStreamParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl LineStreamParser {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size,
        }
    }

    pub const fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Bytes currently held for an unterminated line.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one chunk of output. Complete lines are emitted before returning.
    pub fn process_chunk<S: EventSink + ?Sized>(&mut self, chunk: &[u8], sink: &mut S) {
        if chunk.is_empty() {
            return;
        }

        let previous_len = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        // The buffer never holds a newline between calls, so only the new
        // chunk needs scanning.
        let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') else {
            if self.buffer.len() > self.max_buffer_size {
                self.overflow(sink);
            }
            return;
        };

        let rest = self.buffer.split_off(previous_len + pos + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        for line in complete.split(|&b| b == b'\n') {
            handle_line(line, sink);
        }
    }

    /// Emit whatever partial line remains. Call when the source stream ends.
    pub fn flush<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let remaining = std::mem::take(&mut self.buffer);
        handle_line(&remaining, sink);
    }

    /// Drop any buffered input.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn overflow<S: EventSink + ?Sized>(&mut self, sink: &mut S) {
        let size = self.buffer.len();
        warn!(
            size,
            max = self.max_buffer_size,
            "Stream buffer overflow, discarding buffered output"
        );
        sink.on_overflow(size);
        sink.on_error(StreamError::Overflow {
            size,
            max: self.max_buffer_size,
        });
        self.buffer.clear();
    }
}

fn handle_line<S: EventSink + ?Sized>(raw: &[u8], sink: &mut S) {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }

    let stripped = strip_ansi(trimmed);
    let line = stripped.trim();
    if !(line.starts_with('{') || line.starts_with('[')) {
        debug!(line = %excerpt(line), "Non-JSON output line");
        return;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(value) => match validate_event(&value) {
            Some(event) => sink.on_event(event),
            None => {
                let excerpt = excerpt(line);
                warn!(%excerpt, "Dropping event that failed schema validation");
                sink.on_error(StreamError::SchemaValidation { excerpt });
            }
        },
        Err(e) => {
            let excerpt = excerpt(line);
            if is_balanced(line) {
                error!(%excerpt, error = %e, "Malformed JSON line");
                sink.on_error(StreamError::MalformedLine {
                    excerpt,
                    reason: e.to_string(),
                });
            } else {
                warn!(%excerpt, "Incomplete JSON line, likely a chunk boundary artifact");
                sink.on_error(StreamError::IncompleteLine { excerpt });
            }
        }
    }
}

/// Brace/bracket balance. Quoted braces are counted too; this only picks
/// the diagnostic severity.
fn is_balanced(line: &str) -> bool {
    let count = |c: char| line.chars().filter(|&x| x == c).count();
    count('{') == count('}') && count('[') == count(']')
}

fn excerpt(line: &str) -> String {
    let mut chars = line.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
