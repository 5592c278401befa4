//! NDJSON event model for supervised subprocess output.
//!
//! This module turns one decoded JSON line into a canonical [`StreamEvent`],
//! implementing a tolerant reader pattern with an explicit passthrough
//! variant for event types this crate does not know about.

mod parser;
mod types;

pub use parser::{parse_line, validate_event};
pub use types::*;
