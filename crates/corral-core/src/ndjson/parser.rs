//! Schema validation for NDJSON stream events.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown or
//! mismatched types passed through as [`StreamEvent::Unrecognized`].

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single NDJSON line and validate it into an event.
pub fn parse_line(line: &str) -> Result<StreamEvent> {
    let raw: Value = serde_json::from_str(line)?;
    validate_event(&raw)
        .ok_or_else(|| Error::NdjsonParse("Missing or non-string 'type' field".into()))
}

/// Validate a parsed JSON value against the known event shapes.
///
/// Returns `None` only when the value is not an object or has no string
/// `type` field.
pub fn validate_event(raw: &Value) -> Option<StreamEvent> {
    let obj = raw.as_object()?;
    let event_type = obj.get("type")?.as_str()?;

    let matched = match event_type {
        "system" => match_system(raw),
        "user" => match_shape(raw, StreamEvent::User),
        "assistant" => match_shape(raw, StreamEvent::Assistant),
        "result" => match_shape(raw, StreamEvent::Result),
        "error" => match_shape(raw, StreamEvent::Error),
        _ => None,
    };

    Some(matched.unwrap_or_else(|| {
        debug!(event_type, "Passing through unrecognized event shape");
        StreamEvent::Unrecognized {
            event_type: event_type.to_string(),
            payload: obj.clone(),
        }
    }))
}

fn match_shape<'a, T, F>(raw: &'a Value, wrap: F) -> Option<StreamEvent>
where
    T: Deserialize<'a>,
    F: FnOnce(T) -> StreamEvent,
{
    T::deserialize(raw).ok().map(wrap)
}

fn match_system(raw: &Value) -> Option<StreamEvent> {
    let init = SystemInit::deserialize(raw).ok()?;
    match init.subtype.as_deref() {
        None | Some("init") => Some(StreamEvent::SystemInit(init)),
        Some(_) => None,
    }
}
