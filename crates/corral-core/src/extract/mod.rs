//! JSON recovery from free-form generated text.
//!
//! Model output often wraps the JSON it was asked for in prose, code fences,
//! or slightly broken punctuation. [`extract`] runs an ordered chain of pure
//! recovery strategies over the text and returns the first value that parses.
//! Nothing here retries or calls back into a model; callers decide what to do
//! with a failed [`ExtractionResult`].

mod strategies;

pub use strategies::{find_json_span, object_spans, repair_json, strip_code_fences};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::contract::SchemaContract;
use strategies::{STRATEGIES, parse_lenient};

/// Outcome of one extraction call. `raw` is always the verbatim input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub raw: String,
    pub cleaned_text: Option<String>,
}

impl<T> ExtractionResult<T> {
    fn ok(data: T, raw: &str, cleaned_text: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            raw: raw.to_string(),
            cleaned_text,
        }
    }

    fn fail(error: impl Into<String>, raw: &str, cleaned_text: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            raw: raw.to_string(),
            cleaned_text,
        }
    }

    /// Convert into a plain `Result`, keeping only the data or the error.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(self.error.unwrap_or_else(|| "Extraction failed".to_string())),
        }
    }
}

fn cleaned(candidate: String, raw: &str) -> Option<String> {
    (candidate != raw).then_some(candidate)
}

/// Recover a single JSON value from `text`.
pub fn extract(text: &str) -> ExtractionResult<Value> {
    if text.trim().is_empty() {
        return ExtractionResult::fail("Input is empty", text, None);
    }

    let stripped = strip_code_fences(text);
    let mut first_error: Option<String> = None;

    for (name, strategy) in STRATEGIES {
        match strategy(&stripped) {
            Ok((value, parsed_text)) => {
                debug!(strategy = name, "Extracted JSON");
                return ExtractionResult::ok(value, text, cleaned(parsed_text, text));
            }
            Err(e) => {
                debug!(strategy = name, error = %e, "Extraction strategy failed");
                first_error.get_or_insert(e);
            }
        }
    }

    let error = first_error.map_or_else(
        || "Failed to extract JSON".to_string(),
        |e| format!("Failed to extract JSON: {e}"),
    );
    ExtractionResult::fail(error, text, cleaned(stripped, text))
}

/// Recover JSON and deserialize it into `T`.
pub fn extract_as<T: DeserializeOwned>(text: &str) -> ExtractionResult<T> {
    let result = extract(text);
    let Some(value) = result.data else {
        return ExtractionResult {
            success: false,
            data: None,
            error: result.error,
            raw: result.raw,
            cleaned_text: result.cleaned_text,
        };
    };
    match serde_json::from_value(value) {
        Ok(data) => ExtractionResult::ok(data, text, result.cleaned_text),
        Err(e) => ExtractionResult::fail(
            format!("Extracted JSON does not match the expected type: {e}"),
            text,
            result.cleaned_text,
        ),
    }
}

/// Recover JSON and require every named key to be present on it.
///
/// On a missing key the extracted value is still returned in `data`.
pub fn extract_and_validate(text: &str, required_fields: &[&str]) -> ExtractionResult<Value> {
    let mut result = extract(text);
    let Some(value) = &result.data else {
        return result;
    };

    let missing: Vec<&str> = required_fields
        .iter()
        .copied()
        .filter(|field| value.get(field).is_none())
        .collect();
    if !missing.is_empty() {
        result.success = false;
        result.error = Some(format!("Missing required fields: {}", missing.join(", ")));
    }
    result
}

/// Recover JSON and check it against a [`SchemaContract`].
pub fn extract_with_contract(text: &str, contract: &SchemaContract) -> ExtractionResult<Value> {
    let mut result = extract(text);
    let Some(value) = &result.data else {
        return result;
    };

    let report = contract.validate(value);
    if !report.valid {
        result.success = false;
        result.error = Some(format!(
            "Schema validation failed: {}",
            report.errors.join("; ")
        ));
    }
    result
}

/// Recover every JSON value from text holding an array or back-to-back objects.
///
/// Objects that fail to parse are skipped; the call succeeds if at least one
/// value was recovered.
pub fn extract_multiple(text: &str) -> ExtractionResult<Vec<Value>> {
    if text.trim().is_empty() {
        return ExtractionResult::fail("Input is empty", text, None);
    }

    let stripped = strip_code_fences(text);
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&stripped) {
        return ExtractionResult::ok(items, text, cleaned(stripped, text));
    }

    let spans = object_spans(&stripped);
    let total = spans.len();
    let values: Vec<Value> = spans.into_iter().filter_map(parse_lenient).collect();
    debug!(total, recovered = values.len(), "Scanned for JSON objects");

    if values.is_empty() {
        let error = if total == 0 {
            "No JSON objects found".to_string()
        } else {
            format!("None of the {total} JSON object candidates could be parsed")
        };
        return ExtractionResult::fail(error, text, cleaned(stripped, text));
    }
    ExtractionResult::ok(values, text, cleaned(stripped, text))
}
