//! Pure text-to-JSON recovery steps, tried in order by the extractor.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Opening or closing fence with an optional language tag.
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_+-]*").expect("static regex is valid"));

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("static regex is valid"));

static UNQUOTED_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$]*)(\s*:)").expect("static regex is valid")
});

/// A recovery step: returns the parsed value and the text it parsed.
pub(super) type Strategy = fn(&str) -> Result<(Value, String), String>;

/// Strategies in priority order. The first success wins.
pub(super) const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct", parse_direct),
    ("embedded_span", parse_embedded_span),
    ("repaired", parse_repaired),
];

/// Remove markdown code fences, keeping their contents.
pub fn strip_code_fences(text: &str) -> String {
    FENCE_RE.replace_all(text, "").trim().to_string()
}

/// Outermost `{...}` or `[...]` span, whichever opener appears first.
pub fn find_json_span(text: &str) -> Option<&str> {
    json_spans(text).into_iter().next()
}

/// Outermost object and array spans, earliest opener first.
fn json_spans(text: &str) -> Vec<&str> {
    let mut spans: Vec<(usize, &str)> =
        [span_between(text, '{', '}'), span_between(text, '[', ']')]
            .into_iter()
            .flatten()
            .collect();
    spans.sort_by_key(|&(start, _)| start);
    spans.into_iter().map(|(_, span)| span).collect()
}

fn span_between(text: &str, open: char, close: char) -> Option<(usize, &str)> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| (start, &text[start..=end]))
}

/// Textual fixes for common near-JSON: trailing commas and bare keys.
pub fn repair_json(text: &str) -> String {
    let without_commas = TRAILING_COMMA_RE.replace_all(text, "$1");
    UNQUOTED_KEY_RE
        .replace_all(&without_commas, "$1\"$2\"$3")
        .into_owned()
}

/// Every top-level balanced `{...}` span, skipping braces inside strings.
pub fn object_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    spans
}

/// Parse a span as-is, falling back to the repaired form.
pub(super) fn parse_lenient(text: &str) -> Option<Value> {
    serde_json::from_str(text)
        .ok()
        .or_else(|| serde_json::from_str(&repair_json(text)).ok())
}

fn parse_direct(text: &str) -> Result<(Value, String), String> {
    let value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    Ok((value, text.to_string()))
}

fn parse_embedded_span(text: &str) -> Result<(Value, String), String> {
    let mut first_error = None;
    for span in json_spans(text) {
        match serde_json::from_str(span) {
            Ok(value) => return Ok((value, span.to_string())),
            Err(e) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
    Err(first_error.unwrap_or_else(|| "No JSON object or array found".to_string()))
}

fn parse_repaired(text: &str) -> Result<(Value, String), String> {
    let candidate = find_json_span(text).unwrap_or(text);
    let repaired = repair_json(candidate);
    let value = serde_json::from_str(&repaired).map_err(|e| e.to_string())?;
    Ok((value, repaired))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn strips_tagged_and_bare_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn span_prefers_earliest_opener() {
        assert_eq!(find_json_span("x {\"a\":[1]} y"), Some("{\"a\":[1]}"));
        assert_eq!(find_json_span("x [{\"a\":1}] y"), Some("[{\"a\":1}]"));
        assert_eq!(find_json_span("no json here"), None);
        assert_eq!(find_json_span("} backwards {"), None);
    }

    #[test]
    fn embedded_span_falls_back_to_other_opener() {
        // The object span runs past the array and does not parse.
        let (value, span) = parse_embedded_span("{oops [1, 2] }").unwrap();
        assert_eq!(value, serde_json::json!([1, 2]));
        assert_eq!(span, "[1, 2]");
    }

    #[test]
    fn repairs_trailing_commas_and_bare_keys() {
        assert_eq!(repair_json("{\"a\":1,}"), "{\"a\":1}");
        assert_eq!(repair_json("[1, 2, ]"), "[1, 2]");
        assert_eq!(
            repair_json("{name: \"x\", count: 2}"),
            "{\"name\": \"x\", \"count\": 2}"
        );
    }

    #[test]
    fn object_spans_respect_strings_and_nesting() {
        let text = r#"a {"x":"}"} b {"y":{"z":1}} c"#;
        assert_eq!(object_spans(text), vec![r#"{"x":"}"}"#, r#"{"y":{"z":1}}"#]);
    }
}
