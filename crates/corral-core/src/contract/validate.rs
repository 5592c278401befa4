use serde::Serialize;
use serde_json::{Map, Value};

use super::{FieldSpec, SchemaContract};

/// Outcome of checking data against a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl SchemaContract {
    /// Check `data` against every declared field, collecting all violations.
    ///
    /// Undeclared fields on `data` are ignored. A `null` value counts as absent.
    pub fn validate(&self, data: &Value) -> ValidationReport {
        let mut errors = Vec::new();
        match data.as_object() {
            Some(obj) => validate_object(self, obj, "", &mut errors),
            None => errors.push(format!("Expected a JSON object, got {}", json_type(data))),
        }
        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }
}

fn validate_object(
    contract: &SchemaContract,
    obj: &Map<String, Value>,
    prefix: &str,
    errors: &mut Vec<String>,
) {
    for (name, spec) in contract.fields() {
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        };
        match obj.get(name) {
            None | Some(Value::Null) => {
                if spec.required {
                    errors.push(format!("Missing required field '{path}'"));
                }
            }
            Some(value) => validate_field(&path, spec, value, errors),
        }
    }
}

fn validate_field(path: &str, spec: &FieldSpec, value: &Value, errors: &mut Vec<String>) {
    if !spec.field_type.matches(value) {
        errors.push(format!(
            "Field '{path}' should be {}, got {}",
            spec.field_type,
            json_type(value)
        ));
        return;
    }

    if let Some(allowed) = &spec.enum_values
        && !allowed.contains(value)
    {
        let allowed = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        errors.push(format!(
            "Field '{path}' must be one of [{allowed}], got {value}"
        ));
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = spec.min
            && n < min
        {
            errors.push(format!("Field '{path}' must be >= {min}, got {n}"));
        }
        if let Some(max) = spec.max
            && n > max
        {
            errors.push(format!("Field '{path}' must be <= {max}, got {n}"));
        }
    }

    match value {
        Value::Array(items) => {
            if let Some(item_type) = spec.items {
                for (i, item) in items.iter().enumerate() {
                    if !item_type.matches(item) {
                        errors.push(format!(
                            "Field '{path}[{i}]' should be {item_type}, got {}",
                            json_type(item)
                        ));
                    }
                }
            }
        }
        Value::Object(obj) => {
            if let Some(nested) = &spec.properties {
                validate_object(nested, obj, path, errors);
            }
        }
        _ => {}
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FieldSpec, FieldType};
    use serde_json::json;

    fn contract() -> SchemaContract {
        SchemaContract::new()
            .field("verdict", FieldSpec::string().one_of(["approve", "reject"]))
            .field("score", FieldSpec::number().min(0.0).max(10.0))
            .field("notes", FieldSpec::string().optional())
            .field("files", FieldSpec::array(FieldType::String).optional())
    }

    #[test]
    fn valid_data_passes() {
        let report = contract().validate(&json!({
            "verdict": "approve",
            "score": 7,
            "files": ["a.rs"],
            "extra": {"ignored": true}
        }));
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn accumulates_independent_violations() {
        let report = contract().validate(&json!({"verdict": "maybe", "score": 42}));
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
        assert!(report.errors[0].contains("verdict"));
        assert!(report.errors[1].contains("score"));
    }

    #[test]
    fn missing_required_and_wrong_type() {
        let report = contract().validate(&json!({"score": "high", "notes": null}));
        assert_eq!(
            report.errors,
            vec![
                "Missing required field 'verdict'".to_string(),
                "Field 'score' should be number, got string".to_string(),
            ]
        );
    }

    #[test]
    fn array_items_and_nested_objects_use_paths() {
        let contract = SchemaContract::new()
            .field("files", FieldSpec::array(FieldType::String))
            .field(
                "author",
                FieldSpec::object(SchemaContract::new().field("name", FieldSpec::string())),
            );
        let report = contract.validate(&json!({"files": ["ok", 3], "author": {}}));
        assert_eq!(
            report.errors,
            vec![
                "Field 'files[1]' should be string, got number".to_string(),
                "Missing required field 'author.name'".to_string(),
            ]
        );
    }

    #[test]
    fn non_object_data_is_rejected() {
        let report = contract().validate(&json!([1, 2]));
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["Expected a JSON object, got array"]);
    }
}
