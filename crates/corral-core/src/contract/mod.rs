//! Declarative schema contracts for structured model output.
//!
//! A [`SchemaContract`] describes the JSON object a caller expects back. The
//! same contract renders the natural-language shape description placed in a
//! prompt ([`SchemaContract::render`]) and checks the extracted data
//! ([`SchemaContract::validate`]).
//!
//! Contracts are plain data: build one with the builder methods or
//! deserialize it from JSON, then share it immutably.

mod render;
mod validate;

pub use validate::ValidationReport;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::String, Value::String(_))
                | (Self::Number, Value::Number(_))
                | (Self::Boolean, Value::Bool(_))
                | (Self::Array, Value::Array(_))
                | (Self::Object, Value::Object(_))
        )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_required() -> bool {
    true
}

/// Constraints on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// Item type for `array` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<FieldType>,
    /// Nested contract for `object` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<SchemaContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub const fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            min: None,
            max: None,
            enum_values: None,
            items: None,
            properties: None,
            description: None,
        }
    }

    pub const fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub const fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub const fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub const fn array(items: FieldType) -> Self {
        let mut spec = Self::new(FieldType::Array);
        spec.items = Some(items);
        spec
    }

    pub fn object(properties: SchemaContract) -> Self {
        let mut spec = Self::new(FieldType::Object);
        spec.properties = Some(properties);
        spec
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub const fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    #[must_use]
    pub const fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    #[must_use]
    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Ordered field name to [`FieldSpec`] mapping.
///
/// Field order is preserved so rendered instructions are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaContract {
    fields: IndexMap<String, FieldSpec>,
}

impl SchemaContract {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of fields that must be present.
    pub fn required_fields(&self) -> Vec<&str> {
        self.fields()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
