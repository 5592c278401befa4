use std::fmt::Write as _;

use super::{FieldSpec, FieldType, SchemaContract};

const INDENT: &str = "  ";

impl SchemaContract {
    /// Render a prompt fragment describing the expected JSON shape.
    ///
    /// Pure formatting: identical input always yields identical output.
    pub fn render(&self, instruction: &str) -> String {
        let mut out = String::new();
        let instruction = instruction.trim();
        if !instruction.is_empty() {
            out.push_str(instruction);
            out.push_str("\n\n");
        }
        out.push_str("Respond with a single JSON object matching this structure:\n");
        out.push_str("{\n");
        render_fields(self, 1, &mut out);
        out.push_str("}\n");
        out.push_str("Return only the JSON object, with no additional commentary.");
        out
    }
}

fn render_fields(contract: &SchemaContract, depth: usize, out: &mut String) {
    let indent = INDENT.repeat(depth);
    let count = contract.len();
    for (i, (name, spec)) in contract.fields().enumerate() {
        let comma = if i + 1 < count { "," } else { "" };
        let note = field_note(spec);

        match &spec.properties {
            Some(nested) if spec.field_type == FieldType::Object && !nested.is_empty() => {
                let _ = writeln!(out, "{indent}\"{name}\": {{ // {note}");
                render_fields(nested, depth + 1, out);
                let _ = writeln!(out, "{indent}}}{comma}");
            }
            _ => {
                let _ = writeln!(out, "{indent}\"{name}\": {}{comma} // {note}", type_label(spec));
            }
        }
    }
}

fn type_label(spec: &FieldSpec) -> String {
    let mut label = match (&spec.enum_values, spec.field_type, spec.items) {
        (Some(values), _, _) if !values.is_empty() => values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | "),
        (_, FieldType::Array, Some(items)) => format!("array<{items}>"),
        (_, field_type, _) => field_type.to_string(),
    };

    let bounds: Vec<String> = [("min", spec.min), ("max", spec.max)]
        .into_iter()
        .filter_map(|(key, bound)| bound.map(|b| format!("{key}: {b}")))
        .collect();
    if !bounds.is_empty() {
        let _ = write!(label, " ({})", bounds.join(", "));
    }
    label
}

fn field_note(spec: &FieldSpec) -> String {
    let presence = if spec.required { "required" } else { "optional" };
    match spec.description.as_deref().map(str::trim) {
        Some(desc) if !desc.is_empty() => format!("{presence}. {desc}"),
        _ => presence.to_string(),
    }
}
