use std::collections::HashMap;
use std::fmt::Write;

use strata_types::{FieldKind, TypeSchema};

/// Renders an app schema as plain text for the model. Output depends only on
/// the given snapshot, in the order given.
pub fn describe_schema(types: &[TypeSchema]) -> String {
    if types.is_empty() {
        return "This app has no types yet.".to_string();
    }
    let names: HashMap<&str, &str> = types
        .iter()
        .map(|t| (t.schema_type.id.as_str(), t.schema_type.name.as_str()))
        .collect();

    let mut out = String::new();
    for (index, entry) in types.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        let ty = &entry.schema_type;
        let _ = write!(out, "Type \"{}\" (id: {})", ty.name, ty.id);
        if let Some(description) = ty.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let _ = write!(out, ": {}", description.trim());
        }
        out.push('\n');
        if entry.fields.is_empty() {
            out.push_str("  (no fields)\n");
            continue;
        }
        for field in &entry.fields {
            let _ = write!(out, "  - \"{}\" (id: {}, {}", field.name, field.id, field.kind);
            if field.required {
                out.push_str(", required");
            }
            out.push(')');
            match field.kind {
                FieldKind::Relation => {
                    if let Some(target) = field.related_type_id() {
                        let label = names.get(target).copied().unwrap_or("unknown type");
                        let _ = write!(out, " -> {label} ({target})");
                    }
                }
                FieldKind::Select | FieldKind::MultiSelect => {
                    let options = select_options(&field.config);
                    if !options.is_empty() {
                        let _ = write!(out, " options: {}", options.join(", "));
                    }
                }
                _ => {}
            }
            out.push('\n');
        }
    }
    out
}

pub fn build_system_prompt(app_name: &str, types: &[TypeSchema]) -> String {
    format!(
        "You are the builder assistant for the app \"{app_name}\". You can change its schema, \
manage its records and write automations by calling the tools provided.\n\
Record data is keyed by field id. Use the ids below when calling tools, and call \
list_types to re-read the schema after changing it.\n\n\
Current schema:\n{}",
        describe_schema(types)
    )
}

fn select_options(config: &serde_json::Value) -> Vec<String> {
    config
        .get("options")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => other
                        .get("label")
                        .or_else(|| other.get("value"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}
