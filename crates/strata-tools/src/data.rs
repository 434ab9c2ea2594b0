use serde_json::{json, Value};

use strata_types::{Field, FieldKind, RecordData};

use crate::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    Create,
    Update,
}

/// Checks record data against a type's fields and rewrites field-name keys
/// to field ids. On create, required fields must be present and non-null.
pub fn conform_record_data(
    data: Value,
    fields: &[Field],
    mode: DataMode,
) -> Result<RecordData, ToolError> {
    let input = match data {
        Value::Object(map) => map,
        Value::Null if mode == DataMode::Create => RecordData::new(),
        _ => {
            return Err(ToolError::Validation(
                "Record data must be an object keyed by field id or name".to_string(),
            ))
        }
    };

    let mut out = RecordData::new();
    for (key, value) in input {
        let Some(field) = resolve_field(fields, &key) else {
            return Err(ToolError::Validation(format!("Unknown field \"{key}\"")));
        };
        if !field.kind.accepts(&value) {
            return Err(ToolError::Validation(format!(
                "Field \"{}\" expects {}",
                field.name,
                expected_shape(field.kind)
            )));
        }
        out.insert(field.id.clone(), value);
    }

    if mode == DataMode::Create {
        let missing = fields
            .iter()
            .filter(|f| f.required)
            .filter(|f| out.get(&f.id).map(Value::is_null).unwrap_or(true))
            .map(|f| format!("\"{}\"", f.name))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ToolError::Validation(format!(
                "Missing required field(s): {}",
                missing.join(", ")
            )));
        }
    }
    Ok(out)
}

fn resolve_field<'a>(fields: &'a [Field], key: &str) -> Option<&'a Field> {
    fields
        .iter()
        .find(|f| f.id == key)
        .or_else(|| fields.iter().find(|f| f.name == key))
        .or_else(|| fields.iter().find(|f| f.name.eq_ignore_ascii_case(key.trim())))
}

fn expected_shape(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Number => "a number",
        FieldKind::Boolean => "a boolean",
        FieldKind::MultiSelect => "an array of strings",
        FieldKind::Relation => "a record id or an array of record ids",
        _ => "a string",
    }
}

/// Normalizes the free-form config for `kind`. Relations must name their
/// target type; whether that type exists is not checked here.
pub fn normalize_field_config(kind: FieldKind, config: Option<Value>) -> Result<Value, ToolError> {
    let mut config = match config {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ToolError::Validation(
                "Field config must be an object".to_string(),
            ))
        }
    };

    match kind {
        FieldKind::Relation => {
            if let Some(legacy) = config.remove("related_type_id") {
                config.entry("relatedTypeId").or_insert(legacy);
            }
            let related = config
                .get("relatedTypeId")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or_default();
            if related.is_empty() {
                return Err(ToolError::Validation(
                    "Relation fields require config.relatedTypeId".to_string(),
                ));
            }
        }
        FieldKind::Select | FieldKind::MultiSelect => match config.get("options") {
            None | Some(Value::Null) => {
                config.insert("options".to_string(), json!([]));
            }
            Some(Value::Array(_)) => {}
            Some(_) => {
                return Err(ToolError::Validation(
                    "config.options must be an array".to_string(),
                ))
            }
        },
        _ => {}
    }
    Ok(Value::Object(config))
}
