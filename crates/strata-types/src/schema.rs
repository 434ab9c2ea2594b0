use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Tenancy root. Every other entity is reachable only through an app the
/// caller owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

impl App {
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            owner_id: owner_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// A user-defined type ("table") inside an app.
///
/// `position` is the count of sibling types at creation time. It is advisory
/// display order only: deletes never renumber, and concurrent creates may
/// share a value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaType {
    pub id: String,
    pub app_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub position: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaType {
    pub fn new(app_id: impl Into<String>, name: impl Into<String>, position: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            name: name.into(),
            description: None,
            icon: None,
            position,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TypePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
}

impl TypePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.icon.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    RichText,
    Number,
    Boolean,
    Date,
    Select,
    MultiSelect,
    Url,
    Email,
    Relation,
}

impl FieldKind {
    pub const ALL: [FieldKind; 10] = [
        FieldKind::Text,
        FieldKind::RichText,
        FieldKind::Number,
        FieldKind::Boolean,
        FieldKind::Date,
        FieldKind::Select,
        FieldKind::MultiSelect,
        FieldKind::Url,
        FieldKind::Email,
        FieldKind::Relation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::RichText => "rich_text",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Select => "select",
            FieldKind::MultiSelect => "multi_select",
            FieldKind::Url => "url",
            FieldKind::Email => "email",
            FieldKind::Relation => "relation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        FieldKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }

    /// Whether a record value has the shape this kind stores. `null` always
    /// conforms so optional fields can be cleared.
    pub fn accepts(self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            FieldKind::Text
            | FieldKind::RichText
            | FieldKind::Date
            | FieldKind::Select
            | FieldKind::Url
            | FieldKind::Email => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::MultiSelect => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            FieldKind::Relation => {
                value.is_string()
                    || value
                        .as_array()
                        .map(|items| items.iter().all(Value::is_string))
                        .unwrap_or(false)
            }
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: String,
    pub type_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    /// Free-form per kind: `{"options": [...]}` for select kinds,
    /// `{"relatedTypeId": "..."}` for relations.
    #[serde(default = "empty_config")]
    pub config: Value,
    #[serde(default)]
    pub required: bool,
    pub position: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Field {
    pub fn new(
        type_id: impl Into<String>,
        name: impl Into<String>,
        kind: FieldKind,
        position: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            type_id: type_id.into(),
            name: name.into(),
            kind,
            config: empty_config(),
            required: false,
            position,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn related_type_id(&self) -> Option<&str> {
        if self.kind != FieldKind::Relation {
            return None;
        }
        self.config.get("relatedTypeId").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldPatch {
    pub name: Option<String>,
    pub kind: Option<FieldKind>,
    pub config: Option<Value>,
    pub required: Option<bool>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.kind.is_none() && self.config.is_none() && self.required.is_none()
    }
}

/// A type together with its fields, as read at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypeSchema {
    #[serde(flatten)]
    pub schema_type: SchemaType,
    pub fields: Vec<Field>,
}

pub fn empty_config() -> Value {
    json!({})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_kind_round_trips_wire_names() {
        for kind in FieldKind::ALL {
            assert_eq!(FieldKind::parse(kind.as_str()), Some(kind));
            let encoded = serde_json::to_value(kind).expect("encode");
            assert_eq!(encoded, json!(kind.as_str()));
        }
        assert_eq!(FieldKind::parse("Multi-Select"), Some(FieldKind::MultiSelect));
        assert_eq!(FieldKind::parse("formula"), None);
    }

    #[test]
    fn field_kind_accepts_values_by_shape() {
        assert!(FieldKind::Text.accepts(&json!("hello")));
        assert!(!FieldKind::Text.accepts(&json!(3)));
        assert!(FieldKind::Number.accepts(&json!(3.5)));
        assert!(FieldKind::Boolean.accepts(&json!(false)));
        assert!(FieldKind::MultiSelect.accepts(&json!(["a", "b"])));
        assert!(!FieldKind::MultiSelect.accepts(&json!(["a", 1])));
        assert!(FieldKind::Relation.accepts(&json!("rec-1")));
        assert!(FieldKind::Relation.accepts(&json!(["rec-1", "rec-2"])));
        assert!(FieldKind::Email.accepts(&Value::Null));
    }

    #[test]
    fn field_serializes_kind_as_type() {
        let mut field = Field::new("t1", "Company", FieldKind::Relation, 0);
        field.config = json!({"relatedTypeId": "t2"});
        let value = serde_json::to_value(&field).expect("encode");
        assert_eq!(value["type"], json!("relation"));
        assert_eq!(value["typeId"], json!("t1"));
        assert_eq!(field.related_type_id(), Some("t2"));
    }
}
