use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use strata_store::Store;
use strata_types::{Field, FieldKind, FieldPatch, SchemaType, TypePatch, TypeSchema};

use crate::data::normalize_field_config;
use crate::{owned_type, require_text, to_json, Tool, ToolContext, ToolError, ToolHandler};

pub(crate) fn tools(store: &Arc<dyn Store>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(CreateTypeTool {
            store: store.clone(),
        }),
        Arc::new(UpdateTypeTool {
            store: store.clone(),
        }),
        Arc::new(DeleteTypeTool {
            store: store.clone(),
        }),
        Arc::new(ListTypesTool {
            store: store.clone(),
        }),
        Arc::new(CreateFieldTool {
            store: store.clone(),
        }),
        Arc::new(UpdateFieldTool {
            store: store.clone(),
        }),
        Arc::new(DeleteFieldTool {
            store: store.clone(),
        }),
    ]
}

/// Live schema of one app: types in position order, each with its fields.
pub async fn load_schema(store: &dyn Store, app_id: &str) -> Result<Vec<TypeSchema>, ToolError> {
    let mut schema = Vec::new();
    for schema_type in store.list_types(app_id).await? {
        let fields = store.list_fields(&schema_type.id).await?;
        schema.push(TypeSchema {
            schema_type,
            fields,
        });
    }
    Ok(schema)
}

fn parse_kind(raw: &str) -> Result<FieldKind, ToolError> {
    FieldKind::parse(raw).ok_or_else(|| {
        let allowed = FieldKind::ALL
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        ToolError::Validation(format!(
            "Invalid field type \"{raw}\". Expected one of: {allowed}"
        ))
    })
}

async fn ensure_unique_field_name(
    store: &dyn Store,
    type_id: &str,
    name: &str,
    except_field: Option<&str>,
) -> Result<(), ToolError> {
    let taken = store.list_fields(type_id).await?.into_iter().any(|f| {
        f.name.eq_ignore_ascii_case(name) && Some(f.id.as_str()) != except_field
    });
    if taken {
        return Err(ToolError::Validation(format!(
            "A field named \"{name}\" already exists on this type"
        )));
    }
    Ok(())
}

fn kind_enum() -> Value {
    Value::Array(
        FieldKind::ALL
            .iter()
            .map(|k| Value::String(k.as_str().to_string()))
            .collect(),
    )
}

struct CreateTypeTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct CreateTypeArgs {
    name: String,
    description: Option<String>,
    icon: Option<String>,
}

#[async_trait]
impl ToolHandler for CreateTypeTool {
    type Args = CreateTypeArgs;

    fn name(&self) -> &'static str {
        "create_type"
    }

    fn description(&self) -> &'static str {
        "Create a new type (table) in the app schema."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Display name, e.g. Contact"},
                "description": {"type": "string"},
                "icon": {"type": "string", "description": "Emoji or icon name"}
            },
            "required": ["name"]
        })
    }

    async fn run(&self, args: CreateTypeArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let name = require_text("Type name", &args.name)?;
        // Count then insert without locking: concurrent creates may share a position.
        let position = self.store.count_types(&ctx.app_id).await?;
        let mut schema_type = SchemaType::new(&ctx.app_id, name, position);
        schema_type.description = args.description;
        schema_type.icon = args.icon;
        let created = self.store.insert_type(schema_type).await?;
        to_json(&created)
    }
}

struct UpdateTypeTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct UpdateTypeArgs {
    type_id: String,
    name: Option<String>,
    description: Option<String>,
    icon: Option<String>,
}

#[async_trait]
impl ToolHandler for UpdateTypeTool {
    type Args = UpdateTypeArgs;

    fn name(&self) -> &'static str {
        "update_type"
    }

    fn description(&self) -> &'static str {
        "Rename a type or change its description or icon."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "name": {"type": "string"},
                "description": {"type": "string"},
                "icon": {"type": "string"}
            },
            "required": ["type_id"]
        })
    }

    async fn run(&self, args: UpdateTypeArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let current = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        let patch = TypePatch {
            name: args
                .name
                .as_deref()
                .map(|name| require_text("Type name", name))
                .transpose()?,
            description: args.description,
            icon: args.icon,
        };
        if patch.is_empty() {
            return to_json(&current);
        }
        let updated = self.store.update_type(&current.id, patch).await?;
        to_json(&updated)
    }
}

struct DeleteTypeTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct TypeIdArgs {
    type_id: String,
}

#[async_trait]
impl ToolHandler for DeleteTypeTool {
    type Args = TypeIdArgs;

    fn name(&self) -> &'static str {
        "delete_type"
    }

    fn description(&self) -> &'static str {
        "Delete a type together with all of its fields and records."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"type_id": {"type": "string"}},
            "required": ["type_id"]
        })
    }

    async fn run(&self, args: TypeIdArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let existing = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        self.store.delete_type(&existing.id).await?;
        Ok(json!({"deleted": true, "id": existing.id, "name": existing.name}))
    }
}

struct ListTypesTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct NoArgs {}

#[async_trait]
impl ToolHandler for ListTypesTool {
    type Args = NoArgs;

    fn name(&self) -> &'static str {
        "list_types"
    }

    fn description(&self) -> &'static str {
        "Read the current schema: every type with its fields."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn run(&self, _args: NoArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let types = load_schema(self.store.as_ref(), &ctx.app_id).await?;
        Ok(json!({"types": to_json(&types)?}))
    }
}

struct CreateFieldTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct CreateFieldArgs {
    type_id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    config: Option<Value>,
    #[serde(default)]
    required: bool,
}

#[async_trait]
impl ToolHandler for CreateFieldTool {
    type Args = CreateFieldArgs;

    fn name(&self) -> &'static str {
        "create_field"
    }

    fn description(&self) -> &'static str {
        "Add a field (column) to a type. Select fields take config.options; relation fields need config.relatedTypeId."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "name": {"type": "string"},
                "type": {"type": "string", "enum": kind_enum()},
                "config": {
                    "type": "object",
                    "properties": {
                        "options": {"type": "array", "items": {"type": "string"}},
                        "relatedTypeId": {"type": "string"}
                    }
                },
                "required": {"type": "boolean"}
            },
            "required": ["type_id", "name", "type"]
        })
    }

    async fn run(&self, args: CreateFieldArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let parent = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        let name = require_text("Field name", &args.name)?;
        let kind = parse_kind(&args.kind)?;
        let config = normalize_field_config(kind, args.config)?;
        ensure_unique_field_name(self.store.as_ref(), &parent.id, &name, None).await?;

        let position = self.store.count_fields(&parent.id).await?;
        let mut field = Field::new(&parent.id, name, kind, position);
        field.config = config;
        field.required = args.required;
        let created = self.store.insert_field(field).await?;
        to_json(&created)
    }
}

struct UpdateFieldTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct UpdateFieldArgs {
    type_id: String,
    field_id: String,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    config: Option<Value>,
    required: Option<bool>,
}

#[async_trait]
impl ToolHandler for UpdateFieldTool {
    type Args = UpdateFieldArgs;

    fn name(&self) -> &'static str {
        "update_field"
    }

    fn description(&self) -> &'static str {
        "Rename a field or change its type, config or required flag."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "field_id": {"type": "string"},
                "name": {"type": "string"},
                "type": {"type": "string", "enum": kind_enum()},
                "config": {"type": "object"},
                "required": {"type": "boolean"}
            },
            "required": ["type_id", "field_id"]
        })
    }

    async fn run(&self, args: UpdateFieldArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let parent = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        let current = self
            .store
            .get_field(&parent.id, &args.field_id)
            .await?
            .ok_or(ToolError::NotFound("Field"))?;

        let name = match args.name.as_deref() {
            Some(raw) => {
                let name = require_text("Field name", raw)?;
                ensure_unique_field_name(self.store.as_ref(), &parent.id, &name, Some(&current.id))
                    .await?;
                Some(name)
            }
            None => None,
        };
        let kind = args.kind.as_deref().map(parse_kind).transpose()?;
        let config = if args.config.is_some() || kind.is_some_and(|k| k != current.kind) {
            let target = kind.unwrap_or(current.kind);
            Some(normalize_field_config(
                target,
                args.config.or_else(|| Some(current.config.clone())),
            )?)
        } else {
            None
        };

        let patch = FieldPatch {
            name,
            kind,
            config,
            required: args.required,
        };
        if patch.is_empty() {
            return to_json(&current);
        }
        let updated = self.store.update_field(&current.id, patch).await?;
        to_json(&updated)
    }
}

struct DeleteFieldTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct FieldIdArgs {
    type_id: String,
    field_id: String,
}

#[async_trait]
impl ToolHandler for DeleteFieldTool {
    type Args = FieldIdArgs;

    fn name(&self) -> &'static str {
        "delete_field"
    }

    fn description(&self) -> &'static str {
        "Remove a field from a type."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "field_id": {"type": "string"}
            },
            "required": ["type_id", "field_id"]
        })
    }

    async fn run(&self, args: FieldIdArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let parent = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        let field = self
            .store
            .get_field(&parent.id, &args.field_id)
            .await?
            .ok_or(ToolError::NotFound("Field"))?;
        self.store.delete_field(&field.id).await?;
        Ok(json!({"deleted": true, "id": field.id, "name": field.name}))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::test_support::Harness;
    use strata_store::Store;

    #[tokio::test]
    async fn positions_follow_sibling_count() {
        let harness = Harness::new().await;
        let contact = harness.call_ok("create_type", json!({"name": "Contact"})).await;
        assert_eq!(contact["position"], json!(0));
        let company = harness.call_ok("create_type", json!({"name": "Company"})).await;
        assert_eq!(company["position"], json!(1));
        assert_eq!(company["appId"], json!(harness.ctx.app_id));
    }

    #[tokio::test]
    async fn positions_are_not_renumbered_after_delete() {
        let harness = Harness::new().await;
        let first = harness.create_type("First").await;
        harness.create_type("Second").await;
        harness
            .call_ok("delete_type", json!({"type_id": first}))
            .await;
        let third = harness.call_ok("create_type", json!({"name": "Third"})).await;
        assert_eq!(third["position"], json!(1));
    }

    #[tokio::test]
    async fn relation_field_echoes_related_type_id() {
        let harness = Harness::new().await;
        let contact = harness.create_type("Contact").await;
        let company = harness.create_type("Company").await;
        let field = harness
            .call_ok(
                "create_field",
                json!({
                    "type_id": contact,
                    "name": "Employer",
                    "type": "relation",
                    "config": {"relatedTypeId": company}
                }),
            )
            .await;
        assert_eq!(field["type"], json!("relation"));
        assert_eq!(field["config"]["relatedTypeId"], json!(company));
        let stored = harness
            .store
            .list_fields(&contact)
            .await
            .expect("fields");
        assert_eq!(stored[0].related_type_id(), Some(company.as_str()));
    }

    #[tokio::test]
    async fn relation_target_existence_is_not_checked() {
        let harness = Harness::new().await;
        let contact = harness.create_type("Contact").await;
        let result = harness
            .call(
                "create_field",
                json!({
                    "type_id": contact,
                    "name": "Ghost",
                    "type": "relation",
                    "config": {"relatedTypeId": "no-such-type"}
                }),
            )
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn field_validation_failures() {
        let harness = Harness::new().await;
        let contact = harness.create_type("Contact").await;
        harness.create_field(&contact, "Email", "email").await;

        let duplicate = harness
            .call(
                "create_field",
                json!({"type_id": contact, "name": "email", "type": "text"}),
            )
            .await;
        assert_eq!(
            duplicate.error.as_deref(),
            Some("A field named \"email\" already exists on this type")
        );

        let bad_kind = harness
            .call(
                "create_field",
                json!({"type_id": contact, "name": "Score", "type": "decimal"}),
            )
            .await;
        assert!(bad_kind
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with("Invalid field type \"decimal\""));

        let missing = harness
            .call(
                "update_field",
                json!({"type_id": contact, "field_id": "nope", "name": "X"}),
            )
            .await;
        assert_eq!(missing.error.as_deref(), Some("Field not found"));
    }

    #[tokio::test]
    async fn field_from_another_type_is_not_found() {
        let harness = Harness::new().await;
        let contact = harness.create_type("Contact").await;
        let company = harness.create_type("Company").await;
        let field = harness.create_field(&company, "Name", "text").await;
        let result = harness
            .call(
                "delete_field",
                json!({"type_id": contact, "field_id": field}),
            )
            .await;
        assert_eq!(result.error.as_deref(), Some("Field not found"));
        assert_eq!(harness.store.count_fields(&company).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn changing_kind_to_select_adds_options() {
        let harness = Harness::new().await;
        let contact = harness.create_type("Contact").await;
        let field = harness.create_field(&contact, "Stage", "text").await;
        let updated = harness
            .call_ok(
                "update_field",
                json!({"type_id": contact, "field_id": field, "type": "select"}),
            )
            .await;
        assert_eq!(updated["type"], json!("select"));
        assert_eq!(updated["config"]["options"], json!([]));
    }

    #[tokio::test]
    async fn list_types_returns_fields_in_order() {
        let harness = Harness::new().await;
        let contact = harness.create_type("Contact").await;
        harness.create_field(&contact, "Name", "text").await;
        harness.create_field(&contact, "Tags", "multi_select").await;
        let listed = harness.call_ok("list_types", json!({})).await;
        let types = listed["types"].as_array().expect("types");
        assert_eq!(types.len(), 1);
        assert_eq!(types[0]["name"], json!("Contact"));
        assert_eq!(types[0]["fields"][0]["name"], json!("Name"));
        assert_eq!(types[0]["fields"][1]["position"], json!(1));
        assert_eq!(types[0]["fields"][1]["config"]["options"], json!([]));
    }

    #[tokio::test]
    async fn update_type_renames() {
        let harness = Harness::new().await;
        let contact = harness.create_type("Contact").await;
        let updated = harness
            .call_ok(
                "update_type",
                json!({"type_id": contact, "name": "Person", "icon": "👤"}),
            )
            .await;
        assert_eq!(updated["name"], json!("Person"));
        assert_eq!(updated["icon"], json!("👤"));
        let empty_name = harness
            .call("update_type", json!({"type_id": contact, "name": "  "}))
            .await;
        assert_eq!(empty_name.error.as_deref(), Some("Type name must not be empty"));
    }
}
