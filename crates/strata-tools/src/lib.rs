use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use strata_store::{Store, StoreError};
use strata_types::{RecordEvent, SchemaType, ToolResult, ToolSchema};

mod automation_tools;
mod data;
mod record_tools;
mod schema_tools;

pub use data::{conform_record_data, normalize_field_config, DataMode};
pub use record_tools::{clamp_page, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use schema_tools::load_schema;

/// Failure of a single tool call. Always reported back to the model as a
/// failed tool result; never aborts the agent loop.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(entity) => ToolError::NotFound(entity),
            other => ToolError::Store(other),
        }
    }
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "VALIDATION_ERROR",
            ToolError::NotFound(_) => "NOT_FOUND",
            ToolError::Store(_) => "STORE_ERROR",
            ToolError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Tenancy scope of one tool call. No handler may act outside `app_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub app_id: String,
    pub user_id: String,
}

impl ToolContext {
    pub fn new(app_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Narrow publish capability handed to the record tools. Publishing must not
/// block on, or fail because of, subscribers.
pub trait RecordEventSink: Send + Sync {
    fn publish(&self, event: RecordEvent);
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Typed tool: `validate` turns raw model input into `Args`, `run` performs
/// exactly one store operation under the caller's context.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    type Args: DeserializeOwned + Send;

    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;

    fn validate(&self, input: Value) -> Result<Self::Args, ToolError> {
        parse_args(self.name(), input)
    }

    async fn run(&self, args: Self::Args, ctx: &ToolContext) -> Result<Value, ToolError>;
}

#[async_trait]
impl<H: ToolHandler> Tool for H {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args = self.validate(args)?;
        self.run(args, ctx).await
    }
}

pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, input: Value) -> Result<T, ToolError> {
    let input = if input.is_null() { json!({}) } else { input };
    serde_json::from_value(input)
        .map_err(|err| ToolError::Validation(format!("Invalid arguments for {tool}: {err}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn require_text(label: &str, value: &str) -> Result<String, ToolError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ToolError::Validation(format!("{label} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Resolves a type id within the caller's app. Types of other apps are
/// reported exactly like missing ones.
pub(crate) async fn owned_type(
    store: &dyn Store,
    ctx: &ToolContext,
    type_id: &str,
) -> Result<SchemaType, ToolError> {
    store
        .get_type(&ctx.app_id, type_id)
        .await?
        .ok_or(ToolError::NotFound("Type"))
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Registry with every schema, record and automation tool bound to
    /// `store`; record mutations are published through `events`.
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn RecordEventSink>) -> Self {
        let mut builtins: Vec<Arc<dyn Tool>> = Vec::new();
        builtins.extend(schema_tools::tools(&store));
        builtins.extend(record_tools::tools(&store, &events));
        builtins.extend(automation_tools::tools(&store));
        let map = builtins
            .into_iter()
            .map(|tool| (tool.schema().name, tool))
            .collect::<HashMap<_, _>>();
        Self {
            tools: Arc::new(map),
        }
    }

    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self.tools.values().map(|t| t.schema()).collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Runs one tool call. Every failure, including an unknown tool name,
    /// comes back as `success: false`.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let tool = self.tools.get(name).cloned();
        let Some(tool) = tool else {
            tracing::warn!(tool = name, app_id = %ctx.app_id, "unknown tool requested");
            return ToolResult::failed(format!("Unknown tool: {name}"));
        };
        let started = Instant::now();
        match tool.execute(args, ctx).await {
            Ok(result) => {
                tracing::debug!(
                    tool = name,
                    app_id = %ctx.app_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call succeeded"
                );
                ToolResult::ok(result)
            }
            Err(err) => {
                tracing::info!(
                    tool = name,
                    app_id = %ctx.app_id,
                    code = err.code(),
                    error = %err,
                    "tool call failed"
                );
                ToolResult::failed(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Catalog shape check: object schemas at the root, arrays declare `items`.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        if schema.input_schema.get("type").and_then(|t| t.as_str()) != Some("object") {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path: "$".to_string(),
                reason: "root schema must be an object".to_string(),
            });
        }
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(combinator).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{combinator}[{idx}]"), child)?;
            }
        }
    }
    Ok(())
}
