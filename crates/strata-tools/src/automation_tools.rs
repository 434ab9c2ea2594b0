use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use strata_store::Store;
use strata_types::{Automation, AutomationPatch, AutomationTrigger};

use crate::{owned_type, require_text, to_json, Tool, ToolContext, ToolError, ToolHandler};

pub(crate) fn tools(store: &Arc<dyn Store>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(CreateAutomationTool {
            store: store.clone(),
        }),
        Arc::new(UpdateAutomationTool {
            store: store.clone(),
        }),
        Arc::new(ListAutomationsTool {
            store: store.clone(),
        }),
    ]
}

const TRIGGERS: [&str; 4] = ["record_created", "record_updated", "record_deleted", "manual"];

fn parse_trigger(raw: &str) -> Result<AutomationTrigger, ToolError> {
    AutomationTrigger::parse(raw).ok_or_else(|| {
        ToolError::Validation(format!(
            "Invalid trigger \"{raw}\". Expected one of: {}",
            TRIGGERS.join(", ")
        ))
    })
}

const SCRIPT_HELP: &str = "Script body. It sees `record` (and `previousRecord` on updates) and may call \
log(message), createRecord(typeId, data), updateRecord(typeId, recordId, data), deleteRecord(typeId, recordId).";

struct CreateAutomationTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct CreateAutomationArgs {
    name: String,
    type_id: String,
    trigger: String,
    code: String,
    description: Option<String>,
}

#[async_trait]
impl ToolHandler for CreateAutomationTool {
    type Args = CreateAutomationArgs;

    fn name(&self) -> &'static str {
        "create_automation"
    }

    fn description(&self) -> &'static str {
        "Create an automation that runs a script when records of a type are created, updated or deleted."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "type_id": {"type": "string"},
                "trigger": {"type": "string", "enum": TRIGGERS},
                "code": {"type": "string", "description": SCRIPT_HELP},
                "description": {"type": "string"}
            },
            "required": ["name", "type_id", "trigger", "code"]
        })
    }

    async fn run(&self, args: CreateAutomationArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let parent = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        let name = require_text("Automation name", &args.name)?;
        let trigger = parse_trigger(&args.trigger)?;
        let mut automation = Automation::new(
            &ctx.app_id,
            Some(parent.id),
            name,
            trigger,
            args.code,
            &ctx.user_id,
        );
        automation.description = args.description;
        let created = self.store.insert_automation(automation).await?;
        to_json(&created)
    }
}

struct UpdateAutomationTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct UpdateAutomationArgs {
    automation_id: String,
    name: Option<String>,
    trigger: Option<String>,
    code: Option<String>,
    description: Option<String>,
    enabled: Option<bool>,
}

#[async_trait]
impl ToolHandler for UpdateAutomationTool {
    type Args = UpdateAutomationArgs;

    fn name(&self) -> &'static str {
        "update_automation"
    }

    fn description(&self) -> &'static str {
        "Change an automation's name, trigger, script or description, or enable/disable it."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "automation_id": {"type": "string"},
                "name": {"type": "string"},
                "trigger": {"type": "string", "enum": TRIGGERS},
                "code": {"type": "string", "description": SCRIPT_HELP},
                "description": {"type": "string"},
                "enabled": {"type": "boolean"}
            },
            "required": ["automation_id"]
        })
    }

    async fn run(&self, args: UpdateAutomationArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let current = self
            .store
            .get_automation(&ctx.app_id, &args.automation_id)
            .await?
            .ok_or(ToolError::NotFound("Automation"))?;
        let patch = AutomationPatch {
            name: args
                .name
                .as_deref()
                .map(|name| require_text("Automation name", name))
                .transpose()?,
            description: args.description,
            trigger: args.trigger.as_deref().map(parse_trigger).transpose()?,
            code: args.code,
            enabled: args.enabled,
        };
        if patch.is_empty() {
            return to_json(&current);
        }
        let updated = self.store.update_automation(&current.id, patch).await?;
        to_json(&updated)
    }
}

struct ListAutomationsTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct ListAutomationsArgs {
    type_id: Option<String>,
}

#[async_trait]
impl ToolHandler for ListAutomationsTool {
    type Args = ListAutomationsArgs;

    fn name(&self) -> &'static str {
        "list_automations"
    }

    fn description(&self) -> &'static str {
        "List the app's automations, optionally only those of one type."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"type_id": {"type": "string"}}
        })
    }

    async fn run(&self, args: ListAutomationsArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let type_id = match args.type_id.as_deref() {
            Some(type_id) => Some(owned_type(self.store.as_ref(), ctx, type_id).await?.id),
            None => None,
        };
        let automations = self
            .store
            .list_automations(&ctx.app_id, type_id.as_deref())
            .await?;
        Ok(json!({"automations": to_json(&automations)?}))
    }
}
