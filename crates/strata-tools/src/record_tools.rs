use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use strata_store::Store;
use strata_types::{Record, RecordEvent};

use crate::data::{conform_record_data, DataMode};
use crate::{
    owned_type, to_json, RecordEventSink, Tool, ToolContext, ToolError, ToolHandler,
};

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

pub(crate) fn tools(store: &Arc<dyn Store>, events: &Arc<dyn RecordEventSink>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(CreateRecordTool {
            store: store.clone(),
            events: events.clone(),
        }),
        Arc::new(UpdateRecordTool {
            store: store.clone(),
            events: events.clone(),
        }),
        Arc::new(DeleteRecordTool {
            store: store.clone(),
            events: events.clone(),
        }),
        Arc::new(ListRecordsTool {
            store: store.clone(),
        }),
    ]
}

/// Page and page size as served: page at least 1, size within 1..=100.
/// Oversized pages are clamped, never rejected.
pub fn clamp_page(page: Option<i64>, page_size: Option<i64>) -> (u64, u64) {
    let page = page.unwrap_or(1).max(1) as u64;
    let page_size = page_size
        .map(|size| size.clamp(1, MAX_PAGE_SIZE as i64) as u64)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    (page, page_size)
}

async fn owned_record(
    store: &dyn Store,
    ctx: &ToolContext,
    type_id: &str,
    record_id: &str,
) -> Result<Record, ToolError> {
    let parent = owned_type(store, ctx, type_id).await?;
    store
        .get_record(&parent.id, record_id)
        .await?
        .ok_or(ToolError::NotFound("Record"))
}

struct CreateRecordTool {
    store: Arc<dyn Store>,
    events: Arc<dyn RecordEventSink>,
}

#[derive(Deserialize)]
struct CreateRecordArgs {
    type_id: String,
    #[serde(default)]
    data: Value,
}

#[async_trait]
impl ToolHandler for CreateRecordTool {
    type Args = CreateRecordArgs;

    fn name(&self) -> &'static str {
        "create_record"
    }

    fn description(&self) -> &'static str {
        "Insert a record. Keys of data are field ids or field names."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "data": {"type": "object", "description": "Field id or name to value"}
            },
            "required": ["type_id", "data"]
        })
    }

    async fn run(&self, args: CreateRecordArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let parent = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        let fields = self.store.list_fields(&parent.id).await?;
        let data = conform_record_data(args.data, &fields, DataMode::Create)?;
        let record = self
            .store
            .insert_record(Record::new(&parent.id, data, &ctx.user_id))
            .await?;
        self.events
            .publish(RecordEvent::created(&ctx.app_id, &record, &ctx.user_id));
        to_json(&record)
    }
}

struct UpdateRecordTool {
    store: Arc<dyn Store>,
    events: Arc<dyn RecordEventSink>,
}

#[derive(Deserialize)]
struct UpdateRecordArgs {
    type_id: String,
    record_id: String,
    data: Value,
}

#[async_trait]
impl ToolHandler for UpdateRecordTool {
    type Args = UpdateRecordArgs;

    fn name(&self) -> &'static str {
        "update_record"
    }

    fn description(&self) -> &'static str {
        "Update some fields of a record; fields not mentioned keep their values."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "record_id": {"type": "string"},
                "data": {"type": "object"}
            },
            "required": ["type_id", "record_id", "data"]
        })
    }

    async fn run(&self, args: UpdateRecordArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let current =
            owned_record(self.store.as_ref(), ctx, &args.type_id, &args.record_id).await?;
        let fields = self.store.list_fields(&current.type_id).await?;
        let patch = conform_record_data(args.data, &fields, DataMode::Update)?;

        let previous = current.data.clone();
        let mut merged = current.data;
        merged.extend(patch);
        let updated = self.store.update_record(&current.id, merged).await?;
        self.events.publish(RecordEvent::updated(
            &ctx.app_id,
            &updated,
            previous,
            &ctx.user_id,
        ));
        to_json(&updated)
    }
}

struct DeleteRecordTool {
    store: Arc<dyn Store>,
    events: Arc<dyn RecordEventSink>,
}

#[derive(Deserialize)]
struct DeleteRecordArgs {
    type_id: String,
    record_id: String,
}

#[async_trait]
impl ToolHandler for DeleteRecordTool {
    type Args = DeleteRecordArgs;

    fn name(&self) -> &'static str {
        "delete_record"
    }

    fn description(&self) -> &'static str {
        "Delete one record."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "record_id": {"type": "string"}
            },
            "required": ["type_id", "record_id"]
        })
    }

    async fn run(&self, args: DeleteRecordArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let current =
            owned_record(self.store.as_ref(), ctx, &args.type_id, &args.record_id).await?;
        let deleted = self.store.delete_record(&current.id).await?;
        self.events
            .publish(RecordEvent::deleted(&ctx.app_id, &deleted, &ctx.user_id));
        Ok(json!({"deleted": true, "id": deleted.id}))
    }
}

struct ListRecordsTool {
    store: Arc<dyn Store>,
}

#[derive(Deserialize)]
struct ListRecordsArgs {
    type_id: String,
    page: Option<i64>,
    page_size: Option<i64>,
}

#[async_trait]
impl ToolHandler for ListRecordsTool {
    type Args = ListRecordsArgs;

    fn name(&self) -> &'static str {
        "list_records"
    }

    fn description(&self) -> &'static str {
        "List records of a type, newest first. page_size is capped at 100."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type_id": {"type": "string"},
                "page": {"type": "integer", "minimum": 1, "default": 1},
                "page_size": {"type": "integer", "minimum": 1, "maximum": MAX_PAGE_SIZE, "default": DEFAULT_PAGE_SIZE}
            },
            "required": ["type_id"]
        })
    }

    async fn run(&self, args: ListRecordsArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let parent = owned_type(self.store.as_ref(), ctx, &args.type_id).await?;
        let (page, page_size) = clamp_page(args.page, args.page_size);
        let offset = (page - 1).saturating_mul(page_size);
        let records = self
            .store
            .list_records(&parent.id, offset, page_size)
            .await?;
        let total = self.store.count_records(&parent.id).await?;
        Ok(json!({
            "records": to_json(&records)?,
            "total": total,
            "page": page,
            "pageSize": page_size,
        }))
    }
}
