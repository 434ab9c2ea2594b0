//! Storage interface consumed by the tool layer, the automation dispatcher
//! and the orchestrator.
//!
//! The core treats the store as an ordered, consistently readable key/value
//! store with referential cascade. Each method is atomic on its own; callers
//! get no cross-method transactions.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

use strata_types::{
    App, Automation, AutomationFilter, AutomationPatch, AutomationRun, Field, FieldPatch, Record,
    RecordData, SchemaType, TypePatch,
};

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_app(&self, app: App) -> StoreResult<App>;
    async fn get_app(&self, app_id: &str) -> StoreResult<Option<App>>;

    async fn insert_type(&self, schema_type: SchemaType) -> StoreResult<SchemaType>;
    /// Returns `None` when the type does not exist or belongs to another app.
    async fn get_type(&self, app_id: &str, type_id: &str) -> StoreResult<Option<SchemaType>>;
    async fn list_types(&self, app_id: &str) -> StoreResult<Vec<SchemaType>>;
    async fn count_types(&self, app_id: &str) -> StoreResult<u64>;
    async fn update_type(&self, type_id: &str, patch: TypePatch) -> StoreResult<SchemaType>;
    /// Cascades to the type's fields, records and type-scoped automations.
    async fn delete_type(&self, type_id: &str) -> StoreResult<()>;

    async fn insert_field(&self, field: Field) -> StoreResult<Field>;
    /// Returns `None` when the field does not exist or belongs to another type.
    async fn get_field(&self, type_id: &str, field_id: &str) -> StoreResult<Option<Field>>;
    async fn list_fields(&self, type_id: &str) -> StoreResult<Vec<Field>>;
    async fn count_fields(&self, type_id: &str) -> StoreResult<u64>;
    async fn update_field(&self, field_id: &str, patch: FieldPatch) -> StoreResult<Field>;
    async fn delete_field(&self, field_id: &str) -> StoreResult<()>;

    async fn insert_record(&self, record: Record) -> StoreResult<Record>;
    async fn get_record(&self, type_id: &str, record_id: &str) -> StoreResult<Option<Record>>;
    /// Newest first.
    async fn list_records(
        &self,
        type_id: &str,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<Record>>;
    async fn count_records(&self, type_id: &str) -> StoreResult<u64>;
    async fn update_record(&self, record_id: &str, data: RecordData) -> StoreResult<Record>;
    async fn delete_record(&self, record_id: &str) -> StoreResult<Record>;

    async fn insert_automation(&self, automation: Automation) -> StoreResult<Automation>;
    async fn get_automation(
        &self,
        app_id: &str,
        automation_id: &str,
    ) -> StoreResult<Option<Automation>>;
    async fn list_automations(
        &self,
        app_id: &str,
        type_id: Option<&str>,
    ) -> StoreResult<Vec<Automation>>;
    async fn find_automations(&self, filter: &AutomationFilter) -> StoreResult<Vec<Automation>>;
    async fn update_automation(
        &self,
        automation_id: &str,
        patch: AutomationPatch,
    ) -> StoreResult<Automation>;

    async fn insert_automation_run(&self, run: AutomationRun) -> StoreResult<AutomationRun>;
    /// Newest first.
    async fn list_automation_runs(&self, automation_id: &str) -> StoreResult<Vec<AutomationRun>>;
}
