use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use strata_types::{
    App, Automation, AutomationFilter, AutomationPatch, AutomationRun, Field, FieldPatch, Record,
    RecordData, SchemaType, TypePatch,
};

use crate::{Store, StoreError, StoreResult};

struct Stored<T> {
    seq: u64,
    value: T,
}

#[derive(Default)]
struct Tables {
    next_seq: u64,
    apps: HashMap<String, Stored<App>>,
    types: HashMap<String, Stored<SchemaType>>,
    fields: HashMap<String, Stored<Field>>,
    records: HashMap<String, Stored<Record>>,
    automations: HashMap<String, Stored<Automation>>,
    runs: HashMap<String, Stored<AutomationRun>>,
}

impl Tables {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn sorted<'a, T: Clone + 'a>(rows: impl Iterator<Item = &'a Stored<T>>) -> Vec<T> {
    let mut rows = rows.collect::<Vec<_>>();
    rows.sort_by_key(|row| row.seq);
    rows.into_iter().map(|row| row.value.clone()).collect()
}

/// In-process store backed by hash maps behind one `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_app(&self, app: App) -> StoreResult<App> {
        let mut tables = self.tables.write().await;
        if tables.apps.contains_key(&app.id) {
            return Err(StoreError::Conflict(format!("app `{}` already exists", app.id)));
        }
        let seq = tables.seq();
        tables.apps.insert(
            app.id.clone(),
            Stored {
                seq,
                value: app.clone(),
            },
        );
        Ok(app)
    }

    async fn get_app(&self, app_id: &str) -> StoreResult<Option<App>> {
        let tables = self.tables.read().await;
        Ok(tables.apps.get(app_id).map(|row| row.value.clone()))
    }

    async fn insert_type(&self, schema_type: SchemaType) -> StoreResult<SchemaType> {
        let mut tables = self.tables.write().await;
        if !tables.apps.contains_key(&schema_type.app_id) {
            return Err(StoreError::NotFound("App"));
        }
        let seq = tables.seq();
        tables.types.insert(
            schema_type.id.clone(),
            Stored {
                seq,
                value: schema_type.clone(),
            },
        );
        Ok(schema_type)
    }

    async fn get_type(&self, app_id: &str, type_id: &str) -> StoreResult<Option<SchemaType>> {
        let tables = self.tables.read().await;
        Ok(tables
            .types
            .get(type_id)
            .filter(|row| row.value.app_id == app_id)
            .map(|row| row.value.clone()))
    }

    async fn list_types(&self, app_id: &str) -> StoreResult<Vec<SchemaType>> {
        let tables = self.tables.read().await;
        let mut types = sorted(tables.types.values().filter(|row| row.value.app_id == app_id));
        // stable: equal positions keep creation order
        types.sort_by_key(|t| t.position);
        Ok(types)
    }

    async fn count_types(&self, app_id: &str) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .types
            .values()
            .filter(|row| row.value.app_id == app_id)
            .count() as u64)
    }

    async fn update_type(&self, type_id: &str, patch: TypePatch) -> StoreResult<SchemaType> {
        let mut tables = self.tables.write().await;
        let row = tables
            .types
            .get_mut(type_id)
            .ok_or(StoreError::NotFound("Type"))?;
        if let Some(name) = patch.name {
            row.value.name = name;
        }
        if let Some(description) = patch.description {
            row.value.description = Some(description);
        }
        if let Some(icon) = patch.icon {
            row.value.icon = Some(icon);
        }
        row.value.updated_at = Utc::now();
        Ok(row.value.clone())
    }

    async fn delete_type(&self, type_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.types.remove(type_id).is_none() {
            return Err(StoreError::NotFound("Type"));
        }
        tables.fields.retain(|_, row| row.value.type_id != type_id);
        tables.records.retain(|_, row| row.value.type_id != type_id);
        let removed_automations = tables
            .automations
            .values()
            .filter(|row| row.value.type_id.as_deref() == Some(type_id))
            .map(|row| row.value.id.clone())
            .collect::<Vec<_>>();
        tables
            .automations
            .retain(|id, _| !removed_automations.contains(id));
        tables
            .runs
            .retain(|_, row| !removed_automations.contains(&row.value.automation_id));
        tracing::debug!(
            type_id,
            automations = removed_automations.len(),
            "type deleted with cascade"
        );
        Ok(())
    }

    async fn insert_field(&self, field: Field) -> StoreResult<Field> {
        let mut tables = self.tables.write().await;
        if !tables.types.contains_key(&field.type_id) {
            return Err(StoreError::NotFound("Type"));
        }
        let seq = tables.seq();
        tables.fields.insert(
            field.id.clone(),
            Stored {
                seq,
                value: field.clone(),
            },
        );
        Ok(field)
    }

    async fn get_field(&self, type_id: &str, field_id: &str) -> StoreResult<Option<Field>> {
        let tables = self.tables.read().await;
        Ok(tables
            .fields
            .get(field_id)
            .filter(|row| row.value.type_id == type_id)
            .map(|row| row.value.clone()))
    }

    async fn list_fields(&self, type_id: &str) -> StoreResult<Vec<Field>> {
        let tables = self.tables.read().await;
        let mut fields = sorted(tables.fields.values().filter(|row| row.value.type_id == type_id));
        fields.sort_by_key(|f| f.position);
        Ok(fields)
    }

    async fn count_fields(&self, type_id: &str) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .fields
            .values()
            .filter(|row| row.value.type_id == type_id)
            .count() as u64)
    }

    async fn update_field(&self, field_id: &str, patch: FieldPatch) -> StoreResult<Field> {
        let mut tables = self.tables.write().await;
        let row = tables
            .fields
            .get_mut(field_id)
            .ok_or(StoreError::NotFound("Field"))?;
        if let Some(name) = patch.name {
            row.value.name = name;
        }
        if let Some(kind) = patch.kind {
            row.value.kind = kind;
        }
        if let Some(config) = patch.config {
            row.value.config = config;
        }
        if let Some(required) = patch.required {
            row.value.required = required;
        }
        row.value.updated_at = Utc::now();
        Ok(row.value.clone())
    }

    async fn delete_field(&self, field_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .fields
            .remove(field_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("Field"))
    }

    async fn insert_record(&self, record: Record) -> StoreResult<Record> {
        let mut tables = self.tables.write().await;
        if !tables.types.contains_key(&record.type_id) {
            return Err(StoreError::NotFound("Type"));
        }
        let seq = tables.seq();
        tables.records.insert(
            record.id.clone(),
            Stored {
                seq,
                value: record.clone(),
            },
        );
        Ok(record)
    }

    async fn get_record(&self, type_id: &str, record_id: &str) -> StoreResult<Option<Record>> {
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .get(record_id)
            .filter(|row| row.value.type_id == type_id)
            .map(|row| row.value.clone()))
    }

    async fn list_records(
        &self,
        type_id: &str,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<Record>> {
        let tables = self.tables.read().await;
        let mut records = sorted(
            tables
                .records
                .values()
                .filter(|row| row.value.type_id == type_id),
        );
        records.reverse();
        Ok(records
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_records(&self, type_id: &str) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .values()
            .filter(|row| row.value.type_id == type_id)
            .count() as u64)
    }

    async fn update_record(&self, record_id: &str, data: RecordData) -> StoreResult<Record> {
        let mut tables = self.tables.write().await;
        let row = tables
            .records
            .get_mut(record_id)
            .ok_or(StoreError::NotFound("Record"))?;
        row.value.data = data;
        row.value.updated_at = Utc::now();
        Ok(row.value.clone())
    }

    async fn delete_record(&self, record_id: &str) -> StoreResult<Record> {
        let mut tables = self.tables.write().await;
        tables
            .records
            .remove(record_id)
            .map(|row| row.value)
            .ok_or(StoreError::NotFound("Record"))
    }

    async fn insert_automation(&self, automation: Automation) -> StoreResult<Automation> {
        let mut tables = self.tables.write().await;
        if !tables.apps.contains_key(&automation.app_id) {
            return Err(StoreError::NotFound("App"));
        }
        let seq = tables.seq();
        tables.automations.insert(
            automation.id.clone(),
            Stored {
                seq,
                value: automation.clone(),
            },
        );
        Ok(automation)
    }

    async fn get_automation(
        &self,
        app_id: &str,
        automation_id: &str,
    ) -> StoreResult<Option<Automation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .automations
            .get(automation_id)
            .filter(|row| row.value.app_id == app_id)
            .map(|row| row.value.clone()))
    }

    async fn list_automations(
        &self,
        app_id: &str,
        type_id: Option<&str>,
    ) -> StoreResult<Vec<Automation>> {
        let tables = self.tables.read().await;
        Ok(sorted(tables.automations.values().filter(|row| {
            row.value.app_id == app_id
                && type_id.map_or(true, |t| row.value.type_id.as_deref() == Some(t))
        })))
    }

    async fn find_automations(&self, filter: &AutomationFilter) -> StoreResult<Vec<Automation>> {
        let tables = self.tables.read().await;
        Ok(sorted(tables.automations.values().filter(|row| {
            let automation = &row.value;
            automation.app_id == filter.app_id
                && automation.type_id.as_deref() == Some(filter.type_id.as_str())
                && automation.trigger == filter.trigger
                && (!filter.enabled_only || automation.enabled)
        })))
    }

    async fn update_automation(
        &self,
        automation_id: &str,
        patch: AutomationPatch,
    ) -> StoreResult<Automation> {
        let mut tables = self.tables.write().await;
        let row = tables
            .automations
            .get_mut(automation_id)
            .ok_or(StoreError::NotFound("Automation"))?;
        let automation = &mut row.value;
        if let Some(name) = patch.name {
            automation.name = name;
        }
        if let Some(description) = patch.description {
            automation.description = Some(description);
        }
        if let Some(trigger) = patch.trigger {
            automation.trigger = trigger;
        }
        if let Some(code) = patch.code {
            automation.code = code;
        }
        if let Some(enabled) = patch.enabled {
            automation.enabled = enabled;
        }
        automation.updated_at = Utc::now();
        Ok(automation.clone())
    }

    async fn insert_automation_run(&self, run: AutomationRun) -> StoreResult<AutomationRun> {
        let mut tables = self.tables.write().await;
        if !tables.automations.contains_key(&run.automation_id) {
            return Err(StoreError::NotFound("Automation"));
        }
        let seq = tables.seq();
        tables.runs.insert(
            run.id.clone(),
            Stored {
                seq,
                value: run.clone(),
            },
        );
        Ok(run)
    }

    async fn list_automation_runs(&self, automation_id: &str) -> StoreResult<Vec<AutomationRun>> {
        let tables = self.tables.read().await;
        let mut runs = sorted(
            tables
                .runs
                .values()
                .filter(|row| row.value.automation_id == automation_id),
        );
        runs.reverse();
        Ok(runs)
    }
}
