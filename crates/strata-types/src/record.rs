use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Record payload keyed by field id.
pub type RecordData = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub type_id: String,
    pub data: RecordData,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(type_id: impl Into<String>, data: RecordData, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            type_id: type_id.into(),
            data,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordEventKind {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
}

impl RecordEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordEventKind::RecordCreated => "record_created",
            RecordEventKind::RecordUpdated => "record_updated",
            RecordEventKind::RecordDeleted => "record_deleted",
        }
    }
}

/// Ephemeral notification for one data mutation, carried on the event bus.
///
/// `triggered_by_automation` is the cycle guard: events raised by automation
/// side effects carry `true` and are never dispatched to automations again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordEvent {
    #[serde(rename = "type")]
    pub kind: RecordEventKind,
    pub app_id: String,
    pub type_id: String,
    pub record_id: String,
    pub record: RecordData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_record: Option<RecordData>,
    pub user_id: String,
    #[serde(default)]
    pub triggered_by_automation: bool,
}

impl RecordEvent {
    pub fn created(app_id: &str, record: &Record, user_id: &str) -> Self {
        Self::from_record(RecordEventKind::RecordCreated, app_id, record, None, user_id)
    }

    pub fn updated(app_id: &str, record: &Record, previous: RecordData, user_id: &str) -> Self {
        Self::from_record(
            RecordEventKind::RecordUpdated,
            app_id,
            record,
            Some(previous),
            user_id,
        )
    }

    pub fn deleted(app_id: &str, record: &Record, user_id: &str) -> Self {
        Self::from_record(RecordEventKind::RecordDeleted, app_id, record, None, user_id)
    }

    fn from_record(
        kind: RecordEventKind,
        app_id: &str,
        record: &Record,
        previous_record: Option<RecordData>,
        user_id: &str,
    ) -> Self {
        Self {
            kind,
            app_id: app_id.to_string(),
            type_id: record.type_id.clone(),
            record_id: record.id.clone(),
            record: record.data.clone(),
            previous_record,
            user_id: user_id.to_string(),
            triggered_by_automation: false,
        }
    }

    pub fn from_automation(mut self) -> Self {
        self.triggered_by_automation = true;
        self
    }
}
