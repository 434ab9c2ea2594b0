use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::RecordEventKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AutomationTrigger {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    Manual,
}

impl AutomationTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            AutomationTrigger::RecordCreated => "record_created",
            AutomationTrigger::RecordUpdated => "record_updated",
            AutomationTrigger::RecordDeleted => "record_deleted",
            AutomationTrigger::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "record_created" => Some(AutomationTrigger::RecordCreated),
            "record_updated" => Some(AutomationTrigger::RecordUpdated),
            "record_deleted" => Some(AutomationTrigger::RecordDeleted),
            "manual" => Some(AutomationTrigger::Manual),
            _ => None,
        }
    }
}

impl From<RecordEventKind> for AutomationTrigger {
    fn from(kind: RecordEventKind) -> Self {
        match kind {
            RecordEventKind::RecordCreated => AutomationTrigger::RecordCreated,
            RecordEventKind::RecordUpdated => AutomationTrigger::RecordUpdated,
            RecordEventKind::RecordDeleted => AutomationTrigger::RecordDeleted,
        }
    }
}

/// A user script bound to an app (optionally narrowed to one type) and a
/// trigger. Automations are never disabled automatically on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Automation {
    pub id: String,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trigger: AutomationTrigger,
    pub code: String,
    pub enabled: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    pub fn new(
        app_id: impl Into<String>,
        type_id: Option<String>,
        name: impl Into<String>,
        trigger: AutomationTrigger,
        code: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            type_id,
            name: name.into(),
            description: None,
            trigger,
            code: code.into(),
            enabled: true,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutomationPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub trigger: Option<AutomationTrigger>,
    pub code: Option<String>,
    pub enabled: Option<bool>,
}

impl AutomationPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.trigger.is_none()
            && self.code.is_none()
            && self.enabled.is_none()
    }
}

/// Selects automations for one record event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationFilter {
    pub app_id: String,
    pub type_id: String,
    pub trigger: AutomationTrigger,
    pub enabled_only: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Append-only record of one dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRun {
    pub id: String,
    pub automation_id: String,
    pub status: RunStatus,
    pub trigger: AutomationTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default)]
    pub logs: Vec<RunLogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl AutomationRun {
    pub fn new(automation_id: impl Into<String>, trigger: AutomationTrigger) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            automation_id: automation_id.into(),
            status: RunStatus::Success,
            trigger,
            record_id: None,
            logs: Vec::new(),
            error: None,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }
}
