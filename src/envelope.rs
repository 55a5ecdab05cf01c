use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// The fixed, enumerated set of entity kinds the engine knows about (spec.md §1: "a
/// fixed enumerated set"). Entity-specific fields beyond the envelope are opaque to the
/// engine; this is the productivity-app domain the engine was built for, but the engine
/// itself never inspects anything past `id`/`user_id`/`deleted`/`updated_at`/`_version`/
/// `device_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityTable {
    Goal,
    Milestone,
    Task,
    Habit,
    RoutineEntry,
    JournalEntry,
    Metric,
    Reminder,
    Tag,
    Attachment,
    Category,
    Setting,
}

impl EntityTable {
    pub const ALL: [EntityTable; 12] = [
        EntityTable::Goal,
        EntityTable::Milestone,
        EntityTable::Task,
        EntityTable::Habit,
        EntityTable::RoutineEntry,
        EntityTable::JournalEntry,
        EntityTable::Metric,
        EntityTable::Reminder,
        EntityTable::Tag,
        EntityTable::Attachment,
        EntityTable::Category,
        EntityTable::Setting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityTable::Goal => "goals",
            EntityTable::Milestone => "milestones",
            EntityTable::Task => "tasks",
            EntityTable::Habit => "habits",
            EntityTable::RoutineEntry => "routine_entries",
            EntityTable::JournalEntry => "journal_entries",
            EntityTable::Metric => "metrics",
            EntityTable::Reminder => "reminders",
            EntityTable::Tag => "tags",
            EntityTable::Attachment => "attachments",
            EntityTable::Category => "categories",
            EntityTable::Setting => "settings",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// Engine-managed fields present on every synced row (spec.md §3 "Entity envelope").
/// Entity-specific fields are carried separately in `fields` as an opaque JSON object so
/// the engine never needs to know an entity's schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRow {
    pub id: String,
    pub user_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub deleted: bool,
    #[serde(rename = "_version")]
    pub version: i64,
    pub device_id: Option<String>,
    /// Opaque entity-specific fields, never interpreted by the engine.
    pub fields: serde_json::Value,
}

impl EntityRow {
    pub fn new_create(
        id: String,
        user_id: String,
        now: chrono::DateTime<chrono::Utc>,
        device_id: &DeviceId,
        fields: serde_json::Value,
    ) -> Self {
        Self {
            id,
            user_id,
            created_at: now,
            updated_at: now,
            deleted: false,
            version: 1,
            device_id: Some(device_id.as_str().to_string()),
            fields,
        }
    }

    /// The value of a single entity-specific field, or `None` if absent.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.as_object().and_then(|m| m.get(name))
    }

    pub fn set_field(&mut self, name: &str, value: serde_json::Value) {
        if let Some(map) = self.fields.as_object_mut() {
            map.insert(name.to_string(), value);
        } else {
            let mut map = serde_json::Map::new();
            map.insert(name.to_string(), value);
            self.fields = serde_json::Value::Object(map);
        }
    }
}
