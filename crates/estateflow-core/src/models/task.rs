//! Units of work owned by a single agent queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A queued task. Lower `priority` runs first; ties break on `created_at`.
///
/// `data` is opaque to the framework and interpreted only by the agent that
/// handles `task_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Not eligible before this instant. `None` means run as soon as possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl AgentTask {
    /// New task with a random id, default priority and no schedule.
    pub fn new(task_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            data,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            scheduled_for: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn should_run_now(&self) -> bool {
        self.should_run_at(Utc::now())
    }

    pub fn should_run_at(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_for {
            None => true,
            Some(at) => now >= at,
        }
    }

    /// String field from `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}
