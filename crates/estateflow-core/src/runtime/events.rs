//! Agent event stream.
//!
//! Every agent publishes on its own [`EventBus`]; the manager re-publishes
//! everything on an aggregate bus that hosts subscribe to. Publishing never
//! blocks and never fails: events sent with no subscriber are dropped.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::AgentStatus;

const BUFFER_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NotificationLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Success => "success",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEventKind {
    StatusChanged {
        status: AgentStatus,
    },
    TaskCompleted {
        task_id: String,
        task_type: String,
        result: Value,
    },
    Progress {
        percent: u8,
        message: String,
    },
    Notification {
        level: NotificationLevel,
        message: String,
    },
    Error {
        message: String,
    },
}

/// One event emitted by a named agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

impl AgentEvent {
    pub fn new(agent: impl Into<String>, kind: AgentEventKind) -> Self {
        Self {
            agent: agent.into(),
            timestamp: Utc::now().timestamp_millis(),
            kind,
        }
    }

    pub fn status_changed(agent: impl Into<String>, status: AgentStatus) -> Self {
        Self::new(agent, AgentEventKind::StatusChanged { status })
    }

    pub fn error(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            agent,
            AgentEventKind::Error {
                message: message.into(),
            },
        )
    }

    pub fn notification(
        agent: impl Into<String>,
        level: NotificationLevel,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            agent,
            AgentEventKind::Notification {
                level,
                message: message.into(),
            },
        )
    }

    pub fn progress(agent: impl Into<String>, percent: u8, message: impl Into<String>) -> Self {
        Self::new(
            agent,
            AgentEventKind::Progress {
                percent: percent.min(100),
                message: message.into(),
            },
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, AgentEventKind::Error { .. })
    }
}

/// Multi-subscriber event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(BUFFER_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: AgentEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }
}
