use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a background agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Constructed, never started
    #[default]
    Idle,
    /// Executing a cycle
    Running,
    /// Waiting out the check interval
    Sleeping,
    /// Cycle failed, cooling down before retrying
    Error,
    /// Loop exited after a stop request
    Stopped,
}

impl AgentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Sleeping => "sleeping",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
        }
    }

    /// Whether a loop is expected to be alive in this status.
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            AgentStatus::Running | AgentStatus::Sleeping | AgentStatus::Error
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
