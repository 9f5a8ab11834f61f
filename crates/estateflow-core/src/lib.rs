//! EstateFlow Core - autonomous background agents.
//!
//! Long-lived agents each run their own loop: a scheduled check, then the
//! due tasks from a per-agent priority queue, then a sleep. Failed tasks
//! retry with exponential backoff. The [`AgentManager`] owns the agents,
//! injects shared collaborators, forwards their events and restarts agents
//! that end up in the error state. Queues and agent state survive restarts
//! through a redb snapshot store.

pub mod agents;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod persist;
pub mod runtime;
#[cfg(any(test, feature = "test-utils"))]
pub mod testkit;

pub use config::{AgentConfigUpdate, AgentSettings, AgentsConfig, ConfigError};
pub use error::AgentError;
pub use manager::AgentManager;
pub use models::{AgentStatus, AgentTask};
pub use persist::{AgentSnapshot, StateStore, normalize_agent_key};
pub use runtime::{
    Agent, AgentContext, AgentEvent, AgentEventKind, AgentRuntime, AgentServices,
    NotificationLevel, RuntimeOptions, TaskQueue,
};
