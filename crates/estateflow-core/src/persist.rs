//! Agent snapshot persistence.
//!
//! A snapshot holds the full task queue plus whatever the agent returns from
//! `extra_state`. It is written on stop and read when a runtime is built.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use estateflow_storage::AgentStateStorage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{AgentStatus, AgentTask};

/// Byte-level snapshot backend.
pub trait StateStore: Send + Sync {
    fn read_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn write_snapshot(&self, key: &str, data: &[u8]) -> Result<()>;
}

impl StateStore for AgentStateStorage {
    fn read_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.load_snapshot(key)
    }

    fn write_snapshot(&self, key: &str, data: &[u8]) -> Result<()> {
        self.save_snapshot(key, data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub tasks: Vec<AgentTask>,
    #[serde(default)]
    pub extra_state: Value,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

/// Storage key for an agent: lowercase, spaces replaced with underscores.
pub fn normalize_agent_key(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

pub fn read_snapshot(store: &dyn StateStore, name: &str) -> Result<Option<AgentSnapshot>> {
    let key = normalize_agent_key(name);
    let Some(bytes) = store.read_snapshot(&key)? else {
        return Ok(None);
    };
    let snapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("Corrupt snapshot for agent '{}'", name))?;
    Ok(Some(snapshot))
}

pub fn write_snapshot(store: &dyn StateStore, snapshot: &AgentSnapshot) -> Result<()> {
    let key = normalize_agent_key(&snapshot.name);
    let bytes = serde_json::to_vec(snapshot)?;
    store.write_snapshot(&key, &bytes)
}
