//! Per-agent snapshot persistence.
//!
//! Each agent owns one record keyed by its normalized name. Payloads are
//! opaque JSON bytes; the snapshot type lives in the core crate.

use crate::define_simple_storage;
use anyhow::Result;
use chrono::Utc;
use tracing::debug;

define_simple_storage! {
    /// Agent snapshots keyed by normalized agent name.
    pub struct AgentStateStorage { table: "agent_state" }
}

impl AgentStateStorage {
    /// Read the snapshot stored for `key`.
    pub fn load_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw(key)
    }

    /// Overwrite the snapshot stored for `key`.
    pub fn save_snapshot(&self, key: &str, data: &[u8]) -> Result<()> {
        self.put_raw(key, data)?;
        debug!(key, bytes = data.len(), at = %Utc::now().to_rfc3339(), "Saved agent snapshot");
        Ok(())
    }

    /// Keys of every stored snapshot.
    pub fn snapshot_keys(&self) -> Result<Vec<String>> {
        self.list_keys(None)
    }
}
