//! EstateFlow Storage - redb-backed persistence for background agents.
//!
//! All tables share one embedded database file and use a byte-level
//! key/value layout. Typed wrappers live with the code that owns the types.
//!
//! # Tables
//!
//! - `agent_state` - Per-agent snapshots (queue + agent-specific state)
//! - `kv_store` - Generic key/value data written by agents

pub mod agent_state;
pub mod kv_store;
pub mod paths;
pub mod simple_storage;

use anyhow::Result;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

pub use agent_state::AgentStateStorage;
pub use kv_store::KvStoreStorage;
pub use simple_storage::SimpleStorage;

/// Opens the database and initializes every table.
pub struct Storage {
    db: Arc<Database>,
    pub agent_state: AgentStateStorage,
    pub kv_store: KvStoreStorage,
}

impl Storage {
    /// Create a storage instance at the given path, creating the file if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = Arc::new(Database::create(path.as_ref())?);

        let agent_state = AgentStateStorage::new(db.clone())?;
        let kv_store = KvStoreStorage::new(db.clone())?;

        Ok(Self {
            db,
            agent_state,
            kv_store,
        })
    }

    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}
