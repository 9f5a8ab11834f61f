//! Generic persistent key/value handle.

use anyhow::Result;

/// Byte-level key/value store shared by agents.
///
/// Implemented by `estateflow_storage::KvStoreStorage`.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns true when the key existed.
    fn delete(&self, key: &str) -> Result<bool>;
    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>>;
}
