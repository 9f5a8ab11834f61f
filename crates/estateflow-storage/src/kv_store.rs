//! Generic key/value table shared by agents.

use crate::define_simple_storage;
use anyhow::Result;
use estateflow_traits::KvStore;

define_simple_storage! {
    /// Agent-written key/value data, stored as raw bytes.
    pub struct KvStoreStorage { table: "kv_store" }
}

impl KvStore for KvStoreStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put_raw(key, value)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        KvStoreStorage::delete(self, key)
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        KvStoreStorage::list_keys(self, prefix)
    }
}
