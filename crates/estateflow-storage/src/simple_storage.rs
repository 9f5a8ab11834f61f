use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

/// Byte-keyed table with the read/write helpers every storage module needs.
///
/// Implementors supply the table definition and the shared database handle.
pub trait SimpleStorage: Send + Sync {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    fn db(&self) -> &Arc<Database>;

    fn put_raw(&self, key: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db().begin_write()?;
        {
            let mut table = write_txn.open_table(Self::TABLE)?;
            table.insert(key, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        Ok(table.get(key)?.map(|value| value.value().to_vec()))
    }

    /// Entries whose key starts with `prefix` (all entries when `None`).
    fn list_raw(&self, prefix: Option<&str>) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;

        let mut items = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let key = key.value();
            if prefix.is_none_or(|p| key.starts_with(p)) {
                items.push((key.to_string(), value.value().to_vec()));
            }
        }
        Ok(items)
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;

        let mut keys = Vec::new();
        for item in table.iter()? {
            let (key, _) = item?;
            let key = key.value();
            if prefix.is_none_or(|p| key.starts_with(p)) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    /// Returns true when the key existed.
    fn delete(&self, key: &str) -> Result<bool> {
        let write_txn = self.db().begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(Self::TABLE)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        Ok(table.get(key)?.is_some())
    }
}

/// Generates a storage struct bound to one table, forwarding to [`SimpleStorage`].
#[macro_export]
macro_rules! define_simple_storage {
    ( $(#[$meta:meta])* $vis:vis struct $name:ident { table: $table_name:literal } ) => {
        const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> =
            redb::TableDefinition::new($table_name);

        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            db: std::sync::Arc<redb::Database>,
        }

        impl $name {
            /// Bind to `db`, creating the table when missing.
            pub fn new(db: std::sync::Arc<redb::Database>) -> anyhow::Result<Self> {
                let write_txn = db.begin_write()?;
                write_txn.open_table(TABLE)?;
                write_txn.commit()?;

                Ok(Self { db })
            }

            pub fn put_raw(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
                <Self as $crate::SimpleStorage>::put_raw(self, key, data)
            }

            pub fn get_raw(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
                <Self as $crate::SimpleStorage>::get_raw(self, key)
            }

            pub fn list_raw(&self, prefix: Option<&str>) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
                <Self as $crate::SimpleStorage>::list_raw(self, prefix)
            }

            pub fn list_keys(&self, prefix: Option<&str>) -> anyhow::Result<Vec<String>> {
                <Self as $crate::SimpleStorage>::list_keys(self, prefix)
            }

            pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
                <Self as $crate::SimpleStorage>::delete(self, key)
            }

            pub fn exists(&self, key: &str) -> anyhow::Result<bool> {
                <Self as $crate::SimpleStorage>::exists(self, key)
            }
        }

        impl $crate::SimpleStorage for $name {
            const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = TABLE;

            fn db(&self) -> &std::sync::Arc<redb::Database> {
                &self.db
            }
        }
    };
}
