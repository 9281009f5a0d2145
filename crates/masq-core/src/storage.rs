//! Local persistent storage of serialized records.
//!
//! Everything a device keeps between runs goes through [`LocalStore`]:
//! public profile records, the current-device pointer of each profile, and
//! the metadata and feed entries of every replicated database.
//!
//! Two implementations are provided:
//! - [`RedbStore`]: ACID persistence in a single redb file
//! - [`MemoryStore`]: in-process map used by tests and throwaway sessions

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::MasqResult;

mod memory;

pub use memory::MemoryStore;

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Key-value persistence collaborator.
///
/// Keys are plain strings; `scan` returns records in key order, which the
/// database layer relies on to reload feeds in sequence.
pub trait LocalStore: Send + Sync {
    fn save(&self, key: &str, record: &[u8]) -> MasqResult<()>;

    fn load(&self, key: &str) -> MasqResult<Option<Vec<u8>>>;

    fn exists(&self, key: &str) -> MasqResult<bool> {
        Ok(self.load(key)?.is_some())
    }

    fn remove(&self, key: &str) -> MasqResult<()>;

    /// Save several records. Stores that support transactions write them
    /// all or none.
    fn save_many(&self, records: &[(String, Vec<u8>)]) -> MasqResult<()> {
        for (key, record) in records {
            self.save(key, record)?;
        }
        Ok(())
    }

    /// All records whose key starts with `prefix`, sorted by key.
    fn scan(&self, prefix: &str) -> MasqResult<Vec<(String, Vec<u8>)>>;

    fn clear(&self) -> MasqResult<()>;
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl RedbStore {
    /// Create a new store at the given path.
    ///
    /// Creates the parent directory and the records table if needed.
    pub fn new(path: impl AsRef<Path>) -> MasqResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl LocalStore for RedbStore {
    fn save(&self, key: &str, record: &[u8]) -> MasqResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            table.insert(key, record)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn save_many(&self, records: &[(String, Vec<u8>)]) -> MasqResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            for (key, record) in records {
                table.insert(key.as_str(), record.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load(&self, key: &str) -> MasqResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        match table.get(key)? {
            Some(v) => Ok(Some(v.value().to_vec())),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> MasqResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan(&self, prefix: &str) -> MasqResult<Vec<(String, Vec<u8>)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        let mut records = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            records.push((key.to_string(), value.value().to_vec()));
        }
        Ok(records)
    }

    fn clear(&self) -> MasqResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                keys.push(key.value().to_string());
            }
            for key in keys {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
