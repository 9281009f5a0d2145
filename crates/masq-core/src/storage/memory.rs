//! In-memory store

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::LocalStore;
use crate::error::MasqResult;

/// [`LocalStore`] backed by a sorted map. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn save(&self, key: &str, record: &[u8]) -> MasqResult<()> {
        self.records.write().insert(key.to_string(), record.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> MasqResult<Option<Vec<u8>>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> MasqResult<()> {
        self.records.write().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> MasqResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .records
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> MasqResult<()> {
        self.records.write().clear();
        Ok(())
    }
}
