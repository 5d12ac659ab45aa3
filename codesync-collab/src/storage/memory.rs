//! In-memory draft store.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use super::{Draft, DraftKey, DraftRecord, DraftStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<Uuid, DraftRecord>,
    keys: HashMap<DraftKey, Uuid>,
}

impl Tables {
    fn upsert(&mut self, id: Uuid, draft: &Draft) {
        match self.records.get_mut(&id) {
            Some(record) => {
                if record.key != draft.key {
                    self.keys.remove(&record.key);
                }
                record.apply(draft);
            }
            None => {
                self.records.insert(id, DraftRecord::new(id, draft));
            }
        }
        self.keys.insert(draft.key.clone(), id);
    }
}

/// Mutex-guarded maps. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryDraftStore {
    tables: Mutex<Tables>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().map(|t| t.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DraftStore for MemoryDraftStore {
    fn save(&self, draft: &Draft) -> Result<Uuid, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        let id = tables.keys.get(&draft.key).copied().unwrap_or_else(Uuid::new_v4);
        tables.upsert(id, draft);
        Ok(id)
    }

    fn update(&self, id: Uuid, draft: &Draft) -> Result<Uuid, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        tables.upsert(id, draft);
        Ok(id)
    }

    fn load(&self, key: &DraftKey) -> Result<Option<DraftRecord>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables
            .keys
            .get(key)
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    fn get(&self, id: Uuid) -> Result<Option<DraftRecord>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.records.get(&id).cloned())
    }
}
