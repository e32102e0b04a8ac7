use dashmap::DashMap;

use crate::models::{Load, LoadId};
use crate::store::StoreError;

/// Keyed persistence for load records.
///
/// Implementations only need plain point reads, whole-record writes and a
/// full scan; version checks and feed publication live in
/// [`LoadStore`](crate::store::LoadStore), which serializes writers.
/// I/O failures should surface as [`StoreError::Unavailable`] so callers
/// can retry them.
pub trait LoadTable: Send + Sync {
    fn get(&self, id: &LoadId) -> Result<Option<Load>, StoreError>;
    fn put(&self, load: Load) -> Result<(), StoreError>;
    fn scan(&self) -> Result<Vec<Load>, StoreError>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct MemoryTable {
    loads: DashMap<LoadId, Load>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadTable for MemoryTable {
    fn get(&self, id: &LoadId) -> Result<Option<Load>, StoreError> {
        Ok(self.loads.get(id).map(|entry| entry.value().clone()))
    }

    fn put(&self, load: Load) -> Result<(), StoreError> {
        self.loads.insert(load.id, load);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<Load>, StoreError> {
        Ok(self
            .loads
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn len(&self) -> usize {
        self.loads.len()
    }
}
