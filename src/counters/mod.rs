//! Counters registry (spec §2 item 2, §6 "Counters file layout").
//!
//! A shared, memory-mapped table of labeled 64-bit values. The conductor
//! allocates and frees slots; data-plane agents and clients read/write
//! them directly through the mapping, so every cross-process read uses
//! `Acquire`/`Release` ordering the way the teacher crate's
//! `core::control::ControlFile` treats its atomics.

mod file;

pub use file::{CounterMetadata, CountersFile};

use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result, StorageError};

/// A typed, reference-counted handle to one allocated counter slot.
///
/// Cloning does not duplicate the slot; it shares the underlying mapping.
/// The slot is freed when [`CountersManager::free`] is called with the
/// matching id, regardless of how many `CounterLink` wrappers exist
/// (those are client-side bookkeeping, not the allocation unit).
#[derive(Clone)]
pub struct Counter {
    file: Arc<CountersFile>,
    id: u32,
}

impl Counter {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn get(&self) -> i64 {
        self.file.load(self.id)
    }

    pub fn set(&self, value: i64) {
        self.file.store(self.id, value)
    }

    pub fn get_weak(&self) -> i64 {
        self.file.load_relaxed(self.id)
    }
}

/// Owns the counters memory-mapped file and the free-list allocator over
/// its slots.
pub struct CountersManager {
    file: Arc<CountersFile>,
}

impl CountersManager {
    pub fn create(path: &Path, max_counters: usize) -> Result<Self> {
        let file = CountersFile::create(path, max_counters).map_err(Error::Storage)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Allocates a new counter slot and publishes its metadata
    /// `(type_id, owner_id, registration_id, key_bytes, label)` so
    /// external readers (other processes) can discover what it means.
    pub fn allocate(
        &mut self,
        type_id: i32,
        owner_id: i64,
        registration_id: i64,
        key_bytes: &[u8],
        label: &str,
    ) -> Result<Counter> {
        let metadata = CounterMetadata::new(type_id, owner_id, registration_id, key_bytes, label)
            .map_err(Error::Storage)?;
        let id = self
            .file
            .allocate(metadata)
            .map_err(|_| Error::InternalInvariantViolation("counters file exhausted".into()))?;
        Ok(Counter {
            file: Arc::clone(&self.file),
            id,
        })
    }

    pub fn free(&mut self, counter: &Counter) -> Result<()> {
        self.file
            .free(counter.id)
            .map_err(|err: StorageError| Error::InternalInvariantViolation(err.to_string()))
    }

    pub fn len(&self) -> usize {
        self.file.allocated_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_and_free_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.dat");
        let mut mgr = CountersManager::create(&path, 8).unwrap();

        let counter = mgr
            .allocate(1, 42, 7, b"pub-pos", "publisher position")
            .unwrap();
        counter.set(100);
        assert_eq!(counter.get(), 100);
        assert_eq!(mgr.len(), 1);

        mgr.free(&counter).unwrap();
        assert_eq!(mgr.len(), 0);
    }

    #[test]
    fn exhausting_capacity_is_an_internal_invariant_violation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.dat");
        let mut mgr = CountersManager::create(&path, 1).unwrap();
        let _first = mgr.allocate(1, 0, 0, b"a", "a").unwrap();
        let second = mgr.allocate(1, 0, 1, b"b", "b");
        assert!(second.is_err());
    }
}
