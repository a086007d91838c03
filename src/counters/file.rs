//! Low-level memory-mapped counters table (spec §6 "Counters file
//! layout"): a values region of atomic 64-bit slots plus a sibling
//! metadata region of fixed-size records, one per slot.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::mmap_file::MmapFile;

const KEY_BYTES_LEN: usize = 32;
const LABEL_BYTES_LEN: usize = 96;
/// type_id(4) + owner_id(8) + registration_id(8) + key_len(2) + key(32)
/// + label_len(2) + label(96) = 152, padded to 160 for alignment.
const METADATA_RECORD_LEN: usize = 160;

#[derive(Debug, Clone)]
pub struct CounterMetadata {
    pub type_id: i32,
    pub owner_id: i64,
    pub registration_id: i64,
    pub key_bytes: Vec<u8>,
    pub label: String,
}

impl CounterMetadata {
    pub fn new(
        type_id: i32,
        owner_id: i64,
        registration_id: i64,
        key_bytes: &[u8],
        label: &str,
    ) -> StorageResult<Self> {
        if key_bytes.len() > KEY_BYTES_LEN {
            return Err(StorageError::Unsupported("counter key exceeds 32 bytes"));
        }
        if label.len() > LABEL_BYTES_LEN {
            return Err(StorageError::Unsupported("counter label exceeds 96 bytes"));
        }
        Ok(Self {
            type_id,
            owner_id,
            registration_id,
            key_bytes: key_bytes.to_vec(),
            label: label.to_string(),
        })
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(&self.type_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.owner_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.registration_id.to_le_bytes());
        let key_len = self.key_bytes.len().min(KEY_BYTES_LEN);
        buf[20..22].copy_from_slice(&(key_len as u16).to_le_bytes());
        buf[22..22 + key_len].copy_from_slice(&self.key_bytes[..key_len]);
        let label_bytes = self.label.as_bytes();
        let label_len = label_bytes.len().min(LABEL_BYTES_LEN);
        let label_len_offset = 22 + KEY_BYTES_LEN;
        buf[label_len_offset..label_len_offset + 2].copy_from_slice(&(label_len as u16).to_le_bytes());
        let label_offset = label_len_offset + 2;
        buf[label_offset..label_offset + label_len].copy_from_slice(&label_bytes[..label_len]);
    }
}

/// The free-list and mmap mappings behind [`super::CountersManager`].
pub struct CountersFile {
    values: MmapFile,
    metadata: MmapFile,
    capacity: usize,
    // Guards allocation/free bookkeeping; the values themselves are
    // lock-free atomics so readers never block on this mutex.
    free_slots: Mutex<Vec<u32>>,
    allocated: Mutex<usize>,
}

impl CountersFile {
    pub fn create(path: &std::path::Path, capacity: usize) -> StorageResult<Self> {
        if capacity == 0 {
            return Err(StorageError::Unsupported("counters capacity must be non-zero"));
        }
        let values_path = path.with_extension("values");
        let metadata_path = path.with_extension("metadata");
        let values = MmapFile::create(&values_path, capacity * std::mem::size_of::<i64>())?;
        let metadata = MmapFile::create(&metadata_path, capacity * METADATA_RECORD_LEN)?;
        let free_slots = (0..capacity as u32).rev().collect();
        Ok(Self {
            values,
            metadata,
            capacity,
            free_slots: Mutex::new(free_slots),
            allocated: Mutex::new(0),
        })
    }

    fn value_atomic(&self, id: u32) -> &AtomicI64 {
        let offset = id as usize * std::mem::size_of::<i64>();
        let ptr = self.values.as_slice()[offset..].as_ptr() as *const AtomicI64;
        // SAFETY: offset is within bounds (checked by caller range via
        // `id < capacity`), and i64-aligned because the mapping starts
        // page-aligned and every slot is 8 bytes.
        unsafe { &*ptr }
    }

    pub fn allocate(&self, metadata: CounterMetadata) -> StorageResult<u32> {
        let mut free_slots = self
            .free_slots
            .lock()
            .map_err(|_| StorageError::Corrupt("counters free-list lock poisoned"))?;
        let id = free_slots
            .pop()
            .ok_or(StorageError::CapacityExceeded)?;
        self.value_atomic(id).store(0, Ordering::Release);
        self.write_metadata(id, &metadata);
        let mut allocated = self
            .allocated
            .lock()
            .map_err(|_| StorageError::Corrupt("counters allocated-count lock poisoned"))?;
        *allocated += 1;
        Ok(id)
    }

    pub fn free(&self, id: u32) -> StorageResult<()> {
        if id as usize >= self.capacity {
            return Err(StorageError::Corrupt("counter id out of range"));
        }
        self.value_atomic(id).store(0, Ordering::Release);
        self.clear_metadata(id);
        let mut free_slots = self
            .free_slots
            .lock()
            .map_err(|_| StorageError::Corrupt("counters free-list lock poisoned"))?;
        free_slots.push(id);
        let mut allocated = self
            .allocated
            .lock()
            .map_err(|_| StorageError::Corrupt("counters allocated-count lock poisoned"))?;
        *allocated = allocated.saturating_sub(1);
        Ok(())
    }

    pub fn load(&self, id: u32) -> i64 {
        self.value_atomic(id).load(Ordering::Acquire)
    }

    pub fn load_relaxed(&self, id: u32) -> i64 {
        self.value_atomic(id).load(Ordering::Relaxed)
    }

    pub fn store(&self, id: u32, value: i64) {
        self.value_atomic(id).store(value, Ordering::Release);
    }

    pub fn allocated_count(&self) -> usize {
        *self.allocated.lock().expect("allocated-count lock poisoned")
    }

    fn write_metadata(&self, id: u32, metadata: &CounterMetadata) {
        let offset = id as usize * METADATA_RECORD_LEN;
        // SAFETY: mutation is confined to this slot's record and the
        // caller holds `free_slots` locked for the duration of the
        // allocate/free call that triggers this write.
        let slice = unsafe {
            let ptr = self.metadata.as_slice()[offset..].as_ptr() as *mut u8;
            std::slice::from_raw_parts_mut(ptr, METADATA_RECORD_LEN)
        };
        metadata.encode_into(slice);
    }

    fn clear_metadata(&self, id: u32) {
        let offset = id as usize * METADATA_RECORD_LEN;
        let slice = unsafe {
            let ptr = self.metadata.as_slice()[offset..].as_ptr() as *mut u8;
            std::slice::from_raw_parts_mut(ptr, METADATA_RECORD_LEN)
        };
        slice.fill(0);
    }
}
