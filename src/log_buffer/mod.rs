//! Log buffers (spec §2 item 3, §6 "Log-buffer file layout"): per-stream
//! files of N partitioned term buffers plus a metadata trailer, created
//! and deleted by a [`LogFactory`] the same way the teacher crate's
//! `core::segment` module owns the lifecycle of its record segments.

mod metadata;

pub use metadata::LogMetadata;

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mmap_file::MmapFile;

/// One term buffer: a flat memory-mapped region the sender/receiver
/// agents write/read records into directly. The conductor never touches
/// term-buffer contents, only the metadata trailer and lifecycle.
pub struct TermBuffer {
    mmap: MmapFile,
}

impl TermBuffer {
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mmap.as_mut_slice()
    }
}

/// A publication or image's backing file: `partition_count` term buffers
/// plus a trailing metadata region. Dropped (and its file removed from
/// disk) when the owning publication/image is freed.
pub struct LogBuffer {
    path: PathBuf,
    partitions: Vec<TermBuffer>,
    metadata: MmapFile,
}

impl LogBuffer {
    pub fn partition(&self, index: usize) -> &TermBuffer {
        &self.partitions[index]
    }

    pub fn partition_mut(&mut self, index: usize) -> &mut TermBuffer {
        &mut self.partitions[index]
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn metadata(&self) -> LogMetadata {
        LogMetadata::read(self.metadata.as_slice())
    }

    pub fn write_metadata(&mut self, metadata: &LogMetadata) {
        metadata.write(self.metadata.as_mut_slice());
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates and deletes log-buffer files (spec §2 item 3: "the conductor
/// creates/deletes these via the log factory").
pub struct LogFactory {
    dir: PathBuf,
}

impl LogFactory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, registration_id: i64) -> PathBuf {
        self.dir.join(format!("{registration_id}.logbuffer"))
    }

    /// Creates a new log buffer with `partition_count` term buffers of
    /// `term_length` bytes each, and writes the initial metadata trailer
    /// (spec §4.3 step 6): session/stream/initial-term/MTU/page-size/
    /// correlation-id/EOS=MAX, tails all at `initial_term_id` unless an
    /// explicit starting position was requested.
    pub fn create(
        &self,
        registration_id: i64,
        partition_count: usize,
        term_length: u32,
        metadata: LogMetadata,
    ) -> Result<LogBuffer> {
        let path = self.path_for(registration_id);
        let mut partitions = Vec::with_capacity(partition_count);
        for i in 0..partition_count {
            let partition_path = path.with_extension(format!("term.{i}"));
            let mmap = MmapFile::create(&partition_path, term_length as usize)
                .map_err(Error::Storage)?;
            partitions.push(TermBuffer { mmap });
        }
        let metadata_path = path.with_extension("meta");
        let mut metadata_mmap =
            MmapFile::create(&metadata_path, LogMetadata::ENCODED_LEN).map_err(Error::Storage)?;
        metadata.write(metadata_mmap.as_mut_slice());

        Ok(LogBuffer {
            path,
            partitions,
            metadata: metadata_mmap,
        })
    }

    /// Removes every file backing a log buffer (term partitions and the
    /// metadata trailer). Missing files are not an error: deletion must
    /// be idempotent since a retried free (registry.rs) may call it
    /// twice.
    pub fn delete(&self, registration_id: i64, partition_count: usize) -> Result<()> {
        let path = self.path_for(registration_id);
        for i in 0..partition_count {
            let partition_path = path.with_extension(format!("term.{i}"));
            match std::fs::remove_file(&partition_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::Storage(err.into())),
            }
        }
        let metadata_path = path.with_extension("meta");
        match std::fs::remove_file(&metadata_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Storage(err.into())),
        }
    }
}
