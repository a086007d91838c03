//! Driver-wide tunables, collected the way the teacher crate collects
//! `ReaderConfig`/`WriterConfig`/`TierConfig`: a plain `Default`-able
//! struct handed to constructors by reference.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Interval between heartbeat passes (spec §4.7).
    pub timer_interval: Duration,
    /// A client is expired if its keepalive gap exceeds this (spec §4.7).
    pub client_liveness_timeout: Duration,
    /// Grace period a publication spends in linger before it is freed.
    pub publication_linger_timeout: Duration,
    /// Grace period an image spends in linger before it is freed.
    pub image_linger_timeout: Duration,
    /// Window during which an untethered subscriber may still join an
    /// image before it is excluded from flow-control feedback.
    pub untethered_window_timeout: Duration,
    /// Session ids in this range are reserved and skipped by the
    /// allocator (spec §4.8).
    pub reserved_session_id_range: RangeInclusive<i32>,
    /// Directory backing counter-registry memory-mapped files.
    pub counters_dir: PathBuf,
    /// Directory backing publication/image log-buffer files.
    pub log_buffers_dir: PathBuf,
    /// Capacity, in frames, of the client command ring buffer.
    pub command_ring_capacity: usize,
    /// Capacity of the internal sender/receiver-to-conductor queue.
    pub internal_queue_capacity: usize,
    /// Maximum commands drained from the client ring buffer per tick.
    pub max_commands_per_tick: usize,
    /// Maximum closures drained from the internal queue per tick.
    pub max_internal_commands_per_tick: usize,
    /// Default term-buffer length when a channel URI does not specify one.
    pub default_term_length: u32,
    /// Default MTU when a channel URI does not specify one.
    pub default_mtu: u32,
    /// Largest MTU a publication may request.
    pub max_mtu: u32,
    /// Number of term-buffer partitions per log (Aeron convention: 3).
    pub partition_count: usize,
    /// Counters-file capacity, in slots.
    pub max_counters: usize,
    /// How long a `RetransmitHandler` entry lingers before a repeat NAK
    /// for the same range is allowed to trigger another retransmission.
    pub retransmit_linger_timeout: Duration,
    /// Maximum number of retransmit actions a `NetworkPublication` will
    /// track in flight at once.
    pub max_outstanding_retransmits: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timer_interval: Duration::from_secs(1),
            client_liveness_timeout: Duration::from_secs(10),
            publication_linger_timeout: Duration::from_secs(5),
            image_linger_timeout: Duration::from_secs(5),
            untethered_window_timeout: Duration::from_secs(5),
            reserved_session_id_range: 1_000_000_000..=1_000_001_000,
            counters_dir: PathBuf::from("/dev/shm/media-conductor/counters"),
            log_buffers_dir: PathBuf::from("/dev/shm/media-conductor/logs"),
            command_ring_capacity: 1024,
            internal_queue_capacity: 1024,
            max_commands_per_tick: 64,
            max_internal_commands_per_tick: 64,
            default_term_length: 16 * 1024 * 1024,
            default_mtu: 1408,
            max_mtu: 65507,
            partition_count: 3,
            max_counters: 4096,
            retransmit_linger_timeout: Duration::from_millis(200),
            max_outstanding_retransmits: 16,
        }
    }
}
