//! `AeronClient` (spec §3): a connected client process, keyed by a 64-bit
//! `client_id`. Expires when its keepalive gap exceeds the configured
//! liveness timeout, checked against the nano clock per invariant 5.

use crate::counters::Counter;
use crate::error::Error;
use crate::registry::{Handle, ManagedResource};

pub struct AeronClient {
    pub client_id: i64,
    last_keepalive_ns: u64,
    liveness_timeout_ns: u64,
    /// Publishes `last_keepalive_ms` so other processes can observe it.
    liveness_counter: Counter,
    pub publication_links: Vec<Handle>,
    pub subscription_links: Vec<Handle>,
    pub counter_links: Vec<Handle>,
    closed: bool,
    timed_out: bool,
}

impl AeronClient {
    pub fn new(client_id: i64, now_ns: u64, liveness_timeout_ns: u64, liveness_counter: Counter) -> Self {
        Self {
            client_id,
            last_keepalive_ns: now_ns,
            liveness_timeout_ns,
            liveness_counter,
            publication_links: Vec::new(),
            subscription_links: Vec::new(),
            counter_links: Vec::new(),
            closed: false,
            timed_out: false,
        }
    }

    /// Records a keepalive. Spec invariant 5: "Keepalive timestamps are
    /// monotonic per client"; a keepalive older than the last one
    /// recorded is ignored rather than rewinding liveness.
    pub fn on_keepalive(&mut self, now_ns: u64, now_ms: i64) {
        if now_ns >= self.last_keepalive_ns {
            self.last_keepalive_ns = now_ns;
            self.liveness_counter.set(now_ms);
        }
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn liveness_counter(&self) -> &Counter {
        &self.liveness_counter
    }
}

impl ManagedResource for AeronClient {
    fn on_time_event(&mut self, now_ns: u64, _now_ms: u64) {
        if !self.closed
            && !self.timed_out
            && now_ns.saturating_sub(self.last_keepalive_ns) > self.liveness_timeout_ns
        {
            self.timed_out = true;
        }
    }

    fn has_reached_end_of_life(&self) -> bool {
        self.closed || self.timed_out
    }

    fn free(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CountersManager;
    use tempfile::tempdir;

    fn test_counter() -> (CountersManager, Counter) {
        let dir = tempdir().unwrap();
        let mut mgr = CountersManager::create(&dir.path().join("c"), 8).unwrap();
        let counter = mgr.allocate(0, 0, 0, b"client-liveness", "client-liveness").unwrap();
        (mgr, counter)
    }

    #[test]
    fn client_times_out_after_liveness_gap() {
        let (_mgr, counter) = test_counter();
        let mut client = AeronClient::new(1, 0, 1_000, counter);
        client.on_time_event(500, 0);
        assert!(!client.has_reached_end_of_life());
        client.on_time_event(2_000, 0);
        assert!(client.has_reached_end_of_life());
    }

    #[test]
    fn keepalive_resets_the_liveness_window() {
        let (_mgr, counter) = test_counter();
        let mut client = AeronClient::new(1, 0, 1_000, counter);
        client.on_keepalive(900, 900);
        client.on_time_event(1_500, 0);
        assert!(!client.has_reached_end_of_life());
    }

    #[test]
    fn explicit_close_marks_end_of_life() {
        let (_mgr, counter) = test_counter();
        let mut client = AeronClient::new(1, 0, 1_000, counter);
        client.mark_closed();
        assert!(client.has_reached_end_of_life());
    }
}
