//! `NetworkPublication` (spec §3): a send-side logical stream over UDP.
//! Owns its log buffer, the publisher/sender counters, a `FlowControl`
//! strategy, a `RetransmitHandler`, and runs the shared publication
//! state machine (spec §4.3).

use crate::counters::Counter;
use crate::entities::LifecycleState;
use crate::error::Error;
use crate::flow_control::{FlowControl, RetransmitHandler};
use crate::log_buffer::LogBuffer;
use crate::registry::ManagedResource;

pub struct NetworkPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub canonical_channel: String,
    pub channel_endpoint_handle: crate::registry::Handle,
    pub log_buffer: LogBuffer,
    pub publisher_position: Counter,
    pub publisher_limit: Counter,
    pub sender_position: Counter,
    pub sender_limit: Counter,
    pub sender_backpressure_events: Counter,
    pub flow_control: Box<dyn FlowControl>,
    pub retransmit_handler: RetransmitHandler,
    /// Count of live `PublicationLink`s against this publication. Every
    /// link site (the initial creator and every later shared `AddPublication`)
    /// has exactly one matching `incref` in `dispatcher::link_publication`
    /// (spec §4.3 "Draining: last link removed" depends on this being exact).
    pub link_count: u32,
    state: LifecycleState,
    linger_deadline_ns: Option<u64>,
    linger_timeout_ns: u64,
}

impl NetworkPublication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        canonical_channel: String,
        channel_endpoint_handle: crate::registry::Handle,
        log_buffer: LogBuffer,
        publisher_position: Counter,
        publisher_limit: Counter,
        sender_position: Counter,
        sender_limit: Counter,
        sender_backpressure_events: Counter,
        flow_control: Box<dyn FlowControl>,
        retransmit_handler: RetransmitHandler,
        linger_timeout_ns: u64,
    ) -> Self {
        Self {
            registration_id,
            session_id,
            stream_id,
            canonical_channel,
            channel_endpoint_handle,
            log_buffer,
            publisher_position,
            publisher_limit,
            sender_position,
            sender_limit,
            sender_backpressure_events,
            flow_control,
            retransmit_handler,
            link_count: 0,
            state: LifecycleState::Active,
            linger_deadline_ns: None,
            linger_timeout_ns,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn incref(&mut self) {
        self.link_count += 1;
    }

    /// Drops a reference. When the last `PublicationLink` is removed the
    /// publication moves from Active into Draining (spec §4.3 "Draining:
    /// last link removed").
    pub fn decref(&mut self) {
        self.link_count = self.link_count.saturating_sub(1);
        if self.link_count == 0 && self.state == LifecycleState::Active {
            self.state = LifecycleState::Draining;
        }
    }

    /// Producers have caught up to the sender: move Draining -> Linger
    /// and start the linger clock.
    fn enter_linger(&mut self, now_ns: u64) {
        self.state = LifecycleState::Linger;
        self.linger_deadline_ns = Some(now_ns + self.linger_timeout_ns);
    }

    fn producers_caught_up(&self) -> bool {
        self.sender_position.get() >= self.publisher_position.get()
    }
}

impl ManagedResource for NetworkPublication {
    fn on_time_event(&mut self, now_ns: u64, _now_ms: u64) {
        match self.state {
            LifecycleState::Draining => {
                if self.producers_caught_up() {
                    self.enter_linger(now_ns);
                }
            }
            LifecycleState::Linger => {
                if self
                    .linger_deadline_ns
                    .map(|deadline| now_ns >= deadline)
                    .unwrap_or(false)
                {
                    self.state = LifecycleState::Done;
                }
            }
            LifecycleState::Active | LifecycleState::Done => {}
        }
    }

    fn has_reached_end_of_life(&self) -> bool {
        self.state.is_done()
    }

    fn free(&mut self) -> Result<(), Error> {
        self.flow_control.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CountersManager;
    use crate::flow_control::{select_flow_control, RetransmitHandler};
    use crate::log_buffer::{LogFactory, LogMetadata};
    use tempfile::tempdir;

    fn make_publication(dir: &std::path::Path) -> (CountersManager, NetworkPublication) {
        let mut counters = CountersManager::create(&dir.join("counters.dat"), 16).unwrap();
        let factory = LogFactory::new(dir.to_path_buf());
        let metadata = LogMetadata {
            session_id: 1,
            stream_id: 1,
            initial_term_id: 0,
            active_term_count: 0,
            mtu: 1408,
            term_length: 1 << 16,
            page_size: 4096,
            correlation_id: 1,
            end_of_stream_position: i64::MAX,
            tail_positions: [0; 3],
        };
        let log_buffer = factory.create(1, 3, 1 << 16, metadata).unwrap();
        let publication = NetworkPublication::new(
            1,
            1,
            1,
            "udp://127.0.0.1:40000".into(),
            0,
            log_buffer,
            counters.allocate(1, 0, 1, b"pub-pos", "pub-pos").unwrap(),
            counters.allocate(2, 0, 1, b"pub-lim", "pub-lim").unwrap(),
            counters.allocate(3, 0, 1, b"snd-pos", "snd-pos").unwrap(),
            counters.allocate(4, 0, 1, b"snd-lim", "snd-lim").unwrap(),
            counters.allocate(5, 0, 1, b"snd-bpe", "snd-bpe").unwrap(),
            select_flow_control(false, 1),
            RetransmitHandler::new(1_000, 16),
            1_000,
        );
        (counters, publication)
    }

    #[test]
    fn drains_then_lingers_then_completes() {
        let dir = tempdir().unwrap();
        let (_counters, mut publication) = make_publication(dir.path());
        publication.incref();
        assert_eq!(publication.state(), LifecycleState::Active);

        publication.decref();
        assert_eq!(publication.state(), LifecycleState::Draining);

        publication.publisher_position.set(100);
        publication.sender_position.set(100);
        publication.on_time_event(0, 0);
        assert_eq!(publication.state(), LifecycleState::Linger);

        publication.on_time_event(500, 0);
        assert_eq!(publication.state(), LifecycleState::Linger);
        assert!(!publication.has_reached_end_of_life());

        publication.on_time_event(1_001, 0);
        assert!(publication.has_reached_end_of_life());
    }
}
