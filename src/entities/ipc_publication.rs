//! `IpcPublication` (spec §3): a shared-memory-only publication. Same
//! lifecycle shape as [`super::NetworkPublication`] minus the sender-side
//! counters and flow control, since there is no wire transport to pace.

use crate::counters::Counter;
use crate::entities::LifecycleState;
use crate::error::Error;
use crate::log_buffer::LogBuffer;
use crate::registry::ManagedResource;

pub struct IpcPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub canonical_channel: String,
    pub log_buffer: LogBuffer,
    pub publisher_position: Counter,
    pub publisher_limit: Counter,
    pub link_count: u32,
    state: LifecycleState,
    linger_deadline_ns: Option<u64>,
    linger_timeout_ns: u64,
}

impl IpcPublication {
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        canonical_channel: String,
        log_buffer: LogBuffer,
        publisher_position: Counter,
        publisher_limit: Counter,
        linger_timeout_ns: u64,
    ) -> Self {
        Self {
            registration_id,
            session_id,
            stream_id,
            canonical_channel,
            log_buffer,
            publisher_position,
            publisher_limit,
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

    pub fn decref(&mut self) {
        self.link_count = self.link_count.saturating_sub(1);
        if self.link_count == 0 && self.state == LifecycleState::Active {
            // IPC has no sender to drain behind; go straight to linger so
            // subscribers attached to its log buffer still get to catch up.
            self.state = LifecycleState::Linger;
        }
    }
}

impl ManagedResource for IpcPublication {
    fn on_time_event(&mut self, now_ns: u64, _now_ms: u64) {
        if self.state == LifecycleState::Linger && self.linger_deadline_ns.is_none() {
            self.linger_deadline_ns = Some(now_ns + self.linger_timeout_ns);
        }
        if let (LifecycleState::Linger, Some(deadline)) = (self.state, self.linger_deadline_ns) {
            if now_ns >= deadline {
                self.state = LifecycleState::Done;
            }
        }
    }

    fn has_reached_end_of_life(&self) -> bool {
        self.state.is_done()
    }

    fn free(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
