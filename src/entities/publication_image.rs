//! `PublicationImage` (spec §3): a receive-side reassembly of one remote
//! publisher's stream. Owns its log buffer, receiver HWM/position
//! counters, a congestion-control strategy, and the set of attached
//! `SubscriberPosition`s (tracked by the owning `SubscriptionLink`s, not
//! duplicated here, per spec §9 "no shared-ownership cycles needed").

use crate::counters::Counter;
use crate::entities::LifecycleState;
use crate::error::Error;
use crate::flow_control::CongestionControl;
use crate::log_buffer::LogBuffer;
use crate::registry::ManagedResource;

pub struct PublicationImage {
    pub correlation_id: i64,
    pub channel_endpoint_handle: crate::registry::Handle,
    pub session_id: i32,
    pub stream_id: i32,
    pub log_buffer: LogBuffer,
    pub receiver_hwm: Counter,
    pub receiver_position: Counter,
    pub congestion_control: Box<dyn CongestionControl>,
    pub is_sparse: bool,
    /// Number of `SubscriptionLink`s that reference this image; drops to
    /// zero when every subscriber unlinks it (spec §4.4, invariant I2).
    pub subscriber_count: u32,
    state: LifecycleState,
    linger_deadline_ns: Option<u64>,
    linger_timeout_ns: u64,
}

impl PublicationImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: i64,
        channel_endpoint_handle: crate::registry::Handle,
        session_id: i32,
        stream_id: i32,
        log_buffer: LogBuffer,
        receiver_hwm: Counter,
        receiver_position: Counter,
        congestion_control: Box<dyn CongestionControl>,
        is_sparse: bool,
        linger_timeout_ns: u64,
    ) -> Self {
        Self {
            correlation_id,
            channel_endpoint_handle,
            session_id,
            stream_id,
            log_buffer,
            receiver_hwm,
            receiver_position,
            congestion_control,
            is_sparse,
            subscriber_count: 0,
            state: LifecycleState::Active,
            linger_deadline_ns: None,
            linger_timeout_ns,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach_subscriber(&mut self) {
        self.subscriber_count += 1;
    }

    /// Spec §4.4 step 7 / invariant I4: every `onAvailableImage` is
    /// followed by exactly one `onUnavailableImage` before teardown, so
    /// callers must emit that notification before this drops the count
    /// to zero and the image drains toward linger.
    pub fn detach_subscriber(&mut self) {
        self.subscriber_count = self.subscriber_count.saturating_sub(1);
        if self.subscriber_count == 0 && self.state == LifecycleState::Active {
            self.state = LifecycleState::Draining;
        }
    }

    fn reached_end_of_stream(&self) -> bool {
        self.receiver_position.get() >= self.receiver_hwm.get()
    }
}

impl ManagedResource for PublicationImage {
    fn on_time_event(&mut self, now_ns: u64, _now_ms: u64) {
        match self.state {
            LifecycleState::Draining => {
                if self.reached_end_of_stream() {
                    self.state = LifecycleState::Linger;
                    self.linger_deadline_ns = Some(now_ns + self.linger_timeout_ns);
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
        Ok(())
    }
}
