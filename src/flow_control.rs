//! Pluggable `FlowControl` and `CongestionControl` strategies
//! (spec §9 DESIGN NOTES: "Polymorphic FlowControl and CongestionControl
//! strategies"). Selected at publication/image creation time based on
//! whether the channel is unicast or multicast (spec §4.3 step 8, §4.4
//! step 4).

/// Send-side feedback strategy: tracks status messages from receivers
/// and computes the sender's position limit.
pub trait FlowControl: Send {
    fn initialize(&mut self, initial_term_id: i32, term_length: u32);
    fn on_status_message(&mut self, receiver_id: i64, position: i64, now_ns: u64);
    fn on_setup(&mut self, now_ns: u64);
    fn on_idle(&mut self, now_ns: u64) -> i64;
    fn has_required_receivers(&self) -> bool;
    fn close(&mut self);
}

/// Receive-side feedback strategy: paces NAK/retransmit behavior based on
/// how far behind the slowest attached subscriber is.
pub trait CongestionControl: Send {
    fn on_track_rebuild(&mut self, now_ns: u64, high_water_mark: i64, completed_position: i64);
    fn should_measure_receiver_count(&self) -> bool;
}

/// Unicast flow control: the sender's limit tracks the single receiver's
/// reported position directly; no quorum logic is needed.
#[derive(Debug, Default)]
pub struct UnicastFlowControl {
    receiver_position: i64,
    has_receiver: bool,
}

impl FlowControl for UnicastFlowControl {
    fn initialize(&mut self, _initial_term_id: i32, _term_length: u32) {
        self.receiver_position = 0;
        self.has_receiver = false;
    }

    fn on_status_message(&mut self, _receiver_id: i64, position: i64, _now_ns: u64) {
        self.receiver_position = self.receiver_position.max(position);
        self.has_receiver = true;
    }

    fn on_setup(&mut self, _now_ns: u64) {}

    fn on_idle(&mut self, _now_ns: u64) -> i64 {
        self.receiver_position
    }

    fn has_required_receivers(&self) -> bool {
        self.has_receiver
    }

    fn close(&mut self) {}
}

/// Multicast flow control: the sender's limit tracks the minimum position
/// across all receivers that have reported in, the same "slowest receiver
/// wins" behavior the teacher's windowed reader tiers use for backpressure.
#[derive(Debug, Default)]
pub struct MulticastFlowControl {
    receiver_positions: std::collections::HashMap<i64, i64>,
    min_group_size: usize,
}

impl MulticastFlowControl {
    pub fn new(min_group_size: usize) -> Self {
        Self {
            receiver_positions: std::collections::HashMap::new(),
            min_group_size,
        }
    }
}

impl FlowControl for MulticastFlowControl {
    fn initialize(&mut self, _initial_term_id: i32, _term_length: u32) {
        self.receiver_positions.clear();
    }

    fn on_status_message(&mut self, receiver_id: i64, position: i64, _now_ns: u64) {
        self.receiver_positions.insert(receiver_id, position);
    }

    fn on_setup(&mut self, _now_ns: u64) {}

    fn on_idle(&mut self, _now_ns: u64) -> i64 {
        self.receiver_positions
            .values()
            .copied()
            .min()
            .unwrap_or(i64::MAX)
    }

    fn has_required_receivers(&self) -> bool {
        self.receiver_positions.len() >= self.min_group_size
    }

    fn close(&mut self) {
        self.receiver_positions.clear();
    }
}

/// Selects the flow-control strategy for a new publication (spec §4.3
/// step 8: "multicast vs unicast based on channel").
pub fn select_flow_control(is_multicast: bool, min_group_size: usize) -> Box<dyn FlowControl> {
    if is_multicast {
        Box::new(MulticastFlowControl::new(min_group_size))
    } else {
        Box::new(UnicastFlowControl::default())
    }
}

/// Congestion control that only reacts to the observed high-water mark,
/// suitable for unicast images.
#[derive(Debug, Default)]
pub struct UnicastCongestionControl;

impl CongestionControl for UnicastCongestionControl {
    fn on_track_rebuild(&mut self, _now_ns: u64, _high_water_mark: i64, _completed_position: i64) {}

    fn should_measure_receiver_count(&self) -> bool {
        false
    }
}

/// Congestion control for multicast images: tracks receiver count to pace
/// NAK suppression.
#[derive(Debug, Default)]
pub struct MulticastCongestionControl;

impl CongestionControl for MulticastCongestionControl {
    fn on_track_rebuild(&mut self, _now_ns: u64, _high_water_mark: i64, _completed_position: i64) {}

    fn should_measure_receiver_count(&self) -> bool {
        true
    }
}

pub fn select_congestion_control(is_multicast: bool) -> Box<dyn CongestionControl> {
    if is_multicast {
        Box::new(MulticastCongestionControl)
    } else {
        Box::new(UnicastCongestionControl)
    }
}

/// One outstanding retransmit raised by a NAK against `(term_id,
/// term_offset)`, linger-timed so a burst of NAKs for the same range
/// only triggers one retransmission (spec §3 NetworkPublication:
/// "a `RetransmitHandler`").
struct ActiveRetransmit {
    term_id: i32,
    term_offset: i32,
    expire_ns: u64,
}

/// Tracks in-flight retransmit actions for a `NetworkPublication` and
/// suppresses duplicate NAKs for a range already being retransmitted,
/// the send-side counterpart to `FlowControl`/`CongestionControl`
/// selected alongside it at publication creation (spec §4.3 step 8).
pub struct RetransmitHandler {
    active: Vec<ActiveRetransmit>,
    linger_ns: u64,
    max_outstanding: usize,
}

impl RetransmitHandler {
    pub fn new(linger_ns: u64, max_outstanding: usize) -> Self {
        Self {
            active: Vec::new(),
            linger_ns,
            max_outstanding,
        }
    }

    /// Called when the receiver's NAK for `(term_id, term_offset)`
    /// reaches the sender. Returns `true` if this range should actually
    /// be retransmitted (not already in flight, and under the
    /// outstanding-retransmit cap).
    pub fn on_nak(&mut self, term_id: i32, term_offset: i32, now_ns: u64) -> bool {
        self.expire_lapsed(now_ns);
        if self.active.iter().any(|r| r.term_id == term_id && r.term_offset == term_offset) {
            return false;
        }
        if self.active.len() >= self.max_outstanding {
            return false;
        }
        self.active.push(ActiveRetransmit {
            term_id,
            term_offset,
            expire_ns: now_ns + self.linger_ns,
        });
        true
    }

    fn expire_lapsed(&mut self, now_ns: u64) {
        self.active.retain(|r| r.expire_ns > now_ns);
    }

    pub fn outstanding(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_flow_control_tracks_single_receiver() {
        let mut fc = UnicastFlowControl::default();
        fc.initialize(0, 1 << 16);
        assert!(!fc.has_required_receivers());
        fc.on_status_message(1, 100, 0);
        assert!(fc.has_required_receivers());
        assert_eq!(fc.on_idle(0), 100);
    }

    #[test]
    fn multicast_flow_control_tracks_slowest_receiver() {
        let mut fc = MulticastFlowControl::new(2);
        fc.initialize(0, 1 << 16);
        fc.on_status_message(1, 200, 0);
        assert!(!fc.has_required_receivers());
        fc.on_status_message(2, 100, 0);
        assert!(fc.has_required_receivers());
        assert_eq!(fc.on_idle(0), 100);
    }

    #[test]
    fn select_flow_control_picks_by_multicast_flag() {
        let unicast = select_flow_control(false, 1);
        assert!(!unicast.has_required_receivers());
        let multicast = select_flow_control(true, 1);
        assert!(!multicast.has_required_receivers());
    }

    #[test]
    fn retransmit_handler_suppresses_duplicate_naks_for_same_range() {
        let mut handler = RetransmitHandler::new(1_000, 4);
        assert!(handler.on_nak(0, 64, 0));
        assert!(!handler.on_nak(0, 64, 0));
        assert_eq!(handler.outstanding(), 1);
    }

    #[test]
    fn retransmit_handler_allows_retry_after_linger_expires() {
        let mut handler = RetransmitHandler::new(1_000, 4);
        assert!(handler.on_nak(0, 64, 0));
        assert!(handler.on_nak(0, 64, 2_000));
    }

    #[test]
    fn retransmit_handler_caps_outstanding_retransmits() {
        let mut handler = RetransmitHandler::new(1_000, 2);
        assert!(handler.on_nak(0, 0, 0));
        assert!(handler.on_nak(0, 64, 0));
        assert!(!handler.on_nak(0, 128, 0));
        assert_eq!(handler.outstanding(), 2);
    }
}
