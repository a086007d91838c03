//! `SendChannelEndpoint` / `ReceiveChannelEndpoint` (spec §3, §4.5): one
//! per distinct canonical UDP channel, torn down when every reference
//! (publication, subscription, or image) drops to zero.

use std::collections::HashMap;

use crate::counters::Counter;
use crate::error::Error;
use crate::registry::ManagedResource;

pub struct SendChannelEndpoint {
    pub canonical_channel: String,
    pub tag: Option<String>,
    pub status_counter: Counter,
    pub local_address_counter: Counter,
    /// Last address the name resolver resolved this channel's endpoint
    /// to, used so re-resolution to the same address is a no-op
    /// (spec R2).
    pub resolved_address: Option<String>,
    publication_refs: u32,
    closing: bool,
}

impl SendChannelEndpoint {
    pub fn new(canonical_channel: String, tag: Option<String>, status_counter: Counter, local_address_counter: Counter) -> Self {
        Self {
            canonical_channel,
            tag,
            status_counter,
            local_address_counter,
            resolved_address: None,
            publication_refs: 0,
            closing: false,
        }
    }

    pub fn inc_ref(&mut self) {
        self.publication_refs += 1;
    }

    pub fn dec_ref(&mut self) {
        self.publication_refs = self.publication_refs.saturating_sub(1);
    }

    /// Spec §4.5: "an endpoint `should_be_closed()` when all ... kinds of
    /// references are zero".
    pub fn should_be_closed(&self) -> bool {
        self.publication_refs == 0
    }

    pub fn mark_closing(&mut self) {
        self.closing = true;
    }
}

impl ManagedResource for SendChannelEndpoint {
    fn on_time_event(&mut self, _now_ns: u64, _now_ms: u64) {
        if self.should_be_closed() {
            self.closing = true;
        }
    }

    fn has_reached_end_of_life(&self) -> bool {
        self.closing && self.should_be_closed()
    }

    fn free(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Receive endpoints count references per `(stream_id[, session_id])`
/// pair plus images, since multiple subscriptions on different streams
/// can share one endpoint (spec §4.5).
#[derive(Default)]
pub struct ReceiveChannelEndpoint {
    pub canonical_channel: String,
    pub status_counter: Option<Counter>,
    pub local_address_counter: Option<Counter>,
    /// Last address the name resolver resolved this channel's
    /// `control`/`endpoint` to, used so re-resolution to the same
    /// address is a no-op (spec R2).
    pub resolved_address: Option<String>,
    stream_refs: HashMap<i32, u32>,
    stream_session_refs: HashMap<(i32, i32), u32>,
    image_refs: u32,
    closing: bool,
    /// Params pinned by whichever subscription first created this
    /// endpoint; every later subscription sharing it is validated
    /// against these (spec §4.4 step 2, S1).
    reliable: bool,
    rejoin: bool,
    socket_rcvbuf: Option<u32>,
    socket_sndbuf: Option<u32>,
}

impl ReceiveChannelEndpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        canonical_channel: String,
        status_counter: Counter,
        local_address_counter: Counter,
        reliable: bool,
        rejoin: bool,
        socket_rcvbuf: Option<u32>,
        socket_sndbuf: Option<u32>,
    ) -> Self {
        Self {
            canonical_channel,
            status_counter: Some(status_counter),
            local_address_counter: Some(local_address_counter),
            reliable,
            rejoin,
            socket_rcvbuf,
            socket_sndbuf,
            ..Default::default()
        }
    }

    /// Spec §4.4 step 2: "validate that reliable, rejoin, socket-rcvbuf,
    /// socket-sndbuf ... do not conflict with any existing subscription
    /// on that endpoint; failure is reported with a typed error and the
    /// subscription is not created." `socket-rcvbuf`/`socket-sndbuf` of
    /// zero means "OS default" and matches any existing value (spec
    /// §4.9).
    pub fn validate_compatible(&self, reliable: bool, rejoin: bool, socket_rcvbuf: Option<u32>, socket_sndbuf: Option<u32>) -> Result<(), Error> {
        if reliable != self.reliable {
            return Err(Error::InvalidChannel(format!(
                "reliable={reliable} conflicts with existing subscription's reliable={}",
                self.reliable
            )));
        }
        if rejoin != self.rejoin {
            return Err(Error::InvalidChannel(format!(
                "rejoin={rejoin} conflicts with existing subscription's rejoin={}",
                self.rejoin
            )));
        }
        if !buffer_size_compatible(socket_rcvbuf, self.socket_rcvbuf) {
            return Err(Error::InvalidChannel("socket-rcvbuf conflicts with existing subscription".into()));
        }
        if !buffer_size_compatible(socket_sndbuf, self.socket_sndbuf) {
            return Err(Error::InvalidChannel("socket-sndbuf conflicts with existing subscription".into()));
        }
        Ok(())
    }

    /// Returns `true` if the refcount for `stream_id` just transitioned
    /// from 0 to 1 (spec §4.4 step 3: "post AddSubscription to the
    /// receiver" only on that transition).
    pub fn inc_ref_to_stream(&mut self, stream_id: i32) -> bool {
        let count = self.stream_refs.entry(stream_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn dec_ref_to_stream(&mut self, stream_id: i32) {
        if let Some(count) = self.stream_refs.get_mut(&stream_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.stream_refs.remove(&stream_id);
            }
        }
    }

    pub fn inc_ref_to_stream_and_session(&mut self, stream_id: i32, session_id: i32) -> bool {
        let count = self.stream_session_refs.entry((stream_id, session_id)).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn dec_ref_to_stream_and_session(&mut self, stream_id: i32, session_id: i32) {
        if let Some(count) = self.stream_session_refs.get_mut(&(stream_id, session_id)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.stream_session_refs.remove(&(stream_id, session_id));
            }
        }
    }

    pub fn inc_image_ref(&mut self) {
        self.image_refs += 1;
    }

    pub fn dec_image_ref(&mut self) {
        self.image_refs = self.image_refs.saturating_sub(1);
    }

    pub fn should_be_closed(&self) -> bool {
        self.stream_refs.is_empty() && self.stream_session_refs.is_empty() && self.image_refs == 0
    }
}

impl ManagedResource for ReceiveChannelEndpoint {
    fn on_time_event(&mut self, _now_ns: u64, _now_ms: u64) {
        if self.should_be_closed() {
            self.closing = true;
        }
    }

    fn has_reached_end_of_life(&self) -> bool {
        self.closing && self.should_be_closed()
    }

    fn free(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// `0`/absent means "OS default" and is compatible with any existing
/// value (spec §4.9).
fn buffer_size_compatible(requested: Option<u32>, existing: Option<u32>) -> bool {
    match (requested, existing) {
        (None, _) | (_, None) => true,
        (Some(0), _) | (_, Some(0)) => true,
        (Some(a), Some(b)) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_refcount_transition_reported_once() {
        let mut endpoint = ReceiveChannelEndpoint::default();
        assert!(endpoint.inc_ref_to_stream(7));
        assert!(!endpoint.inc_ref_to_stream(7));
        endpoint.dec_ref_to_stream(7);
        assert!(!endpoint.should_be_closed());
        endpoint.dec_ref_to_stream(7);
        assert!(endpoint.should_be_closed());
    }

    #[test]
    fn closes_only_when_all_reference_kinds_are_zero() {
        let mut endpoint = ReceiveChannelEndpoint::default();
        endpoint.inc_ref_to_stream(1);
        endpoint.inc_image_ref();
        assert!(!endpoint.should_be_closed());
        endpoint.dec_ref_to_stream(1);
        assert!(!endpoint.should_be_closed());
        endpoint.dec_image_ref();
        assert!(endpoint.should_be_closed());
    }

    #[test]
    fn reliable_conflict_is_rejected_but_zero_buffers_are_compatible_with_anything() {
        let endpoint = ReceiveChannelEndpoint {
            reliable: true,
            rejoin: false,
            socket_rcvbuf: Some(4096),
            socket_sndbuf: None,
            ..Default::default()
        };
        assert!(endpoint.validate_compatible(true, false, None, None).is_ok());
        assert!(endpoint.validate_compatible(false, false, None, None).is_err());
        assert!(endpoint.validate_compatible(true, true, None, None).is_err());
        assert!(endpoint.validate_compatible(true, false, Some(0), None).is_ok());
        assert!(endpoint.validate_compatible(true, false, Some(8192), None).is_err());
    }
}
