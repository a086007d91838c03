//! Multi-Destination Cast (send-side) and Multi-Destination Subscription
//! (receive-side) management (spec §4.6, GLOSSARY "MDC"/"MDS").

use crate::channel_uri::ChannelUri;
use crate::error::Error;
use crate::registry::Handle;

/// One unicast destination added to a send channel in manual control
/// mode (spec §4.6 MDC).
#[derive(Debug, Clone)]
pub struct SendDestination {
    pub correlation_id: i64,
    pub channel: String,
    pub resolved_address: String,
}

/// Tracks the unicast destinations fanned out from one MDC publication.
#[derive(Default)]
pub struct ManualSendDestinations {
    destinations: Vec<SendDestination>,
}

impl ManualSendDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and records a new destination (spec §4.6: "validates
    /// that each destination URI is not a spy prefix and does not carry
    /// any of the reserved keys"). The resolved address is supplied by
    /// the caller (the name resolver is out of scope here).
    pub fn add(&mut self, correlation_id: i64, channel: &str, resolved_address: String) -> Result<(), Error> {
        let uri = ChannelUri::parse(channel)?;
        uri.validate_as_destination()?;
        self.destinations.push(SendDestination {
            correlation_id,
            channel: channel.to_string(),
            resolved_address,
        });
        Ok(())
    }

    pub fn remove(&mut self, channel: &str) -> Option<SendDestination> {
        let index = self.destinations.iter().position(|d| d.channel == channel)?;
        Some(self.destinations.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendDestination> {
        self.destinations.iter()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

/// The kind of receive destination added to an MDS anchor subscription
/// (spec §4.6: "new subscriptions in their own right (IPC/Spy/Network)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDestinationKind {
    Network,
    Ipc,
    Spy,
}

/// Tracks the child `SubscriptionLink`s hooked to one MDS anchor
/// subscription. The anchor itself is a regular `SubscriptionLink` with
/// `supports_mds = true`; this struct is owned alongside it by the
/// conductor (not by the link, to avoid a cycle).
#[derive(Default)]
pub struct ManualReceiveDestinations {
    children: Vec<ReceiveDestination>,
}

/// One MDS child subscription, keyed by its canonical channel so that
/// `RemoveRcvDestination` can find the exact sub-subscription the client
/// named (spec §4.6: "Removing an IPC/Spy destination removes exactly
/// that sub-subscription").
pub struct ReceiveDestination {
    pub subscription_handle: Handle,
    pub kind: ReceiveDestinationKind,
    pub canonical_channel: String,
}

impl ManualReceiveDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_child(&mut self, subscription_handle: Handle, kind: ReceiveDestinationKind, canonical_channel: String) {
        self.children.push(ReceiveDestination {
            subscription_handle,
            kind,
            canonical_channel,
        });
    }

    /// Removes a child destination. Spec §4.6: "Removing an IPC/Spy
    /// destination removes exactly that sub-subscription ... removing a
    /// network destination posts a destination-removal to the receiver
    /// without destroying the anchor" — in both cases the anchor survives
    /// here; callers decide whether the removed child's images need
    /// `onUnavailableImage` notifications before freeing it.
    pub fn remove_child(&mut self, subscription_handle: Handle) -> Option<ReceiveDestinationKind> {
        let index = self.children.iter().position(|child| child.subscription_handle == subscription_handle)?;
        Some(self.children.remove(index).kind)
    }

    /// Finds the child destination whose canonical channel matches the
    /// one the client named in `RemoveRcvDestination`.
    pub fn find_by_channel(&self, canonical_channel: &str) -> Option<Handle> {
        self.children
            .iter()
            .find(|child| child.canonical_channel == canonical_channel)
            .map(|child| child.subscription_handle)
    }

    pub fn children(&self) -> impl Iterator<Item = &ReceiveDestination> {
        self.children.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_spy_and_reserved_key_destinations() {
        let mut destinations = ManualSendDestinations::new();
        assert!(destinations
            .add(1, "aeron-spy:aeron:udp?endpoint=127.0.0.1:1", "127.0.0.1:1".into())
            .is_err());
        assert!(destinations
            .add(1, "aeron:udp?endpoint=127.0.0.1:1|mtu=1408", "127.0.0.1:1".into())
            .is_err());
        assert!(destinations
            .add(1, "aeron:udp?endpoint=127.0.0.1:40200", "127.0.0.1:40200".into())
            .is_ok());
        assert_eq!(destinations.len(), 1);
    }

    #[test]
    fn remove_drops_matching_destination_only() {
        let mut destinations = ManualSendDestinations::new();
        destinations
            .add(1, "aeron:udp?endpoint=127.0.0.1:40200", "a".into())
            .unwrap();
        destinations
            .add(2, "aeron:udp?endpoint=127.0.0.1:40201", "b".into())
            .unwrap();
        let removed = destinations.remove("aeron:udp?endpoint=127.0.0.1:40200").unwrap();
        assert_eq!(removed.correlation_id, 1);
        assert_eq!(destinations.len(), 1);
    }

    #[test]
    fn mds_children_track_kind_and_can_be_removed() {
        let mut children = ManualReceiveDestinations::new();
        children.add_child(3, ReceiveDestinationKind::Network, "aeron:udp?endpoint=127.0.0.1:1".into());
        children.add_child(4, ReceiveDestinationKind::Spy, "aeron:udp?endpoint=127.0.0.1:2".into());
        assert_eq!(children.remove_child(3), Some(ReceiveDestinationKind::Network));
        assert_eq!(children.children().count(), 1);
    }

    #[test]
    fn mds_find_by_channel_locates_named_child() {
        let mut children = ManualReceiveDestinations::new();
        children.add_child(3, ReceiveDestinationKind::Network, "aeron:udp?endpoint=127.0.0.1:1".into());
        children.add_child(4, ReceiveDestinationKind::Spy, "aeron:udp?endpoint=127.0.0.1:2".into());
        assert_eq!(children.find_by_channel("aeron:udp?endpoint=127.0.0.1:2"), Some(4));
        assert_eq!(children.find_by_channel("aeron:udp?endpoint=127.0.0.1:9"), None);
    }
}
