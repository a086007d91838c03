//! `SubscriptionLink` (spec §3): a client subscription, one of three
//! variants (Network, IPC, Spy). Holds the ordered list of linked images
//! together with each image's `SubscriberPosition` counter.

use crate::counters::Counter;
use crate::entities::publication_link::PublicationKind;
use crate::error::Error;
use crate::registry::{Handle, ManagedResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Network,
    Ipc,
    Spy,
}

/// One image linked to a subscription, paired with the
/// `SubscriberPosition` counter the receiver advances as it consumes that
/// image (spec §3 "SubscriberPosition", invariant I2).
pub struct ImageLink {
    pub image_handle: Handle,
    pub subscriber_position: Counter,
}

/// An IPC or Spy subscription's link to a local publication it reads
/// directly rather than through a received `PublicationImage` (spec §4.4
/// step 6: "matching runs against ipcPublications or networkPublications
/// respectively").
pub struct LocalLink {
    pub publication_kind: PublicationKind,
    pub publication_handle: Handle,
    pub subscriber_position: Counter,
}

pub struct SubscriptionLink {
    pub registration_id: i64,
    pub kind: SubscriptionKind,
    pub stream_id: i32,
    pub session_id_filter: Option<i32>,
    pub is_reliable: bool,
    pub is_rejoin: bool,
    pub is_sparse: bool,
    /// `None` until resolved by the group-inferable rule (spec §9 open
    /// question: "first transport's multicast-ness", fixed at creation).
    pub is_group: Option<bool>,
    pub client_id: i64,
    pub client_handle: Handle,
    pub channel_endpoint_handle: Option<Handle>,
    pub images: Vec<ImageLink>,
    /// IPC/Spy subscriptions link directly against `ipc_publications` or
    /// `network_publications` rather than a received image (spec §4.4
    /// step 6).
    pub local_links: Vec<LocalLink>,
    /// Canonical channel a Spy subscription is spying on, used to match
    /// it against `network_publications` (spy subscriptions have no
    /// `channel_endpoint_handle` of their own).
    pub spy_channel: Option<String>,
    /// Set for subscriptions that anchor a Multi-Destination Subscription
    /// (spec §4.6); child destinations are separate `SubscriptionLink`
    /// entries that reference this one.
    pub supports_mds: bool,
    released: bool,
}

impl SubscriptionLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration_id: i64,
        kind: SubscriptionKind,
        stream_id: i32,
        session_id_filter: Option<i32>,
        is_reliable: bool,
        is_rejoin: bool,
        is_sparse: bool,
        client_id: i64,
        client_handle: Handle,
    ) -> Self {
        Self {
            registration_id,
            kind,
            stream_id,
            session_id_filter,
            is_reliable,
            is_rejoin,
            is_sparse,
            is_group: None,
            client_id,
            client_handle,
            channel_endpoint_handle: None,
            images: Vec::new(),
            local_links: Vec::new(),
            spy_channel: None,
            supports_mds: false,
            released: false,
        }
    }

    /// True if `(stream_id, session_id)` matches this subscription's
    /// filter (spec §4.4 step 5: "for each image matching (endpoint,
    /// stream_id, [session_id])").
    pub fn matches(&self, stream_id: i32, session_id: i32) -> bool {
        self.stream_id == stream_id
            && self
                .session_id_filter
                .map(|filter| filter == session_id)
                .unwrap_or(true)
    }

    pub fn link_image(&mut self, image_handle: Handle, subscriber_position: Counter) {
        self.images.push(ImageLink {
            image_handle,
            subscriber_position,
        });
    }

    pub fn unlink_image(&mut self, image_handle: Handle) -> Option<ImageLink> {
        let index = self.images.iter().position(|link| link.image_handle == image_handle)?;
        Some(self.images.remove(index))
    }

    pub fn link_local(&mut self, publication_kind: PublicationKind, publication_handle: Handle, subscriber_position: Counter) {
        self.local_links.push(LocalLink {
            publication_kind,
            publication_handle,
            subscriber_position,
        });
    }

    pub fn unlink_local(&mut self, publication_kind: PublicationKind, publication_handle: Handle) -> Option<LocalLink> {
        let index = self
            .local_links
            .iter()
            .position(|link| link.publication_kind == publication_kind && link.publication_handle == publication_handle)?;
        Some(self.local_links.remove(index))
    }

    pub fn release(&mut self) {
        self.released = true;
    }
}

impl ManagedResource for SubscriptionLink {
    fn on_time_event(&mut self, _now_ns: u64, _now_ms: u64) {}

    fn has_reached_end_of_life(&self) -> bool {
        self.released
    }

    fn free(&mut self) -> Result<(), Error> {
        self.images.clear();
        self.local_links.clear();
        Ok(())
    }
}
