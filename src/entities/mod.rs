//! Conductor-owned entities (spec §3 DATA MODEL).
//!
//! Every entity with a lifecycle implements [`crate::registry::ManagedResource`]
//! so the heartbeat pass (spec §4.7) can walk each registry generically.
//! Entities reference each other only through registry handles, never
//! shared pointers, so there is no possibility of an ownership cycle
//! (spec §9 "cross-references forming cycles").

pub mod channel_endpoint;
pub mod client;
pub mod counter_link;
pub mod ipc_publication;
pub mod network_publication;
pub mod publication_image;
pub mod publication_link;
pub mod subscription_link;

pub use channel_endpoint::{ReceiveChannelEndpoint, SendChannelEndpoint};
pub use client::AeronClient;
pub use counter_link::CounterLink;
pub use ipc_publication::IpcPublication;
pub use network_publication::NetworkPublication;
pub use publication_image::PublicationImage;
pub use publication_link::{PublicationKind, PublicationLink};
pub use subscription_link::{ImageLink, SubscriptionKind, SubscriptionLink};

/// The lifecycle shared by publications and images (spec §3 "Lifecycles").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    Draining,
    Linger,
    Done,
}

impl LifecycleState {
    pub fn is_done(self) -> bool {
        matches!(self, LifecycleState::Done)
    }
}
