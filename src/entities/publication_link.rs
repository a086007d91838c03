//! `PublicationLink` (spec §3): a triple `(correlation_id, client,
//! publication)` registering one client's interest in keeping a
//! publication alive. Refcount-like: removing the last link on a
//! publication drains it toward Linger (spec §4.3 "Draining").

use crate::error::Error;
use crate::registry::{Handle, ManagedResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationKind {
    Network,
    Ipc,
}

pub struct PublicationLink {
    pub correlation_id: i64,
    pub client_id: i64,
    pub client_handle: Handle,
    pub publication_kind: PublicationKind,
    pub publication_handle: Handle,
    released: bool,
}

impl PublicationLink {
    pub fn new(
        correlation_id: i64,
        client_id: i64,
        client_handle: Handle,
        publication_kind: PublicationKind,
        publication_handle: Handle,
    ) -> Self {
        Self {
            correlation_id,
            client_id,
            client_handle,
            publication_kind,
            publication_handle,
            released: false,
        }
    }

    pub fn release(&mut self) {
        self.released = true;
    }
}

impl ManagedResource for PublicationLink {
    fn on_time_event(&mut self, _now_ns: u64, _now_ms: u64) {}

    fn has_reached_end_of_life(&self) -> bool {
        self.released
    }

    fn free(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
