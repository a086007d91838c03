//! `CounterLink` (spec §3): a client-owned named counter, released when
//! its owning client disappears or issues an explicit `RemoveCounter`.

use crate::counters::Counter;
use crate::error::Error;
use crate::registry::ManagedResource;

pub struct CounterLink {
    pub registration_id: i64,
    pub client_id: i64,
    pub counter: Counter,
    released: bool,
}

impl CounterLink {
    pub fn new(registration_id: i64, client_id: i64, counter: Counter) -> Self {
        Self {
            registration_id,
            client_id,
            counter,
            released: false,
        }
    }

    pub fn release(&mut self) {
        self.released = true;
    }
}

impl ManagedResource for CounterLink {
    fn on_time_event(&mut self, _now_ns: u64, _now_ms: u64) {}

    fn has_reached_end_of_life(&self) -> bool {
        self.released
    }

    fn free(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
