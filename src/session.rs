//! Session-id allocation and the active-session uniqueness set
//! (spec §4.8, invariant I1).

use std::collections::HashSet;
use std::ops::RangeInclusive;

use rand::Rng;

/// `(session_id, stream_id, canonical_channel)`, the uniqueness key of a
/// live publication (spec §3 "SessionKey").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: i32,
    pub stream_id: i32,
    pub canonical_channel: String,
}

impl SessionKey {
    pub fn new(session_id: i32, stream_id: i32, canonical_channel: impl Into<String>) -> Self {
        Self {
            session_id,
            stream_id,
            canonical_channel: canonical_channel.into(),
        }
    }
}

/// Allocates session ids via rejection sampling over a reserved range,
/// and tracks the set of live `SessionKey`s (spec §4.8, invariant I1).
pub struct SessionAllocator {
    next_session_id: i32,
    reserved_range: RangeInclusive<i32>,
    active: HashSet<SessionKey>,
}

impl SessionAllocator {
    pub fn new(reserved_range: RangeInclusive<i32>) -> Self {
        Self {
            next_session_id: rand::rng().random(),
            reserved_range,
            active: HashSet::new(),
        }
    }

    /// Picks the next candidate, skipping the reserved range. Does not
    /// consult `active` — callers loop this with `is_active` until a free
    /// key is found (see [`SessionAllocator::allocate`]).
    fn next_candidate(&mut self) -> i32 {
        let mut candidate = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        if self.reserved_range.contains(&candidate) {
            self.next_session_id = self.reserved_range.end().wrapping_add(1);
            candidate = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
        }
        candidate
    }

    /// Allocates a session id for `(stream_id, canonical_channel)` that is
    /// not already present in the active session set, skipping the
    /// reserved range. Terminates in O(1) amortized: the reserved range
    /// and the number of live sessions per stream are both small relative
    /// to the 32-bit space (spec §4.8).
    pub fn allocate(&mut self, stream_id: i32, canonical_channel: &str) -> i32 {
        loop {
            let candidate = self.next_candidate();
            let key = SessionKey::new(candidate, stream_id, canonical_channel);
            if !self.active.contains(&key) {
                return candidate;
            }
        }
    }

    /// Reserves an explicit session id requested by a client. Returns
    /// `false` if it is already in `active_session_set` (spec §4.3 step 4).
    pub fn reserve_explicit(&mut self, key: SessionKey) -> bool {
        if self.active.contains(&key) {
            false
        } else {
            self.active.insert(key);
            true
        }
    }

    pub fn insert(&mut self, key: SessionKey) {
        self.active.insert(key);
    }

    pub fn remove(&mut self, key: &SessionKey) {
        self.active.remove(key);
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.active.contains(key)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_session_never_collides_with_active_set() {
        let mut allocator = SessionAllocator::new(0..=0);
        let channel = "udp://127.0.0.1:40000";
        let first = allocator.allocate(7, channel);
        allocator.insert(SessionKey::new(first, 7, channel));
        let second = allocator.allocate(7, channel);
        assert_ne!(first, second);
    }

    #[test]
    fn allocation_skips_reserved_range() {
        let mut allocator = SessionAllocator::new(0..=1000);
        allocator.next_session_id = 500;
        let id = allocator.allocate(1, "udp://x");
        assert!(!allocator.reserved_range.contains(&id));
        assert_eq!(id, 1001);
    }

    #[test]
    fn explicit_reservation_rejects_duplicates() {
        let mut allocator = SessionAllocator::new(0..=0);
        let key = SessionKey::new(42, 5, "udp://a");
        assert!(allocator.reserve_explicit(key.clone()));
        assert!(!allocator.reserve_explicit(key));
    }
}
