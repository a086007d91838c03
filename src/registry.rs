//! Generic liveness-checked registries (spec §9 "downcasting/virtual
//! dispatch on DriverManagedResource").
//!
//! Every conductor-owned entity with a lifecycle (clients, links,
//! publications, images, counters) implements [`ManagedResource`]. The
//! heartbeat pass (spec §4.7) walks each registry generically over this
//! capability instead of downcasting a trait object, the way the spec's
//! DESIGN NOTES ask for. Stable handles are `slab` keys, resolved through
//! the owning registry — entities never hold shared pointers to each
//! other (spec §9 "cross-references forming cycles").

use slab::Slab;

/// Capability shared by every conductor-owned lifecycle entity.
pub trait ManagedResource {
    /// Called once per heartbeat pass with the current nano/epoch-milli
    /// clock readings. Implementations use this to notice liveness
    /// timeouts, advance Draining -> Linger -> Done transitions, etc.
    fn on_time_event(&mut self, now_ns: u64, now_ms: u64);

    /// True once the resource's terminal state has been reached and it
    /// is safe to call [`ManagedResource::free`].
    fn has_reached_end_of_life(&self) -> bool;

    /// Releases any counters, log-buffer mappings, or file-descriptors
    /// this resource owns. Called exactly once, after
    /// `has_reached_end_of_life` first returns `true`. Returning `Err`
    /// leaves the entity in the registry for a retry on the next tick
    /// (spec §4.7 step 2: "on failure, increment the free-fails counter
    /// and try again next tick").
    fn free(&mut self) -> Result<(), crate::error::Error>;
}

/// A stable-handle registry over a [`ManagedResource`] type.
///
/// Backed by `slab::Slab` so handles remain valid across insertions and
/// removals of other entries, and removal is O(1).
pub struct Registry<T> {
    slab: Slab<T>,
    free_fails: u64,
}

pub type Handle = usize;

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slab: Slab::new(),
            free_fails: 0,
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.slab.insert(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slab.get(handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slab.get_mut(handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if self.slab.contains(handle) {
            Some(self.slab.remove(handle))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slab.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slab.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn free_fails(&self) -> u64 {
        self.free_fails
    }
}

impl<T: ManagedResource> Registry<T> {
    /// Runs one heartbeat pass over every entry (spec §4.7 step 2): call
    /// `on_time_event`, and if the entity has reached end of life, try to
    /// free it and remove it; a failed free is retried next tick.
    pub fn run_heartbeat(&mut self, now_ns: u64, now_ms: u64) {
        self.run_heartbeat_with(now_ns, now_ms, |_| {});
    }

    /// Same as [`Registry::run_heartbeat`], but hands every entry that
    /// was just removed to `on_removed` by value. Callers use this to
    /// release resources the entity itself cannot reach from
    /// [`ManagedResource::free`] — counters must go back through the
    /// owning `CountersManager`, and log files through the owning
    /// `LogFactory`, neither of which a registry entry holds a handle to
    /// (spec §3 invariant 2, §4.3 state "Done: free counters, unmap and
    /// delete log").
    pub fn run_heartbeat_with<F: FnMut(Handle, T)>(&mut self, now_ns: u64, now_ms: u64, mut on_removed: F) {
        let mut to_remove = Vec::new();
        for (handle, entry) in self.slab.iter_mut() {
            entry.on_time_event(now_ns, now_ms);
            if entry.has_reached_end_of_life() {
                match entry.free() {
                    Ok(()) => to_remove.push(handle),
                    Err(err) => {
                        self.free_fails += 1;
                        log::warn!("failed to free resource at handle {handle}: {err}");
                    }
                }
            }
        }
        for handle in to_remove {
            if let Some(entry) = self.remove(handle) {
                on_removed(handle, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        ticks_until_dead: i32,
        freed: bool,
    }

    impl ManagedResource for Counting {
        fn on_time_event(&mut self, _now_ns: u64, _now_ms: u64) {
            self.ticks_until_dead -= 1;
        }
        fn has_reached_end_of_life(&self) -> bool {
            self.ticks_until_dead <= 0
        }
        fn free(&mut self) -> Result<(), crate::error::Error> {
            self.freed = true;
            Ok(())
        }
    }

    #[test]
    fn heartbeat_frees_and_removes_expired_entries() {
        let mut registry: Registry<Counting> = Registry::new();
        let live = registry.insert(Counting {
            ticks_until_dead: 5,
            freed: false,
        });
        let dying = registry.insert(Counting {
            ticks_until_dead: 1,
            freed: false,
        });

        registry.run_heartbeat(0, 0);

        assert!(registry.get(live).is_some());
        assert!(registry.get(dying).is_none());
    }

    #[test]
    fn failed_free_is_retried_next_tick() {
        struct FlakyThenOk {
            attempts: u32,
        }
        impl ManagedResource for FlakyThenOk {
            fn on_time_event(&mut self, _now_ns: u64, _now_ms: u64) {}
            fn has_reached_end_of_life(&self) -> bool {
                true
            }
            fn free(&mut self) -> Result<(), crate::error::Error> {
                self.attempts += 1;
                if self.attempts < 2 {
                    Err(crate::error::Error::InternalInvariantViolation(
                        "not yet".into(),
                    ))
                } else {
                    Ok(())
                }
            }
        }

        let mut registry: Registry<FlakyThenOk> = Registry::new();
        let handle = registry.insert(FlakyThenOk { attempts: 0 });
        registry.run_heartbeat(0, 0);
        assert!(registry.get(handle).is_some());
        assert_eq!(registry.free_fails(), 1);

        registry.run_heartbeat(0, 0);
        assert!(registry.get(handle).is_none());
    }
}
