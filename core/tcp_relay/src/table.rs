//! Connection table shared by the egress and ingress workers
//!
//! Workers take an owned snapshot, rewrite on it without holding any lock,
//! then hand the result back through [`ConnectionTable::merge_and_store`].
//! The stored copy carries a version (`last_update`); a worker whose snapshot
//! went stale merges against the newer copy instead of overwriting it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::DEFAULT_MERGE_RETRIES;
use crate::state::{AckBounds, ConnectionKey, ConnectionState, Direction};

/// Result of handing a rewritten state back to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Stored; `retries` counts version conflicts along the way
    Stored { retries: u32 },
    /// Both sides closed after merging; the entry was removed
    Closed,
    /// The entry was removed concurrently; nothing stored
    Missing,
}

/// Concurrent map from [`ConnectionKey`] to [`ConnectionState`]
pub trait ConnectionTable: Send + Sync {
    /// Snapshot the entry for `key`, creating a fresh one if absent.
    ///
    /// Returns the snapshot and whether this call created it.
    fn get_or_create(&self, key: ConnectionKey, now: Instant) -> (ConnectionState, bool);

    fn snapshot(&self, key: &ConnectionKey) -> Option<ConnectionState>;

    /// Remove the entry; returns false if it was already gone
    fn remove(&self, key: &ConnectionKey) -> bool;

    /// Store `after`, which was derived from the snapshot `before`
    fn merge_and_store(
        &self,
        key: &ConnectionKey,
        before: &ConnectionState,
        after: ConnectionState,
        direction: Direction,
        bounds: AckBounds,
    ) -> MergeOutcome;

    /// Refresh `last_seen` without touching anything else
    fn touch(&self, key: &ConnectionKey, now: Instant);

    /// Remove entries idle for longer than `max_idle`
    fn evict_idle(&self, now: Instant, max_idle: Duration) -> Vec<ConnectionKey>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutex-guarded [`ConnectionTable`]
///
/// Entries are stored behind `Arc` so a snapshot under the lock is a pointer
/// copy; the deep clone happens after the lock is released.
pub struct SharedConnectionTable {
    entries: Mutex<HashMap<ConnectionKey, Arc<ConnectionState>>>,
    merge_retries: u32,
}

impl Default for SharedConnectionTable {
    fn default() -> Self {
        Self::new(DEFAULT_MERGE_RETRIES)
    }
}

impl SharedConnectionTable {
    pub fn new(merge_retries: u32) -> Self {
        SharedConnectionTable {
            entries: Mutex::new(HashMap::new()),
            merge_retries,
        }
    }

    fn current(&self, key: &ConnectionKey) -> Option<Arc<ConnectionState>> {
        self.entries.lock().get(key).cloned()
    }

    /// Build the next stored version from the current stored copy
    fn reconcile(
        stored: &ConnectionState,
        before: &ConnectionState,
        after: &ConnectionState,
        direction: Direction,
        bounds: AckBounds,
    ) -> ConnectionState {
        let mut next = if stored.last_update == before.last_update {
            after.clone()
        } else {
            ConnectionState::merge(stored, after, direction)
        };
        next.last_update = stored.last_update.wrapping_add(1);
        next.prune(direction, bounds);
        next
    }

    fn commit(
        entries: &mut HashMap<ConnectionKey, Arc<ConnectionState>>,
        key: &ConnectionKey,
        next: ConnectionState,
        retries: u32,
    ) -> MergeOutcome {
        if next.is_closed() {
            entries.remove(key);
            MergeOutcome::Closed
        } else {
            entries.insert(*key, Arc::new(next));
            MergeOutcome::Stored { retries }
        }
    }
}

impl ConnectionTable for SharedConnectionTable {
    fn get_or_create(&self, key: ConnectionKey, now: Instant) -> (ConnectionState, bool) {
        let mut entries = self.entries.lock();
        if let Some(state) = entries.get(&key) {
            let state = Arc::clone(state);
            drop(entries);
            return ((*state).clone(), false);
        }

        let state = ConnectionState::new(now);
        entries.insert(key, Arc::new(state.clone()));
        (state, true)
    }

    fn snapshot(&self, key: &ConnectionKey) -> Option<ConnectionState> {
        self.current(key).map(|state| (*state).clone())
    }

    fn remove(&self, key: &ConnectionKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    fn merge_and_store(
        &self,
        key: &ConnectionKey,
        before: &ConnectionState,
        after: ConnectionState,
        direction: Direction,
        bounds: AckBounds,
    ) -> MergeOutcome {
        let mut retries = 0;

        loop {
            let Some(observed) = self.current(key) else {
                return MergeOutcome::Missing;
            };
            let next = Self::reconcile(&observed, before, &after, direction, bounds);

            let mut entries = self.entries.lock();
            let stored = match entries.get(key) {
                Some(stored) => Arc::clone(stored),
                None => return MergeOutcome::Missing,
            };

            if stored.last_update == observed.last_update {
                return Self::commit(&mut entries, key, next, retries);
            }

            if retries >= self.merge_retries {
                log::warn!(
                    "[{}] {} merge still contended after {} retries, merging under lock",
                    key,
                    direction,
                    retries
                );
                let next = Self::reconcile(&stored, before, &after, direction, bounds);
                return Self::commit(&mut entries, key, next, retries);
            }

            retries += 1;
        }
    }

    fn touch(&self, key: &ConnectionKey, now: Instant) {
        let mut entries = self.entries.lock();
        if let Some(state) = entries.get_mut(key) {
            if state.last_seen < now {
                Arc::make_mut(state).last_seen = now;
            }
        }
    }

    fn evict_idle(&self, now: Instant, max_idle: Duration) -> Vec<ConnectionKey> {
        let mut evicted = Vec::new();
        self.entries.lock().retain(|key, state| {
            let idle = now.saturating_duration_since(state.last_seen) > max_idle;
            if idle {
                evicted.push(*key);
            }
            !idle
        });

        if !evicted.is_empty() {
            log::debug!("Evicted {} idle connection(s)", evicted.len());
        }
        evicted
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
