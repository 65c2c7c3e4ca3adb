//! Per-key exponential backoff.
//!
//! Used to avoid hot-looping the recreation of workloads that keep failing
//! on the same node. Entries that have not been touched for twice the
//! ceiling are considered expired and are removed by [`Backoff::gc`].

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::{DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX};

#[derive(Debug, Clone, Copy)]
struct Entry {
    backoff: Duration,
    last_update: Instant,
}

/// Exponential backoff tracker keyed by string id.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    entries: DashMap<String, Entry>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            entries: DashMap::new(),
        }
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_update) > self.max * 2
    }

    /// Current delay for `id`, or zero if untracked.
    pub fn get(&self, id: &str) -> Duration {
        self.entries
            .get(id)
            .map(|e| e.backoff)
            .unwrap_or(Duration::ZERO)
    }

    /// Advance the backoff for `id` as of `now` and return the new delay.
    ///
    /// The first call (or the first call after expiry) yields the initial
    /// delay; each subsequent call doubles it up to the ceiling.
    pub fn next(&self, id: &str, now: Instant) -> Duration {
        let mut entry = self.entries.entry(id.to_string()).or_insert(Entry {
            backoff: Duration::ZERO,
            last_update: now,
        });

        let next = if entry.backoff.is_zero() || self.expired(&entry, now) {
            self.initial
        } else {
            (entry.backoff * 2).min(self.max)
        };
        entry.backoff = next;
        entry.last_update = now;
        next
    }

    /// Returns true if `event_time` falls inside the current backoff window
    /// for `id`.
    pub fn is_in_backoff_since_update(&self, id: &str, event_time: Instant) -> bool {
        let Some(entry) = self.entries.get(id) else {
            return false;
        };
        if self.expired(&entry, event_time) {
            return false;
        }
        event_time.saturating_duration_since(entry.last_update) < entry.backoff
    }

    /// Time left in the backoff window for `id` as of `now`.
    pub fn remaining(&self, id: &str, now: Instant) -> Duration {
        self.entries
            .get(id)
            .map(|e| {
                e.backoff
                    .saturating_sub(now.saturating_duration_since(e.last_update))
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Forget `id` (on success).
    pub fn reset(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Remove expired entries.
    pub fn gc(&self, now: Instant) {
        self.entries.retain(|_, e| !self.expired(e, now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
