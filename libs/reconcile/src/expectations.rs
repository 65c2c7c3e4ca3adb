//! Expectations ledger.
//!
//! Records "I issued N creates / these M deletes and have not observed them
//! yet" per controller key. A controller consults
//! [`Expectations::satisfied`] before mutating anything: while a key has
//! outstanding expectations, the informer cache is known to lag behind the
//! controller's own writes and acting on it would double-create or
//! double-delete.
//!
//! Expectations must be armed *before* issuing the corresponding API calls,
//! otherwise the watch event can race ahead of the counter.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::DEFAULT_EXPECTATIONS_TTL;

#[derive(Debug, Clone)]
struct Record {
    add: i64,
    del: i64,
    /// Keys of the objects whose deletion is awaited.
    pending_deletes: HashSet<String>,
    armed_at: Instant,
}

impl Record {
    fn new(add: i64, del: i64) -> Self {
        Self {
            add,
            del,
            pending_deletes: HashSet::new(),
            armed_at: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.add <= 0 && self.del <= 0
    }
}

/// Snapshot of the outstanding counters for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub add: i64,
    pub del: i64,
}

/// Per-key create/delete expectations with deletion-key tracking and expiry.
#[derive(Debug)]
pub struct Expectations {
    ttl: Duration,
    records: DashMap<String, Record>,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTATIONS_TTL)
    }
}

impl Expectations {
    /// Create a ledger whose entries are trusted for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: DashMap::new(),
        }
    }

    /// Returns true when the controller may act on `key`.
    ///
    /// A key with no record, a fulfilled record, or an expired record is
    /// satisfied.
    pub fn satisfied(&self, key: &str) -> bool {
        let Some(record) = self.records.get(key) else {
            return true;
        };

        if record.fulfilled() {
            debug!(key, "Expectations fulfilled");
            return true;
        }

        if record.armed_at.elapsed() > self.ttl {
            warn!(
                key,
                add = record.add,
                del = record.del,
                "Expectations expired, assuming lost watch events"
            );
            return true;
        }

        debug!(
            key,
            add = record.add,
            del = record.del,
            "Controller still waiting on expectations"
        );
        false
    }

    /// Replace the expectations for `key`.
    pub fn set(&self, key: &str, add: i64, del: i64) {
        self.records.insert(key.to_string(), Record::new(add, del));
    }

    /// Expect `count` creations for `key`.
    pub fn expect_creations(&self, key: &str, count: usize) {
        self.set(key, count as i64, 0);
    }

    /// Expect the deletion of each object in `deleted_keys`.
    pub fn expect_deletions(&self, key: &str, deleted_keys: &[String]) {
        if let Some(existing) = self.records.get(key) {
            if !existing.pending_deletes.is_empty() {
                warn!(
                    key,
                    pending = existing.pending_deletes.len(),
                    "Clobbering existing delete keys"
                );
            }
        }

        let mut record = Record::new(0, deleted_keys.len() as i64);
        record.pending_deletes = deleted_keys.iter().cloned().collect();
        self.records.insert(key.to_string(), record);
    }

    /// Record that one expected creation was observed (or abandoned).
    pub fn creation_observed(&self, key: &str) {
        self.lower(key, 1, 0);
    }

    /// Record that `deleted_key` was observed deleted (or abandoned).
    ///
    /// Each tracked key is only counted once, so the informer path and an
    /// explicit abandonment can both report it safely.
    pub fn deletion_observed(&self, key: &str, deleted_key: &str) {
        let tracked = self
            .records
            .get_mut(key)
            .map(|mut record| record.pending_deletes.remove(deleted_key))
            .unwrap_or(false);
        if tracked {
            self.lower(key, 0, 1);
        }
    }

    /// Increase the outstanding counters for `key`.
    pub fn raise(&self, key: &str, add: i64, del: i64) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.add += add;
            record.del += del;
        }
    }

    fn lower(&self, key: &str, add: i64, del: i64) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.add -= add;
            record.del -= del;
            debug!(key, add = record.add, del = record.del, "Lowered expectations");
        }
    }

    /// Forget everything about `key`.
    pub fn delete(&self, key: &str) {
        self.records.remove(key);
    }

    /// Outstanding counters for `key`, if any are recorded.
    pub fn pending(&self, key: &str) -> Option<Pending> {
        self.records.get(key).map(|r| Pending {
            add: r.add,
            del: r.del,
        })
    }
}
