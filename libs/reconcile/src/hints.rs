//! Per-key requeue hint stores.
//!
//! Independent stages of one reconcile push values for the same key; the
//! store keeps a single reduced value per key (largest-wins or
//! smallest-wins) until it is popped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// How a newly pushed value is combined with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    /// Keep the larger value.
    Greater,
    /// Keep the smaller value.
    Less,
}

impl Reduce {
    fn replaces<V: PartialOrd>(self, old: &V, new: &V) -> bool {
        match self {
            Reduce::Greater => new > old,
            Reduce::Less => new < old,
        }
    }
}

/// A concurrent map of reduced values.
#[derive(Debug)]
pub struct HintStore<V> {
    reduce: Reduce,
    values: DashMap<String, V>,
}

/// Requeue delays keyed by controller key.
pub type DurationStore = HintStore<Duration>;

/// Points in time keyed by name (e.g. node deadlines).
pub type TimeStore = HintStore<DateTime<Utc>>;

impl<V> HintStore<V>
where
    V: Copy + PartialOrd + Default,
{
    pub fn new(reduce: Reduce) -> Self {
        Self {
            reduce,
            values: DashMap::new(),
        }
    }

    /// Push `value` for `key`, keeping whichever wins the reduction.
    pub fn push(&self, key: &str, value: V) {
        self.values
            .entry(key.to_string())
            .and_modify(|old| {
                if self.reduce.replaces(old, &value) {
                    *old = value;
                }
            })
            .or_insert(value);
    }

    /// Remove and return the value for `key`, or the default when absent.
    pub fn pop(&self, key: &str) -> V {
        self.values.remove(key).map(|(_, v)| v).unwrap_or_default()
    }

    /// Return the value for `key` without removing it.
    pub fn peek(&self, key: &str) -> V {
        self.values.get(key).map(|v| *v).unwrap_or_default()
    }

    /// Like [`HintStore::peek`] but distinguishes "absent".
    pub fn get(&self, key: &str) -> Option<V> {
        self.values.get(key).map(|v| *v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
