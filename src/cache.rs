//! Bounded per-key history of fetched payloads
//!
//! One collector fetches an expensive status page and `put`s it here; several dependent
//! collectors read it back at their own pace with [`SnapshotCache::gather_since`], each one
//! remembering the timestamp of the newest entry it consumed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::util::lock;

pub const DEFAULT_CAPACITY: usize = 3;

pub type SharedCache = Arc<SnapshotCache>;

#[derive(Debug)]
pub struct SnapshotCache<T = Value> {
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<(T, DateTime<Utc>)>>>,
}

impl<T: Clone> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Clone> SnapshotCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a snapshot, evicting the oldest one when the key is full
    pub fn put(&self, key: &str, payload: T, stamp: DateTime<Utc>) {
        let mut entries = lock(&self.entries);
        let queue = entries
            .entry(key.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        while queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back((payload, stamp));
    }

    pub fn get_last(&self, key: &str) -> Option<(T, DateTime<Utc>)> {
        lock(&self.entries)
            .get(key)
            .and_then(|queue| queue.back().cloned())
    }

    /// Entries strictly newer than `last_seen`, oldest first
    pub fn gather_since(
        &self,
        key: &str,
        last_seen: Option<DateTime<Utc>>,
    ) -> Vec<(T, DateTime<Utc>)> {
        lock(&self.entries)
            .get(key)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|(_, stamp)| last_seen.is_none_or(|seen| *stamp > seen))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries)
            .get(key)
            .is_some_and(|queue| !queue.is_empty())
    }

    pub fn len(&self, key: &str) -> usize {
        lock(&self.entries).get(key).map_or(0, VecDeque::len)
    }

    pub fn remove(&self, key: &str) {
        lock(&self.entries).remove(key);
    }
}
