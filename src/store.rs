// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// The bounded TTL key-value store the cache keeps its values in.
///
/// All methods are synchronous. The cache calls them with its data lock held.
///
/// The store reports every removal it makes, for whatever reason, by sending the removed
/// key to the sender installed with [`Store::set_eviction_sender`]. The cache handles its own
/// deletes without waiting for their notifications, so the store need not tell them apart
/// from passive evictions.
pub trait Store<V>: Send + 'static {
    /// Return the live value of `key`. An expired entry is treated as absent.
    fn get(&mut self, key: &str) -> Option<V>;

    /// Insert or replace `key`. `ttl` of `None` means the entry never expires.
    fn set(&mut self, key: &str, value: V, ttl: Option<Duration>);

    /// Remove `key` and return the removed value, if it was present.
    fn delete(&mut self, key: &str) -> Option<V>;

    /// The number of live entries.
    fn size(&mut self) -> usize;

    /// Drop every entry without sending eviction notifications.
    fn clear(&mut self);

    /// Remove every expired entry, notifying each one.
    fn purge_expired(&mut self);

    fn set_eviction_sender(&mut self, tx: mpsc::UnboundedSender<String>);
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,

    /// Write order, used to pick the victim when the store is full.
    written: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// The default in-memory [`Store`].
///
/// Expiry is lazy: an expired entry is removed when it is next looked up, or by
/// [`Store::purge_expired`]. When `capacity` is reached, the least recently written entry is
/// evicted to make room.
pub struct TtlStore<V> {
    entries: HashMap<String, Entry<V>>,
    capacity: Option<usize>,
    write_seq: u64,
    eviction_tx: Option<mpsc::UnboundedSender<String>>,
}

impl<V> Default for TtlStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for TtlStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TtlStore")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<V> TtlStore<V> {
    pub fn new() -> Self {
        TtlStore {
            entries: HashMap::new(),
            capacity: None,
            write_seq: 0,
            eviction_tx: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        TtlStore {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    fn notify(&self, key: &str) {
        if let Some(tx) = &self.eviction_tx {
            // The receiver is gone only after the cache is closed.
            tx.send(key.to_string()).ok();
        }
    }

    fn remove_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .entries
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false);

        if expired {
            self.entries.remove(key);
            self.notify(key);
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.written)
            .map(|(k, _)| k.clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.notify(&key);
        }
    }
}

impl<V> Store<V> for TtlStore<V>
where
    V: Clone + Send + 'static,
{
    fn get(&mut self, key: &str) -> Option<V> {
        self.remove_expired(key, Instant::now());
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn set(&mut self, key: &str, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        self.remove_expired(key, now);

        if let Some(capacity) = self.capacity {
            if !self.entries.contains_key(key) && self.entries.len() >= capacity {
                self.purge_expired();
            }
            while !self.entries.contains_key(key) && self.entries.len() >= capacity.max(1) {
                self.evict_oldest();
            }
        }

        self.write_seq += 1;
        self.entries.insert(key.to_string(), Entry {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
            written: self.write_seq,
        });
    }

    fn delete(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();
        let entry = self.entries.remove(key)?;

        // An expired entry was already gone for readers, but it is still a removal.
        self.notify(key);

        if entry.is_expired(now) {
            None
        } else {
            Some(entry.value)
        }
    }

    fn size(&mut self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();

        for key in expired {
            self.entries.remove(&key);
            self.notify(&key);
        }
    }

    fn set_eviction_sender(&mut self, tx: mpsc::UnboundedSender<String>) {
        self.eviction_tx = Some(tx);
    }
}
