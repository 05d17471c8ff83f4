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

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::SystemTime;

use log::debug;
use log::error;
use log::info;
use parking_lot::Mutex;

use crate::cache::CacheInner;
use crate::errors::BackingError;
use crate::errors::CacheError;
use crate::timer::Timer;
use crate::token::Token;
use crate::token::TokenFuture;
use crate::BackingStore;
use crate::TypeConfig;

/// A value waiting to be persisted, with the wall-clock time it was submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite<V> {
    pub value: V,
    pub last: SystemTime,
}

/// Collects the values a [`BackingStore`] supplies during `read` or `on_connect`.
///
/// The collected values are written into the cache's store when the callback returns.
pub struct StoreHandle<C: TypeConfig> {
    pairs: BTreeMap<String, C::Value>,
}

impl<C> Default for StoreHandle<C>
where
    C: TypeConfig,
{
    fn default() -> Self {
        StoreHandle {
            pairs: BTreeMap::new(),
        }
    }
}

impl<C> StoreHandle<C>
where
    C: TypeConfig,
{
    pub fn set(&mut self, key: impl ToString, value: C::Value) {
        self.pairs.insert(key.to_string(), value);
    }

    /// A value supplied earlier through this handle.
    pub fn get(&self, key: &str) -> Option<&C::Value> {
        self.pairs.get(key)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub(crate) fn into_pairs(self) -> BTreeMap<String, C::Value> {
        self.pairs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Write,
    Read,
    Delete,
}

struct Lanes<C: TypeConfig> {
    writes: BTreeMap<String, PendingWrite<C::Value>>,

    /// Keys queued for the next read flush.
    read_queue: BTreeSet<String>,

    /// Everyone waiting on a read, queued or in flight, with the read fence generation taken
    /// when the read was queued.
    read_waiters: BTreeMap<String, (Token<C::Value>, u64)>,

    delete_queue: BTreeSet<String>,
    delete_waiters: BTreeMap<String, Token<()>>,

    write_window: Option<Timer>,
    read_window: Option<Timer>,
    delete_window: Option<Timer>,
}

impl<C> Lanes<C>
where
    C: TypeConfig,
{
    fn window(&mut self, lane: Lane) -> &mut Option<Timer> {
        match lane {
            Lane::Write => &mut self.write_window,
            Lane::Read => &mut self.read_window,
            Lane::Delete => &mut self.delete_window,
        }
    }

    fn has_queued(&self, lane: Lane) -> bool {
        match lane {
            Lane::Write => !self.writes.is_empty(),
            Lane::Read => !self.read_queue.is_empty(),
            Lane::Delete => !self.delete_queue.is_empty(),
        }
    }
}

/// The persistence adapter of a cache, wrapping a [`BackingStore`].
///
/// Writes, reads and deletes have independent queues. With a throttle configured for a kind,
/// at most one batch of that kind is flushed per window; a request arriving when no window is
/// open is flushed at once and opens one.
///
/// Attached with [`Cache::set_backing`](crate::Cache::set_backing).
pub struct Backing<C: TypeConfig> {
    id: String,
    adapter: Arc<dyn BackingStore<C>>,

    wr_throttle: Option<Duration>,
    rd_throttle: Option<Duration>,
    dl_throttle: Option<Duration>,

    /// TTL of the values this Backing restores into the store.
    ttl: Option<Duration>,

    cache: Weak<CacheInner<C>>,
    this: Weak<Backing<C>>,
    debug: bool,

    lanes: Mutex<Lanes<C>>,
}

impl<C> fmt::Display for Backing<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Backing({})", self.id)
    }
}

impl<C> Backing<C>
where
    C: TypeConfig,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        adapter: Arc<dyn BackingStore<C>>,
        wr_throttle: Option<Duration>,
        rd_throttle: Option<Duration>,
        dl_throttle: Option<Duration>,
        ttl: Option<Duration>,
        cache: Weak<CacheInner<C>>,
        debug: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Backing {
            id,
            adapter,
            wr_throttle,
            rd_throttle,
            dl_throttle,
            ttl,
            cache,
            this: this.clone(),
            debug,
            lanes: Mutex::new(Lanes {
                writes: BTreeMap::new(),
                read_queue: BTreeSet::new(),
                read_waiters: BTreeMap::new(),
                delete_queue: BTreeSet::new(),
                delete_waiters: BTreeMap::new(),
                write_window: None,
                read_window: None,
                delete_window: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn throttle(&self, lane: Lane) -> Option<Duration> {
        match lane {
            Lane::Write => self.wr_throttle,
            Lane::Read => self.rd_throttle,
            Lane::Delete => self.dl_throttle,
        }
    }

    /// Queue `value` to be persisted. Failures are logged, never returned.
    pub(crate) fn write(&self, key: &str, value: C::Value) {
        let mut lanes = self.lanes.lock();
        lanes.writes.insert(key.to_string(), PendingWrite {
            value,
            last: SystemTime::now(),
        });
        self.submitted(&mut lanes, Lane::Write);
    }

    /// Restore `key`. Concurrent reads of a key share one future until it settles.
    ///
    /// If `key` is written or deleted in the cache before the read settles, the value read is
    /// discarded and the read settles with what the store holds instead.
    pub(crate) fn read(&self, key: &str) -> TokenFuture<C::Value> {
        // The cache data lock must not be taken while holding the lanes lock.
        let cache = self.cache.upgrade();
        let opened = cache.as_ref().map(|c| c.data.lock().open_read_fence(key));

        let (fu, joined) = {
            let mut lanes = self.lanes.lock();

            match lanes.read_waiters.get(key) {
                Some((t, _)) => (t.future(), true),
                None => {
                    let token = Token::new();
                    let fu = token.future();
                    lanes
                        .read_waiters
                        .insert(key.to_string(), (token, opened.unwrap_or_default()));
                    lanes.read_queue.insert(key.to_string());

                    self.submitted(&mut lanes, Lane::Read);
                    (fu, false)
                }
            }
        };

        // The read already queued holds its own fence.
        if joined {
            if let (Some(cache), Some(opened)) = (&cache, opened) {
                cache.data.lock().close_read_fence(key, opened);
            }
        }
        fu
    }

    /// Delete `key` from the durable store. A write of `key` still queued is dropped.
    pub(crate) fn delete(&self, key: &str) -> TokenFuture<()> {
        let mut lanes = self.lanes.lock();

        lanes.writes.remove(key);

        if let Some(t) = lanes.delete_waiters.get(key) {
            return t.future();
        }

        let token = Token::new();
        let fu = token.future();
        lanes.delete_waiters.insert(key.to_string(), token);
        lanes.delete_queue.insert(key.to_string());

        self.submitted(&mut lanes, Lane::Delete);
        fu
    }

    fn submitted(&self, lanes: &mut Lanes<C>, lane: Lane) {
        if lanes.window(lane).is_some() {
            return;
        }

        self.flush(lanes, lane);
        self.open_window(lanes, lane);
    }

    fn open_window(&self, lanes: &mut Lanes<C>, lane: Lane) {
        let Some(after) = self.throttle(lane) else {
            return;
        };

        let this = self.this.clone();
        let timer = Timer::arm::<C, _>(format!("{}-{:?}-window", self, lane), after, move |id| {
            if let Some(b) = this.upgrade() {
                b.on_window(lane, id);
            }
        });
        *lanes.window(lane) = Some(timer);
    }

    fn on_window(&self, lane: Lane, timer_id: u64) {
        let mut lanes = self.lanes.lock();

        let current = lanes.window(lane).as_ref().map(|t| t.id());
        if current != Some(timer_id) {
            return;
        }
        *lanes.window(lane) = None;

        if lanes.has_queued(lane) {
            self.flush(&mut lanes, lane);
            self.open_window(&mut lanes, lane);
        }
    }

    /// Hand everything queued in `lane` to a background task.
    fn flush(&self, lanes: &mut Lanes<C>, lane: Lane) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let name = format!("{}-flush-{:?}", self, lane);

        match lane {
            Lane::Write => {
                let batch = std::mem::take(&mut lanes.writes);
                if batch.is_empty() {
                    return;
                }
                C::spawn(this.flush_writes(batch), name);
            }
            Lane::Read => {
                let keys = std::mem::take(&mut lanes.read_queue);
                if keys.is_empty() {
                    return;
                }
                C::spawn(this.flush_reads(keys.into_iter().collect()), name);
            }
            Lane::Delete => {
                let keys = std::mem::take(&mut lanes.delete_queue);
                if keys.is_empty() {
                    return;
                }
                C::spawn(this.flush_deletes(keys.into_iter().collect()), name);
            }
        }
    }

    async fn flush_writes(self: Arc<Self>, batch: BTreeMap<String, PendingWrite<C::Value>>) {
        let n = batch.len();
        if self.debug {
            debug!("{}: flush {} writes", self, n);
        }

        if let Err(e) = self.adapter.write(batch).await {
            let e = e.context(format!("{}: flushing {} writes", self, n));
            error!("{}", e);
        }
    }

    async fn flush_reads(self: Arc<Self>, keys: Vec<String>) {
        if self.debug {
            debug!("{}: flush reads: {:?}", self, keys);
        }

        let mut handle = StoreHandle::<C>::default();
        let res = self.adapter.read(keys.clone(), &mut handle).await;
        let res = res.map_err(|e| e.context(format!("{}: reading {:?}", self, keys)));

        let pairs = match res {
            Ok(()) => handle.into_pairs(),
            Err(_) => BTreeMap::new(),
        };

        let waiters = {
            let mut lanes = self.lanes.lock();

            let mut waiters = keys
                .iter()
                .filter_map(|k| lanes.read_waiters.remove(k).map(|w| (k.clone(), w)))
                .collect::<Vec<_>>();

            // Supplied keys that were queued for the next flush need not wait for it.
            for key in pairs.keys() {
                if lanes.read_queue.remove(key) {
                    if let Some(w) = lanes.read_waiters.remove(key) {
                        waiters.push((key.clone(), w));
                    }
                }
            }
            waiters
        };

        let settled = self.restore_read(&res, &pairs, waiters);

        for (token, settlement) in settled {
            match settlement {
                Ok(v) => token.resolve(v),
                Err(e) => token.reject(CacheError::Backing(e)),
            }
        }
    }

    /// Put the values of a read flush into the store and decide what each waiter gets.
    ///
    /// A key written or deleted in the cache since its read was queued keeps its current
    /// state, and the waiter gets that instead. A supplied key nobody waits on is only stored
    /// if the store does not have it.
    #[allow(clippy::type_complexity)]
    fn restore_read(
        &self,
        res: &Result<(), BackingError>,
        pairs: &BTreeMap<String, C::Value>,
        waiters: Vec<(String, (Token<C::Value>, u64))>,
    ) -> Vec<(Token<C::Value>, Result<C::Value, BackingError>)> {
        let failed = |key: &str| match res {
            Ok(()) => BackingError::not_found(key).context(self),
            Err(e) => e.clone(),
        };

        let Some(cache) = self.cache.upgrade() else {
            return waiters
                .into_iter()
                .map(|(key, (token, _))| {
                    let v = pairs.get(&key).cloned().ok_or_else(|| failed(&key));
                    (token, v)
                })
                .collect();
        };

        let ttl = self.ttl.or(cache.config.default_ttl);
        let mut data = cache.data.lock();

        let mut settled = Vec::with_capacity(waiters.len());
        let mut waited = BTreeSet::new();

        for (key, (token, opened)) in waiters {
            let untouched = data.close_read_fence(&key, opened);

            let v = if untouched {
                match pairs.get(&key) {
                    Some(v) => {
                        data.store.set(&key, v.clone(), ttl);
                        Ok(v.clone())
                    }
                    None => Err(failed(&key)),
                }
            } else {
                if self.debug {
                    debug!("{}: {} changed while being read, keep the cache's", self, key);
                }
                data.store.get(&key).ok_or_else(|| failed(&key))
            };

            settled.push((token, v));
            waited.insert(key);
        }

        for (key, value) in pairs {
            if waited.contains(key) || data.read_fences.contains_key(key) {
                continue;
            }
            if data.store.get(key).is_none() {
                data.store.set(key, value.clone(), ttl);
            }
        }

        settled
    }

    async fn flush_deletes(self: Arc<Self>, keys: Vec<String>) {
        if self.debug {
            debug!("{}: flush deletes: {:?}", self, keys);
        }

        let res = self.adapter.delete(keys.clone()).await;
        let res = res.map_err(|e| e.context(format!("{}: deleting {:?}", self, keys)));

        if let Err(e) = &res {
            error!("{}", e);
        }

        let mut lanes = self.lanes.lock();
        for key in &keys {
            if let Some(token) = lanes.delete_waiters.remove(key) {
                match &res {
                    Ok(()) => token.resolve(()),
                    Err(e) => token.reject(CacheError::Backing(e.clone())),
                }
            }
        }
    }

    /// Write the values `on_connect` supplied into the cache's store, without publishing events.
    fn seed(&self, pairs: &BTreeMap<String, C::Value>) {
        if pairs.is_empty() {
            return;
        }
        let Some(cache) = self.cache.upgrade() else {
            return;
        };

        let ttl = self.ttl.or(cache.config.default_ttl);
        let mut data = cache.data.lock();
        for (key, value) in pairs {
            data.store.set(key, value.clone(), ttl);
        }
    }

    /// Call `on_connect` and seed the store with whatever it supplies.
    ///
    /// A failing `on_connect` is logged; the Backing is usable regardless.
    pub(crate) async fn connect(&self) {
        let mut handle = StoreHandle::<C>::default();

        match self.adapter.on_connect(&mut handle).await {
            Ok(()) => {
                info!("{}: connected, seeding {} values", self, handle.len());
                self.seed(&handle.into_pairs());
            }
            Err(e) => {
                error!("{}", e.context(format!("{}: connecting", self)));
            }
        }
    }

    /// Close the windows, persist writes still queued, fail queued reads and deletes, then call
    /// `on_disconnect`.
    pub(crate) async fn disconnect(&self) {
        let (writes, reads, deletes) = {
            let mut lanes = self.lanes.lock();
            lanes.write_window = None;
            lanes.read_window = None;
            lanes.delete_window = None;

            let writes = std::mem::take(&mut lanes.writes);

            let read_queue = std::mem::take(&mut lanes.read_queue);
            let reads = read_queue
                .into_iter()
                .filter_map(|k| lanes.read_waiters.remove(&k).map(|w| (k, w)))
                .collect::<Vec<_>>();

            let delete_queue = std::mem::take(&mut lanes.delete_queue);
            let deletes = delete_queue
                .iter()
                .filter_map(|k| lanes.delete_waiters.remove(k))
                .collect::<Vec<_>>();

            (writes, reads, deletes)
        };

        if let Some(cache) = self.cache.upgrade() {
            let mut data = cache.data.lock();
            for (key, (_, opened)) in &reads {
                data.close_read_fence(key, *opened);
            }
        }

        let closed = CacheError::Closed(format!("{} disconnected", self));
        for (_, (t, _)) in reads {
            t.reject(closed.clone());
        }
        for t in deletes {
            t.reject(closed.clone());
        }

        if !writes.is_empty() {
            let n = writes.len();
            if let Err(e) = self.adapter.write(writes).await {
                error!("{}", e.context(format!("{}: flushing {} writes on disconnect", self, n)));
            }
        }

        self.adapter.on_disconnect().await;
        info!("{}: disconnected", self);
    }
}
