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

use std::fmt;
use std::sync::atomic;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use log::info;
use log::warn;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::cache_data::CacheData;
use crate::config::next_id;
use crate::config::Equality;
use crate::config::UpdaterRef;
use crate::errors::CacheError;
use crate::errors::ConfigError;
use crate::event_stream::CacheEvent;
use crate::event_stream::EventSource;
use crate::eviction_watcher::EvictionWatcher;
use crate::store::Store;
use crate::store::TtlStore;
use crate::updater::Updater;
use crate::Backing;
use crate::BackingConfig;
use crate::BackingStore;
use crate::CacheConfig;
use crate::GetOptions;
use crate::Prefer;
use crate::Refresh;
use crate::SetOptions;
use crate::Stats;
use crate::TypeConfig;
use crate::UpdaterConfig;

/// The state shared by a [`Cache`], its Updaters, its Backing and the eviction watcher.
///
/// Updaters and the Backing hold it weakly; a running refresh cycle holds it strongly through
/// its [`Delegate`](crate::Delegate).
pub(crate) struct CacheInner<C: TypeConfig> {
    /// The name for this cache instance, for debugging.
    pub(crate) name: String,

    /// A process-wide unique identifier for the cache. Used for debugging purposes.
    pub(crate) uniq: u64,

    pub(crate) config: CacheConfig,

    pub(crate) data: Mutex<CacheData<C>>,

    /// Refresh cycles started, across all Updaters.
    pub(crate) update_calls: AtomicU64,
}

impl<C> fmt::Display for CacheInner<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Cache({})[uniq={}]", self.name, self.uniq)
    }
}

impl<C> CacheInner<C>
where
    C: TypeConfig,
{
    /// Store a value supplied by a refresh callback.
    ///
    /// The key is routed to the Updater that supplied it, and the value is forwarded to the
    /// Backing.
    pub(crate) fn write_from_updater(
        &self,
        key: &str,
        value: C::Value,
        ttl: Option<Duration>,
        updater_id: &str,
        equality: Option<&Equality<C::Value>>,
    ) {
        let ttl = ttl.or(self.config.default_ttl);

        let (retired, backing) = {
            let mut d = self.data.lock();

            let mut retired = None;
            if let Some(u) = d.updaters.get(updater_id).cloned() {
                match d.assign(key, &u) {
                    Ok(a) => retired = a.retired,
                    Err(e) => warn!("{}: can not route {} to Updater: {}", self, key, e),
                }
            }

            d.publish_write(
                key,
                value.clone(),
                ttl,
                EventSource::Updater,
                Some(updater_id),
                equality,
            );

            (retired, d.backing.clone())
        };

        if let Some(u) = retired {
            u.shutdown();
        }

        if let Some(b) = backing {
            b.write(key, value);
        }
    }

    /// The internal delete path.
    ///
    /// If `key` has an Updater and the request did not come from that Updater, the delete is
    /// handed to it: once its delete request settles, the key is evicted if it is still routed
    /// there. Otherwise the key is evicted right away, before this method returns.
    ///
    /// The returned future resolves when the Updater and the Backing, if any, are done.
    pub(crate) fn delete_key(
        self: &Arc<Self>,
        key: &str,
        source: EventSource,
        requester: Option<&str>,
    ) -> BoxFuture<'static, Result<(), CacheError>> {
        let owner = self.data.lock().updater_for_key(key);

        if let Some(u) = owner {
            let own_delete = source == EventSource::Updater && requester == Some(u.id());

            if !own_delete {
                if self.config.debug {
                    debug!("{}: delete {} through {}", self, key, u);
                }

                let fu = u.remove_data(key);
                let inner = self.clone();
                let key = key.to_string();

                return async move {
                    fu.await?;

                    let still_routed = {
                        let d = inner.data.lock();
                        d.routes.get(&key).map(|id| id.as_str()) == Some(u.id())
                    };

                    if still_routed {
                        inner
                            .evict_explicitly(&key, EventSource::Updater, Some(u.id()))
                            .await?;
                    }
                    Ok(())
                }
                .boxed();
            }
        }

        self.evict_explicitly(key, source, requester)
    }

    /// Remove `key` from the store as an intentional delete.
    ///
    /// Clears its routing, publishes `Del` even if the key was absent and hands the delete to
    /// the Backing. All of this happens before the method returns; the future only waits for
    /// the Backing.
    ///
    /// This is the only path that publishes `Del` or deletes from the Backing. The store's
    /// eviction notification for the removal needs no further handling.
    fn evict_explicitly(
        &self,
        key: &str,
        source: EventSource,
        updater: Option<&str>,
    ) -> BoxFuture<'static, Result<(), CacheError>> {
        let (retired, backing_fu) = {
            let mut d = self.data.lock();

            let retired = d.unroute(key);

            d.store.delete(key);
            d.touch(key);

            d.emit(CacheEvent::Del {
                key: key.to_string(),
                source,
                updater: updater.map(|s| s.to_string()),
            });

            let backing_fu = d.backing.as_ref().map(|b| b.delete(key));
            (retired, backing_fu)
        };

        if self.config.debug {
            debug!("{}: deleted {} by {}", self, key, source);
        }

        if let Some(u) = retired {
            u.shutdown();
        }

        match backing_fu {
            Some(fu) => fu.boxed(),
            None => futures::future::ready(Ok(())).boxed(),
        }
    }

    /// Undo a caller write the Updater failed to persist, unless it was overwritten since.
    fn rollback(
        &self,
        key: &str,
        written: &C::Value,
        prev: Option<C::Value>,
        ttl: Option<Duration>,
        updater_id: &str,
    ) {
        let mut d = self.data.lock();

        if d.store.get(key).as_ref() != Some(written) {
            if self.config.debug {
                debug!("{}: {} was overwritten, no rollback", self, key);
            }
            return;
        }

        if prev.as_ref() == Some(written) {
            return;
        }

        match prev {
            Some(prev) => {
                d.store.set(key, prev.clone(), ttl);
                d.touch(key);
                d.emit(CacheEvent::Change {
                    key: key.to_string(),
                    value: prev,
                    source: EventSource::Rollback,
                    updater: Some(updater_id.to_string()),
                });
            }
            None => {
                d.store.delete(key);
                d.touch(key);
                d.emit(CacheEvent::Del {
                    key: key.to_string(),
                    source: EventSource::Rollback,
                    updater: Some(updater_id.to_string()),
                });
            }
        }

        warn!(
            "{}: rolled back {} because Updater({}) failed to persist it",
            self, key, updater_id
        );
    }
}

/// A read-through, write-through cache in front of Updaters and an optional Backing.
///
/// Values live in a TTL [`Store`]. A miss is served by the Backing or by the key's Updater
/// (or the default Updater); a write lands in the store at once and is then persisted by the
/// key's Updater and forwarded to the Backing.
pub struct Cache<C: TypeConfig> {
    inner: Arc<CacheInner<C>>,

    /// The sender to cancel the background eviction watcher.
    ///
    /// When this sender is dropped, the corresponding receiver becomes ready,
    /// which signals the background task to terminate gracefully.
    #[allow(dead_code)]
    watcher_cancel_tx: oneshot::Sender<()>,
}

impl<C> fmt::Display for Cache<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl<C> Cache<C>
where
    C: TypeConfig,
{
    /// Create a cache over the default [`TtlStore`].
    ///
    /// It spawns the eviction watcher with [`TypeConfig::spawn`], so it must be called where
    /// spawning is possible, e.g., inside a tokio runtime for tokio-based configs.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Self::with_store(config, TtlStore::<C::Value>::new())
    }

    /// Create a cache over a caller supplied [`Store`].
    ///
    /// The watcher quits when this instance is dropped.
    pub fn with_store(
        config: CacheConfig,
        mut store: impl Store<C::Value>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (evict_tx, evict_rx) = mpsc::unbounded_channel::<String>();
        store.set_eviction_sender(evict_tx);

        let (events, _) = broadcast::channel(config.event_capacity);

        static UNIQ: atomic::AtomicU64 = atomic::AtomicU64::new(0);
        let uniq = UNIQ.fetch_add(1, atomic::Ordering::SeqCst);

        let inner = Arc::new(CacheInner {
            name: config.name.clone(),
            uniq,
            data: Mutex::new(CacheData::new(Box::new(store), events)),
            update_calls: AtomicU64::new(0),
            config,
        });

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let watcher_name = format!("{}-eviction-watcher", inner);
        let watcher = EvictionWatcher {
            cache: Arc::downgrade(&inner),
            sweep_interval: inner.config.sweep_interval,
            debug: inner.config.debug,
            name: watcher_name.clone(),
        };

        let fu = watcher.main(UnboundedReceiverStream::new(evict_rx), cancel_rx.map(|_| ()));
        C::spawn(fu, watcher_name);

        info!("{}: created", inner);

        Ok(Cache {
            inner,
            watcher_cancel_tx: cancel_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Create an Updater that belongs to this cache.
    ///
    /// It is registered by [`Cache::add_updater`] or when a key is first routed to it.
    pub fn new_updater(
        &self,
        refresh: impl Refresh<C>,
        config: UpdaterConfig<C::Value>,
    ) -> Result<Arc<Updater<C>>, ConfigError> {
        config.validate()?;

        let id = config.id.clone().unwrap_or_else(|| next_id("updater"));

        Ok(Updater::new(
            id,
            config,
            self.inner.config.default_throttle,
            Arc::new(refresh),
            Arc::downgrade(&self.inner),
            self.inner.config.debug,
        ))
    }

    fn check_owner(&self, updater: &Arc<Updater<C>>) -> Result<(), ConfigError> {
        if updater.belongs_to(&self.inner) {
            Ok(())
        } else {
            Err(ConfigError::ForeignUpdater(updater.id().to_string()))
        }
    }

    /// Register `updater` without routing any key to it. Its interval timer starts.
    pub fn add_updater(&self, updater: &Arc<Updater<C>>) -> Result<(), ConfigError> {
        self.check_owner(updater)?;

        let registered = self.inner.data.lock().register(updater)?;
        if registered {
            info!("{}: added {}", self, updater);
            updater.start_interval();
        }
        Ok(())
    }

    /// Make a registered Updater serve misses of keys that have no Updater.
    pub fn set_default_updater(&self, id: &str) -> Result<(), ConfigError> {
        let mut d = self.inner.data.lock();
        if !d.updaters.contains_key(id) {
            return Err(ConfigError::UnknownUpdater(id.to_string()));
        }
        d.default_updater = Some(id.to_string());
        Ok(())
    }

    pub fn updater(&self, id: &str) -> Option<Arc<Updater<C>>> {
        self.inner.data.lock().updaters.get(id).cloned()
    }

    pub fn updater_for_key(&self, key: &str) -> Option<Arc<Updater<C>>> {
        self.inner.data.lock().updater_for_key(key)
    }

    pub fn default_updater(&self) -> Option<Arc<Updater<C>>> {
        self.inner.data.lock().default_updater()
    }

    /// Attach the Backing. There can be only one.
    ///
    /// `on_connect` is called first and the values it supplies seed the store.
    pub async fn set_backing(
        &self,
        adapter: impl BackingStore<C>,
        config: BackingConfig,
    ) -> Result<Arc<Backing<C>>, ConfigError> {
        config.validate()?;

        let attached = self.backing().map(|b| b.id().to_string());
        if let Some(id) = attached {
            return Err(ConfigError::BackingAttached(id));
        }

        let id = config.id.clone().unwrap_or_else(|| next_id("backing"));
        let backing = Backing::new(
            id,
            Arc::new(adapter),
            config.wr_throttle,
            config.rd_throttle,
            config.dl_throttle,
            config.default_ttl,
            Arc::downgrade(&self.inner),
            self.inner.config.debug,
        );

        backing.connect().await;

        {
            let mut d = self.inner.data.lock();
            if let Some(b) = &d.backing {
                return Err(ConfigError::BackingAttached(b.id().to_string()));
            }
            d.backing = Some(backing.clone());
        }

        info!("{}: attached {}", self, backing);
        Ok(backing)
    }

    pub fn backing(&self) -> Option<Arc<Backing<C>>> {
        self.inner.data.lock().backing.clone()
    }

    /// Get the value of `key`, preferring the Backing on a miss.
    pub async fn get_data(&self, key: &str) -> Result<Option<C::Value>, CacheError> {
        self.get_data_with(key, GetOptions::default()).await
    }

    /// Get the value of `key`.
    ///
    /// A value in the store is returned at once. On a miss:
    ///
    /// - With a Backing and [`Prefer::Backing`], the Backing is read first. If that fails, the
    ///   key's Updater (or the default Updater) is asked.
    /// - Otherwise the Updater is asked first, and the Backing is read if the Updater fails.
    ///
    /// It resolves to `None` when no source has the key, and fails only when an Updater
    /// failed and there was no Backing to recover from, or both failed.
    pub async fn get_data_with(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<Option<C::Value>, CacheError> {
        let (updater, backing) = {
            let mut d = self.inner.data.lock();
            d.counters.all_gets += 1;

            if let Some(v) = d.store.get(key) {
                d.counters.hits += 1;
                return Ok(Some(v));
            }

            let updater = d.updater_for_key(key).or_else(|| d.default_updater());
            (updater, d.backing.clone())
        };

        if self.inner.config.debug {
            debug!(
                "{}: miss {}: updater={:?} backing={:?} prefer={:?}",
                self,
                key,
                updater.as_ref().map(|u| u.id().to_string()),
                backing.as_ref().map(|b| b.id().to_string()),
                opts.prefer
            );
        }

        let res = match (updater, backing, opts.prefer) {
            (None, None, _) => Ok(None),
            (None, Some(b), _) => self.backing_only(&b, key).await,
            (Some(u), Some(b), Prefer::Backing) => match b.read(key).await {
                Ok(v) => {
                    if self.inner.config.update_after_misses {
                        u.ask_for_opportunistic_read(key);
                    }
                    Ok(Some(v))
                }
                Err(_) => self.read_through(&u, key).await,
            },
            (Some(u), backing, _) => match self.read_through(&u, key).await {
                Ok(v) => Ok(v),
                Err(updater_err) => match backing {
                    Some(b) => {
                        debug!(
                            "{}: {} failed to read {}: {}; falling back to {}",
                            self, u, key, updater_err, b
                        );
                        b.read(key).await.map(Some)
                    }
                    None => Err(updater_err),
                },
            },
        };

        if let Ok(Some(_)) = &res {
            self.inner.data.lock().counters.misses += 1;
        }
        res
    }

    /// Read `key` from the Backing when no Updater could serve it.
    ///
    /// A Backing failure is not an error here: with nobody else to ask, the key is absent.
    async fn backing_only(
        &self,
        backing: &Arc<Backing<C>>,
        key: &str,
    ) -> Result<Option<C::Value>, CacheError> {
        match backing.read(key).await {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                if self.inner.config.debug {
                    debug!("{}: {} has no {}: {}", self, backing, key, e);
                }
                Ok(None)
            }
        }
    }

    async fn read_through(
        &self,
        updater: &Arc<Updater<C>>,
        key: &str,
    ) -> Result<Option<C::Value>, CacheError> {
        updater.get_data(key).await?;
        let v = self.inner.data.lock().store.get(key);
        Ok(v)
    }

    /// Write `key` with default options.
    pub async fn set_data(&self, key: &str, value: C::Value) -> Result<(), CacheError> {
        self.set_data_with(key, value, SetOptions::default()).await
    }

    /// Write `key`.
    ///
    /// The store is updated before this method first suspends, so a following `get_data`
    /// sees the value even while the Updater is still persisting it. If the key has an
    /// Updater, this resolves when the Updater has persisted the write; if it fails, the
    /// previous value is restored and the Updater's error is returned. The write is forwarded
    /// to the Backing unless `no_backing` is set.
    pub async fn set_data_with(
        &self,
        key: &str,
        value: C::Value,
        opts: SetOptions<C>,
    ) -> Result<(), CacheError> {
        let SetOptions {
            ttl,
            updater,
            no_backing,
        } = opts;

        if let Some(UpdaterRef::Handle(u)) = &updater {
            self.check_owner(u)?;
        }

        let ttl = ttl.or(self.inner.config.default_ttl);

        let (updater, assigned, prev, backing) = {
            let mut d = self.inner.data.lock();

            let (updater, assigned) = match updater {
                Some(r) => {
                    let u = d.resolve(r)?;
                    let a = d.assign(key, &u)?;
                    (Some(u), Some(a))
                }
                None => (d.updater_for_key(key), None),
            };

            let equality = updater.as_ref().and_then(|u| u.equality());
            let prev = d.publish_write(
                key,
                value.clone(),
                ttl,
                EventSource::Caller,
                None,
                equality,
            );

            (updater, assigned, prev, d.backing.clone())
        };

        if let Some(a) = assigned {
            if let Some(retired) = a.retired {
                retired.shutdown();
            }
            if a.registered {
                if let Some(u) = &updater {
                    u.start_interval();
                }
            }
        }

        let backing = if no_backing { None } else { backing };

        let Some(u) = updater else {
            if let Some(b) = backing {
                b.write(key, value);
            }
            return Ok(());
        };

        match u.set_data(key).await {
            Ok(()) => {
                if let Some(b) = backing {
                    b.write(key, value);
                }
                Ok(())
            }
            Err(e) => {
                self.inner.rollback(key, &value, prev, ttl, u.id());
                Err(e.context(format!("{}: set_data({})", self, key)))
            }
        }
    }

    /// Delete `key` from the cache, its Updater and the Backing.
    pub async fn remove_data(&self, key: &str) -> Result<(), CacheError> {
        self.inner
            .delete_key(key, EventSource::Caller, None)
            .await
    }

    /// Drop `key` from the store only, then ask its Updater to refresh it.
    pub fn invalidate_key(&self, key: &str) {
        let updater = {
            let mut d = self.inner.data.lock();
            d.store.delete(key);
            d.touch(key);
            d.updater_for_key(key)
        };

        if let Some(u) = updater {
            u.ask_for_opportunistic_read(key);
        }
    }

    /// Force a refresh cycle of the Updater `id`, or of every registered Updater.
    pub async fn run_updaters(&self, id: Option<&str>) -> Result<(), CacheError> {
        let updaters = {
            let d = self.inner.data.lock();
            match id {
                Some(id) => match d.updaters.get(id) {
                    Some(u) => vec![u.clone()],
                    None => return Err(CacheError::UnknownUpdater(id.to_string())),
                },
                None => d.updaters.values().cloned().collect::<Vec<_>>(),
            }
        };

        if updaters.is_empty() {
            return Err(CacheError::NoUpdaters);
        }

        futures::future::try_join_all(updaters.iter().map(|u| u.update())).await?;
        Ok(())
    }

    /// Drop every value and every route, and shut down every Updater but the default one.
    ///
    /// The default Updater stays registered; its timers are cancelled and its queued requests
    /// fail. The Backing is not touched.
    pub fn clear(&self) {
        let (retired, default) = {
            let mut d = self.inner.data.lock();

            d.store.clear();
            d.routes.clear();
            d.touch_all();

            let default_id = d.default_updater.clone();
            let mut retired = vec![];
            let mut default = None;

            for (id, u) in std::mem::take(&mut d.updaters) {
                if Some(&id) == default_id.as_ref() {
                    default = Some(u);
                } else {
                    retired.push(u);
                }
            }

            if let Some(u) = &default {
                u.reset_refs();
                d.updaters.insert(u.id().to_string(), u.clone());
            }

            (retired, default)
        };

        info!("{}: cleared, shutting down {} Updaters", self, retired.len());

        for u in retired {
            u.shutdown();
        }

        if let Some(u) = default {
            u.reset("cache cleared");
        }
    }

    pub fn stats(&self) -> Stats {
        let mut d = self.inner.data.lock();
        Stats {
            hits: d.counters.hits,
            misses: d.counters.misses,
            all_gets: d.counters.all_gets,
            update_calls: self.inner.update_calls.load(atomic::Ordering::SeqCst),
            cache_size: d.store.size(),
            num_updaters: d.updaters.len(),
        }
    }

    /// Receive `new`, `change` and `del` events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent<C::Value>> {
        self.inner.data.lock().events.subscribe()
    }

    /// Shut down every Updater, disconnect the Backing and stop the eviction watcher.
    pub async fn close(self) {
        let (updaters, backing) = {
            let mut d = self.inner.data.lock();
            d.routes.clear();
            d.default_updater = None;
            (std::mem::take(&mut d.updaters), d.backing.take())
        };

        for u in updaters.values() {
            u.shutdown();
        }

        if let Some(b) = backing {
            b.disconnect().await;
        }

        info!("{}: closed", self);
    }
}
