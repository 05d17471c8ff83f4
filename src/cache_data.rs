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
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::broadcast;

use crate::config::Equality;
use crate::config::UpdaterRef;
use crate::errors::ConfigError;
use crate::event_stream::CacheEvent;
use crate::event_stream::EventSource;
use crate::store::Store;
use crate::updater::Updater;
use crate::Backing;
use crate::TypeConfig;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) all_gets: u64,
}

/// Tracks a Backing read of a key from the moment it is queued until it settles.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReadFence {
    /// Backing reads of the key not yet settled.
    readers: usize,

    /// The generation of the last write or delete of the key.
    touched: u64,
}

/// The result of routing a key to an Updater.
pub(crate) struct Assigned<C: TypeConfig> {
    /// The Updater was not registered before.
    pub(crate) registered: bool,

    /// The previous Updater of the key lost its last key; shut it down once the lock is released.
    pub(crate) retired: Option<Arc<Updater<C>>>,
}

/// Everything the cache mutates, guarded by one lock.
///
/// The lock is never held across an `.await`, and no Updater schedule lock is taken while
/// holding it.
pub(crate) struct CacheData<C: TypeConfig> {
    pub(crate) store: Box<dyn Store<C::Value>>,

    /// key -> Updater id
    pub(crate) routes: BTreeMap<String, String>,

    pub(crate) updaters: BTreeMap<String, Arc<Updater<C>>>,

    pub(crate) default_updater: Option<String>,

    /// Bumped by every write or delete of any key.
    generation: u64,

    /// Keys with a Backing read in flight. A key is here only while a read is outstanding.
    pub(crate) read_fences: BTreeMap<String, ReadFence>,

    pub(crate) backing: Option<Arc<Backing<C>>>,

    pub(crate) counters: Counters,

    pub(crate) events: broadcast::Sender<CacheEvent<C::Value>>,
}

impl<C> CacheData<C>
where
    C: TypeConfig,
{
    pub(crate) fn new(
        store: Box<dyn Store<C::Value>>,
        events: broadcast::Sender<CacheEvent<C::Value>>,
    ) -> Self {
        CacheData {
            store,
            routes: BTreeMap::new(),
            updaters: BTreeMap::new(),
            default_updater: None,
            generation: 0,
            read_fences: BTreeMap::new(),
            backing: None,
            counters: Counters::default(),
            events,
        }
    }

    /// Register `updater`. Returns `true` if it was not registered before.
    pub(crate) fn register(&mut self, updater: &Arc<Updater<C>>) -> Result<bool, ConfigError> {
        if updater.is_shutdown() {
            return Err(ConfigError::UpdaterShutDown(updater.id().to_string()));
        }

        match self.updaters.get(updater.id()) {
            Some(existing) if Arc::ptr_eq(existing, updater) => Ok(false),
            Some(_) => Err(ConfigError::DuplicateUpdater(updater.id().to_string())),
            None => {
                self.updaters
                    .insert(updater.id().to_string(), updater.clone());
                Ok(true)
            }
        }
    }

    pub(crate) fn resolve(&self, r: UpdaterRef<C>) -> Result<Arc<Updater<C>>, ConfigError> {
        match r {
            UpdaterRef::Handle(u) => Ok(u),
            UpdaterRef::Id(id) => self
                .updaters
                .get(&id)
                .cloned()
                .ok_or(ConfigError::UnknownUpdater(id)),
        }
    }

    /// Route `key` to `updater`, releasing the Updater it was routed to before.
    pub(crate) fn assign(
        &mut self,
        key: &str,
        updater: &Arc<Updater<C>>,
    ) -> Result<Assigned<C>, ConfigError> {
        let registered = self.register(updater)?;

        if self.routes.get(key).map(|id| id.as_str()) == Some(updater.id()) {
            return Ok(Assigned {
                registered,
                retired: None,
            });
        }

        let retired = self.unroute(key);

        self.routes
            .insert(key.to_string(), updater.id().to_string());
        updater.retain();

        Ok(Assigned {
            registered,
            retired,
        })
    }

    /// Forget the Updater of `key`. Returns it if it lost its last key and is not the default.
    pub(crate) fn unroute(&mut self, key: &str) -> Option<Arc<Updater<C>>> {
        let id = self.routes.remove(key)?;
        self.release(&id)
    }

    fn release(&mut self, id: &str) -> Option<Arc<Updater<C>>> {
        let updater = self.updaters.get(id)?.clone();

        let left = updater.release();
        if left > 0 || self.default_updater.as_deref() == Some(id) {
            return None;
        }

        self.updaters.remove(id);
        Some(updater)
    }

    pub(crate) fn updater_for_key(&self, key: &str) -> Option<Arc<Updater<C>>> {
        let id = self.routes.get(key)?;
        self.updaters.get(id).cloned()
    }

    pub(crate) fn default_updater(&mut self) -> Option<Arc<Updater<C>>> {
        let id = self.default_updater.as_ref()?;

        match self.updaters.get(id) {
            Some(u) => Some(u.clone()),
            None => {
                warn!("default Updater({}) is no longer registered; unset it", id);
                self.default_updater = None;
                None
            }
        }
    }

    /// Record a write or delete of `key`, so that a Backing read in flight does not overwrite it.
    pub(crate) fn touch(&mut self, key: &str) {
        self.generation += 1;
        if let Some(f) = self.read_fences.get_mut(key) {
            f.touched = self.generation;
        }
    }

    /// Record a write or delete of every key with a Backing read in flight.
    pub(crate) fn touch_all(&mut self) {
        self.generation += 1;
        for f in self.read_fences.values_mut() {
            f.touched = self.generation;
        }
    }

    /// A Backing read of `key` is queued. Returns the generation to pass to
    /// [`Self::close_read_fence`].
    pub(crate) fn open_read_fence(&mut self, key: &str) -> u64 {
        self.read_fences.entry(key.to_string()).or_default().readers += 1;
        self.generation
    }

    /// A Backing read of `key` opened at generation `opened` settled.
    ///
    /// Returns `true` if the key was neither written nor deleted since, i.e., the value read
    /// may be put into the store.
    pub(crate) fn close_read_fence(&mut self, key: &str, opened: u64) -> bool {
        let Some(f) = self.read_fences.get_mut(key) else {
            return true;
        };

        let untouched = f.touched <= opened;

        f.readers -= 1;
        if f.readers == 0 {
            self.read_fences.remove(key);
        }
        untouched
    }

    /// Write `key` and publish `New`, or `Change` if the value differs from the one it replaces.
    ///
    /// Returns the replaced value.
    pub(crate) fn publish_write(
        &mut self,
        key: &str,
        value: C::Value,
        ttl: Option<Duration>,
        source: EventSource,
        updater: Option<&str>,
        equality: Option<&Equality<C::Value>>,
    ) -> Option<C::Value> {
        let prev = self.store.get(key);
        self.store.set(key, value.clone(), ttl);
        self.touch(key);

        let updater = updater.map(|s| s.to_string());

        match &prev {
            None => self.emit(CacheEvent::New {
                key: key.to_string(),
                value,
                source,
                updater,
            }),
            Some(old) => {
                let same = match equality {
                    Some(eq) => eq(key, &value, old),
                    None => value == *old,
                };
                if !same {
                    self.emit(CacheEvent::Change {
                        key: key.to_string(),
                        value,
                        source,
                        updater,
                    });
                }
            }
        }

        prev
    }

    pub(crate) fn emit(&self, event: CacheEvent<C::Value>) {
        // No subscriber is not an error.
        self.events.send(event).ok();
    }
}
