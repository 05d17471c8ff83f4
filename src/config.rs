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
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::updater::Updater;
use crate::TypeConfig;

/// Decides whether a write changed a key: `equality(key, new, old)`.
pub type Equality<V> = Arc<dyn Fn(&str, &V, &V) -> bool + Send + Sync>;

/// Generate a process-wide unique id such as `updater-3`.
pub(crate) fn next_id(kind: &str) -> String {
    static ID: atomic::AtomicU64 = atomic::AtomicU64::new(1);
    let n = ID.fetch_add(1, atomic::Ordering::SeqCst);
    format!("{}-{}", kind, n)
}

fn non_zero(d: Option<Duration>, what: &'static str) -> Result<(), ConfigError> {
    match d {
        Some(d) if d.is_zero() => Err(ConfigError::Zero(what)),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// The name for this cache instance, for debugging.
    pub name: String,

    /// TTL for writes that do not give one. `None` keeps entries until they are removed.
    pub default_ttl: Option<Duration>,

    /// The throttle of an Updater that does not configure its own.
    pub default_throttle: Duration,

    /// After a miss served by the Backing, also ask the key's Updater for an opportunistic refresh.
    pub update_after_misses: bool,

    /// Emit per-operation `debug!` records.
    pub debug: bool,

    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,

    /// How often the store is asked to purge expired entries. `None` relies on lazy expiry.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: "cache".to_string(),
            default_ttl: None,
            default_throttle: Duration::from_millis(2000),
            update_after_misses: false,
            debug: false,
            event_capacity: 1024,
            sweep_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl CacheConfig {
    pub fn new(name: impl ToString) -> Self {
        CacheConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_default_throttle(mut self, throttle: Duration) -> Self {
        self.default_throttle = throttle;
        self
    }

    pub fn with_update_after_misses(mut self, yes: bool) -> Self {
        self.update_after_misses = yes;
        self
    }

    pub fn with_debug(mut self, yes: bool) -> Self {
        self.debug = yes;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.default_ttl, "default_ttl")?;
        non_zero(Some(self.default_throttle), "default_throttle")?;
        non_zero(self.sweep_interval, "sweep_interval")?;
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero("event_capacity"));
        }
        Ok(())
    }
}

pub struct UpdaterConfig<V> {
    /// Explicit identity. A unique one is generated if not given.
    pub id: Option<String>,

    /// Minimum spacing between two refresh cycles. Falls back to the cache's default throttle.
    pub throttle: Option<Duration>,

    /// Run a heartbeat cycle this long after the previous one, even with nothing queued.
    pub interval: Option<Duration>,

    pub equality: Option<Equality<V>>,
}

impl<V> Default for UpdaterConfig<V> {
    fn default() -> Self {
        UpdaterConfig {
            id: None,
            throttle: None,
            interval: None,
            equality: None,
        }
    }
}

impl<V> Clone for UpdaterConfig<V> {
    fn clone(&self) -> Self {
        UpdaterConfig {
            id: self.id.clone(),
            throttle: self.throttle,
            interval: self.interval,
            equality: self.equality.clone(),
        }
    }
}

impl<V> fmt::Debug for UpdaterConfig<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UpdaterConfig")
            .field("id", &self.id)
            .field("throttle", &self.throttle)
            .field("interval", &self.interval)
            .field("equality", &self.equality.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl<V> UpdaterConfig<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl ToString) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_equality(
        mut self,
        equality: impl Fn(&str, &V, &V) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.equality = Some(Arc::new(equality));
        self
    }

    /// Check the durations; `interval` must exceed an explicitly given `throttle`.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.throttle, "throttle")?;
        non_zero(self.interval, "interval")?;

        if let (Some(interval), Some(throttle)) = (self.interval, self.throttle) {
            if interval <= throttle {
                return Err(ConfigError::IntervalNotGreaterThanThrottle { interval, throttle });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackingConfig {
    pub id: Option<String>,

    /// At most one write flush per window.
    pub wr_throttle: Option<Duration>,

    /// At most one read flush per window.
    pub rd_throttle: Option<Duration>,

    /// At most one delete flush per window.
    pub dl_throttle: Option<Duration>,

    /// TTL of values restored from the Backing. Falls back to the cache's default TTL.
    pub default_ttl: Option<Duration>,
}

impl BackingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl ToString) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_wr_throttle(mut self, d: Duration) -> Self {
        self.wr_throttle = Some(d);
        self
    }

    pub fn with_rd_throttle(mut self, d: Duration) -> Self {
        self.rd_throttle = Some(d);
        self
    }

    pub fn with_dl_throttle(mut self, d: Duration) -> Self {
        self.dl_throttle = Some(d);
        self
    }

    pub fn with_default_ttl(mut self, d: Duration) -> Self {
        self.default_ttl = Some(d);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.wr_throttle, "wr_throttle")?;
        non_zero(self.rd_throttle, "rd_throttle")?;
        non_zero(self.dl_throttle, "dl_throttle")?;
        non_zero(self.default_ttl, "default_ttl")?;
        Ok(())
    }
}

/// Which source a miss consults first when both an Updater and a Backing can serve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prefer {
    #[default]
    Backing,
    Updater,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub prefer: Prefer,
}

impl GetOptions {
    pub fn prefer(prefer: Prefer) -> Self {
        GetOptions { prefer }
    }
}

/// The Updater to route a key to: a handle, or the id of a registered Updater.
pub enum UpdaterRef<C: TypeConfig> {
    Handle(Arc<Updater<C>>),
    Id(String),
}

impl<C> Clone for UpdaterRef<C>
where
    C: TypeConfig,
{
    fn clone(&self) -> Self {
        match self {
            UpdaterRef::Handle(u) => UpdaterRef::Handle(u.clone()),
            UpdaterRef::Id(id) => UpdaterRef::Id(id.clone()),
        }
    }
}

impl<C> fmt::Debug for UpdaterRef<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpdaterRef::Handle(u) => write!(f, "Handle({})", u.id()),
            UpdaterRef::Id(id) => write!(f, "Id({})", id),
        }
    }
}

impl<C> From<Arc<Updater<C>>> for UpdaterRef<C>
where
    C: TypeConfig,
{
    fn from(u: Arc<Updater<C>>) -> Self {
        UpdaterRef::Handle(u)
    }
}

impl<C> From<&Arc<Updater<C>>> for UpdaterRef<C>
where
    C: TypeConfig,
{
    fn from(u: &Arc<Updater<C>>) -> Self {
        UpdaterRef::Handle(u.clone())
    }
}

pub struct SetOptions<C: TypeConfig> {
    /// TTL of this write. Falls back to the cache's default TTL.
    pub ttl: Option<Duration>,

    /// Route the key to this Updater, replacing any previous one.
    pub updater: Option<UpdaterRef<C>>,

    /// Do not forward the write to the Backing.
    pub no_backing: bool,
}

impl<C> Default for SetOptions<C>
where
    C: TypeConfig,
{
    fn default() -> Self {
        SetOptions {
            ttl: None,
            updater: None,
            no_backing: false,
        }
    }
}

impl<C> Clone for SetOptions<C>
where
    C: TypeConfig,
{
    fn clone(&self) -> Self {
        SetOptions {
            ttl: self.ttl,
            updater: self.updater.clone(),
            no_backing: self.no_backing,
        }
    }
}

impl<C> fmt::Debug for SetOptions<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SetOptions")
            .field("ttl", &self.ttl)
            .field("updater", &self.updater)
            .field("no_backing", &self.no_backing)
            .finish()
    }
}

impl<C> SetOptions<C>
where
    C: TypeConfig,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_updater(mut self, updater: impl Into<UpdaterRef<C>>) -> Self {
        self.updater = Some(updater.into());
        self
    }

    pub fn with_updater_id(mut self, id: impl ToString) -> Self {
        self.updater = Some(UpdaterRef::Id(id.to_string()));
        self
    }

    pub fn without_backing(mut self) -> Self {
        self.no_backing = true;
        self
    }
}
