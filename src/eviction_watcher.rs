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

use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use log::debug;
use log::info;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;

use crate::cache::CacheInner;
use crate::TypeConfig;

/// Consumes the store's eviction notifications.
///
/// An explicit delete publishes `del` and deletes from the Backing itself, before the store's
/// notification for it arrives. So a notification never needs handling beyond logging: a TTL
/// expiry or a capacity eviction publishes nothing and deletes nothing from the Backing, and
/// the value is simply fetched again on the next miss.
///
/// It also asks the store to purge expired entries every `sweep_interval`.
pub(crate) struct EvictionWatcher<C: TypeConfig> {
    pub(crate) cache: Weak<CacheInner<C>>,

    pub(crate) sweep_interval: Option<Duration>,

    pub(crate) debug: bool,

    /// Contains descriptive information of this watcher.
    pub(crate) name: String,
}

impl<C> EvictionWatcher<C>
where
    C: TypeConfig,
{
    /// Run until `cancel` is ready or the eviction stream ends.
    ///
    /// The stream ends when the store, and with it the sending end, is dropped.
    pub(crate) async fn main(
        self,
        mut evictions: impl Stream<Item = String> + Send + Unpin + 'static,
        cancel: impl Future<Output = ()> + Send + 'static,
    ) {
        let mut c = std::pin::pin!(cancel);
        let mut sweeps = self.sweep_ticks();

        loop {
            futures::select! {
                _ = c.as_mut().fuse() => {
                    info!("{}: canceled by user", self.name);
                    return;
                }

                key = evictions.next().fuse() => {
                    let Some(key) = key else {
                        info!("{}: eviction stream closed", self.name);
                        return;
                    };
                    self.on_eviction(&key);
                }

                _ = sweeps.next().fuse() => {
                    self.sweep();
                }
            }
        }
    }

    fn sweep_ticks(&self) -> BoxStream<'static, ()> {
        match self.sweep_interval {
            Some(every) => {
                let mut interval = tokio::time::interval_at(Instant::now() + every, every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                IntervalStream::new(interval).map(|_| ()).boxed()
            }
            None => futures::stream::pending().boxed(),
        }
    }

    fn on_eviction(&self, key: &str) {
        if self.debug {
            debug!("{}: {} removed from the store", self.name, key);
        }
    }

    fn sweep(&self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        cache.data.lock().store.purge_expired();
    }
}
