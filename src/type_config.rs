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
use std::fmt;
use std::future::Future;

use crate::backing::PendingWrite;
use crate::backing::StoreHandle;
use crate::delegate::Delegate;
use crate::errors::BackingError;
use crate::errors::UpdaterError;

pub trait TypeConfig
where
    Self: fmt::Debug,
    Self: Default,
    Self: Send + Sync + 'static,
{
    /// The type of values that are cached.
    ///
    /// `PartialEq` is the default change-detection policy for `new`/`change` events,
    /// unless an Updater supplies its own comparator.
    type Value: fmt::Debug + Clone + PartialEq + Send + Sync + 'static;

    /// Spawn a future that will run in the background.
    ///
    /// `name` is used for debugging purposes, it can be any string that identifies the future.
    ///
    /// Refresh cycles, throttle and interval timers, Backing flushes and the eviction watcher
    /// are all started through this method.
    fn spawn<F>(future: F, name: impl ToString)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}

/// The refresh function wrapped by an [`Updater`](crate::Updater).
///
/// Each invocation receives the batch of requests queued since the previous cycle.
/// The callback reports per-key outcomes through the [`Delegate`]; any request it leaves
/// unsettled is failed when `refresh` returns.
#[async_trait::async_trait]
pub trait Refresh<C: TypeConfig>: Send + Sync + 'static {
    /// Read, write or delete the requested keys against the external system.
    ///
    /// Returning `Err` fails every request still outstanding in `delegate`.
    /// A panic is handled the same way and additionally throttles the next cycle.
    async fn refresh(&self, delegate: &mut Delegate<C>) -> Result<(), UpdaterError>;

    /// Called once when the Updater is shut down.
    fn on_shutdown(&self) {}
}

/// The durable store behind a [`Backing`](crate::Backing).
///
/// Every method receives a whole batch: requests accumulated during one throttle window.
#[async_trait::async_trait]
pub trait BackingStore<C: TypeConfig>: Send + Sync + 'static {
    /// Persist every pending write.
    ///
    /// A failure fails the whole batch; it is logged, never reported to the writers.
    async fn write(&self, pending: BTreeMap<String, PendingWrite<C::Value>>)
        -> Result<(), BackingError>;

    /// Restore `keys`, supplying each found value through `handle.set()`.
    ///
    /// Requested keys that are not supplied fail with "not found".
    async fn read(&self, keys: Vec<String>, handle: &mut StoreHandle<C>)
        -> Result<(), BackingError>;

    /// Delete `keys` from the durable store.
    async fn delete(&self, keys: Vec<String>) -> Result<(), BackingError>;

    /// Called once when the Backing is attached. Values set on `handle` seed the cache.
    async fn on_connect(&self, _handle: &mut StoreHandle<C>) -> Result<(), BackingError> {
        Ok(())
    }

    /// Called when the cache is closed.
    async fn on_disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use crate::testing::types::TestConfig;
    use crate::TypeConfig;

    #[tokio::test]
    async fn test_spawn_runs_future() {
        let (tx, rx) = tokio::sync::oneshot::channel::<u8>();
        TestConfig::spawn(
            async move {
                tx.send(1).ok();
            },
            "test",
        );
        assert_eq!(rx.await, Ok(1));
    }
}
