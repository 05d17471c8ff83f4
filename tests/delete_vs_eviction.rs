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

//! Delete versus eviction integration test
//!
//! This test validates that intentional deletes and passive evictions are told apart.
//! The key aspects being tested are:
//!
//! 1. **Passive Eviction**: A TTL expiry publishes no `del` and deletes nothing downstream
//! 2. **Caller Delete**: `remove_data` publishes exactly one `del` and deletes from the Backing
//! 3. **Delegated Delete**: A key with an Updater is deleted through it, and the Updater is
//!    retired when it loses its last key
//! 4. **Invalidation**: `invalidate_key` only drops the local copy and refreshes it
//! 5. **Silent Stores**: Deletes behave the same with a store that reports no removals

use std::time::Duration;

use pretty_assertions::assert_eq;
use refresh_cache::event_stream::CacheEvent;
use refresh_cache::event_stream::EventSource;
use refresh_cache::testing::backing::MemoryBacking;
use refresh_cache::testing::types::TestConfig;
use refresh_cache::testing::updater::MapUpdater;
use refresh_cache::testing::util::drain_events;
use refresh_cache::testing::util::settle;
use refresh_cache::testing::util::wait_for;
use refresh_cache::BackingConfig;
use refresh_cache::Cache;
use refresh_cache::CacheConfig;
use refresh_cache::Phase;
use refresh_cache::SetOptions;
use refresh_cache::Store;
use refresh_cache::TtlStore;
use refresh_cache::UpdaterConfig;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// A store that never reports a removal.
#[derive(Default)]
struct SilentStore {
    inner: TtlStore<i64>,
    _evictions: Option<mpsc::UnboundedSender<String>>,
}

impl Store<i64> for SilentStore {
    fn get(&mut self, key: &str) -> Option<i64> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: i64, ttl: Option<Duration>) {
        self.inner.set(key, value, ttl)
    }

    fn delete(&mut self, key: &str) -> Option<i64> {
        self.inner.delete(key)
    }

    fn size(&mut self) -> usize {
        self.inner.size()
    }

    fn clear(&mut self) {
        self.inner.clear()
    }

    fn purge_expired(&mut self) {
        self.inner.purge_expired()
    }

    fn set_eviction_sender(&mut self, tx: mpsc::UnboundedSender<String>) {
        // Held open, never sent on.
        self._evictions = Some(tx);
    }
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_is_not_a_delete() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(
        CacheConfig::new("expiry").with_default_ttl(Duration::from_millis(1000)),
    )?;
    let mb = MemoryBacking::with_data(&[("k", 1)]);
    cache.set_backing(mb.clone(), BackingConfig::new()).await?;
    let mut rx = cache.subscribe();

    assert_eq!(cache.get_data("k").await?, Some(1));
    assert_eq!(cache.stats().cache_size, 1);

    // The sweep purges the expired entry.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.stats().cache_size, 0);

    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(mb.delete_calls(), 0);
    assert_eq!(mb.value("k"), Some(1));

    // Fetched again on the next miss.
    assert_eq!(cache.get_data("k").await?, Some(1));
    assert_eq!(mb.read_calls(), 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_caller_delete_without_updater() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("caller-delete"))?;
    let mb = MemoryBacking::new();
    cache.set_backing(mb.clone(), BackingConfig::new()).await?;

    cache.set_data("k", 1).await?;
    settle().await;
    assert_eq!(mb.value("k"), Some(1));

    let mut rx = cache.subscribe();
    cache.remove_data("k").await?;

    assert_eq!(drain_events(&mut rx), vec![CacheEvent::Del {
        key: "k".to_string(),
        source: EventSource::Caller,
        updater: None,
    }]);
    assert_eq!(cache.stats().cache_size, 0);
    assert_eq!(mb.value("k"), None);

    // An absent key is still deleted downstream.
    cache.remove_data("ghost").await?;
    assert_eq!(drain_events(&mut rx), vec![CacheEvent::Del {
        key: "ghost".to_string(),
        source: EventSource::Caller,
        updater: None,
    }]);
    assert_eq!(mb.delete_calls(), 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_delete_through_updater() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("delegated-delete"))?;
    let mb = MemoryBacking::new();
    cache.set_backing(mb.clone(), BackingConfig::new()).await?;

    let mu = MapUpdater::new();
    let u = cache.new_updater(mu.clone(), UpdaterConfig::new().with_id("u1"))?;

    cache
        .set_data_with("k", 1, SetOptions::new().with_updater(&u))
        .await?;
    settle().await;
    assert_eq!(mu.remote_value("k"), Some(1));
    assert_eq!(mb.value("k"), Some(1));
    assert_eq!(u.ref_count(), 1);

    let mut rx = cache.subscribe();
    cache.remove_data("k").await?;
    settle().await;

    assert_eq!(drain_events(&mut rx), vec![CacheEvent::Del {
        key: "k".to_string(),
        source: EventSource::Updater,
        updater: Some("u1".to_string()),
    }]);

    assert_eq!(mu.remote.lock().deletes, vec!["k".to_string()]);
    assert_eq!(mu.remote_value("k"), None);
    assert_eq!(mb.value("k"), None);

    // Its only key is gone: retired.
    assert_eq!(u.phase(), Phase::Shutdown);
    assert_eq!(mu.remote.lock().shutdowns, 1);
    assert_eq!(cache.stats().num_updaters, 0);
    assert!(cache.updater_for_key("k").is_none());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_default_updater_survives_losing_its_keys() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("default-survives"))?;

    let mu = MapUpdater::with_data(&[("k", 1)]);
    let u = cache.new_updater(mu.clone(), UpdaterConfig::new().with_id("u1"))?;
    cache.add_updater(&u)?;
    cache.set_default_updater("u1")?;

    assert_eq!(cache.get_data("k").await?, Some(1));
    assert_eq!(u.ref_count(), 1);

    cache.remove_data("k").await?;
    settle().await;

    assert_eq!(u.ref_count(), 0);
    assert!(!u.is_shutdown());
    assert_eq!(cache.stats().num_updaters, 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_refreshes_without_del() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("invalidate"))?;

    let mu = MapUpdater::with_data(&[("k", 1)]);
    let u = cache.new_updater(mu.clone(), UpdaterConfig::new().with_id("u1"))?;
    cache.add_updater(&u)?;
    cache.set_default_updater("u1")?;

    assert_eq!(cache.get_data("k").await?, Some(1));

    mu.remote.lock().data.insert("k".to_string(), 2);
    let mut rx = cache.subscribe();

    cache.invalidate_key("k");

    wait_for(|| match mu.runs() {
        2 => Ok(()),
        n => Err(format!("runs: {}", n)),
    })
    .await
    .map_err(anyhow::Error::msg)?;

    assert_eq!(cache.get_data("k").await?, Some(2));

    let events = drain_events(&mut rx);
    assert!(events.iter().all(|e| !e.is_del()), "got: {:?}", events);
    assert_eq!(events, vec![CacheEvent::New {
        key: "k".to_string(),
        value: 2,
        source: EventSource::Updater,
        updater: Some("u1".to_string()),
    }]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_deletes_without_store_notifications() -> anyhow::Result<()> {
    let cache =
        Cache::<TestConfig>::with_store(CacheConfig::new("silent-store"), SilentStore::default())?;
    let mb = MemoryBacking::new();
    cache.set_backing(mb.clone(), BackingConfig::new()).await?;
    let mut rx = cache.subscribe();

    for v in 0..3 {
        cache.set_data("k", v).await?;
        settle().await;
        cache.remove_data("k").await?;
    }

    let dels = drain_events(&mut rx).iter().filter(|e| e.is_del()).count();
    assert_eq!(dels, 3);
    assert_eq!(mb.delete_calls(), 3);
    assert_eq!(mb.value("k"), None);
    assert_eq!(cache.stats().cache_size, 0);

    // Written again after the deletes, nothing stale interferes.
    cache.set_data("k", 9).await?;
    assert_eq!(cache.get_data("k").await?, Some(9));

    Ok(())
}
