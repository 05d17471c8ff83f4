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

//! Clear, forced runs and Updater bookkeeping integration test
//!
//! The key aspects being tested are:
//!
//! 1. **Clear**: Every value and route is dropped; only the default Updater stays registered
//! 2. **Forced Runs**: `run_updaters` runs one or every Updater, even with nothing queued
//! 3. **Reference Counting**: An Updater that loses its last key is shut down and forgotten

use std::time::Duration;

use pretty_assertions::assert_eq;
use refresh_cache::errors::CacheError;
use refresh_cache::testing::types::TestConfig;
use refresh_cache::testing::updater::MapUpdater;
use refresh_cache::testing::util::settle;
use refresh_cache::Cache;
use refresh_cache::CacheConfig;
use refresh_cache::Phase;
use refresh_cache::SetOptions;
use refresh_cache::UpdaterConfig;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_clear_keeps_only_default_updater() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("clear"))?;

    let m1 = MapUpdater::new();
    let m2 = MapUpdater::new();
    let m3 = MapUpdater::new();

    let u1 = cache.new_updater(
        m1.clone(),
        UpdaterConfig::new()
            .with_id("u1")
            .with_interval(Duration::from_millis(1000)),
    )?;
    let u2 = cache.new_updater(m2.clone(), UpdaterConfig::new().with_id("u2"))?;
    let u3 = cache.new_updater(m3.clone(), UpdaterConfig::new().with_id("u3"))?;

    cache.add_updater(&u1)?;
    cache.set_default_updater("u1")?;

    cache
        .set_data_with("a", 1, SetOptions::new().with_updater_id("u1"))
        .await?;
    cache
        .set_data_with("b", 2, SetOptions::new().with_updater(&u2))
        .await?;
    cache
        .set_data_with("c", 3, SetOptions::new().with_updater(&u3))
        .await?;

    let stats = cache.stats();
    assert_eq!((stats.cache_size, stats.num_updaters), (3, 3));
    assert_eq!(m1.heartbeats(), 0);

    cache.clear();

    let stats = cache.stats();
    assert_eq!((stats.cache_size, stats.num_updaters), (0, 1));

    assert_eq!(u2.phase(), Phase::Shutdown);
    assert_eq!(u3.phase(), Phase::Shutdown);
    assert_eq!(m2.remote.lock().shutdowns, 1);
    assert_eq!(m3.remote.lock().shutdowns, 1);

    assert_eq!(u1.phase(), Phase::WaitingOnInterval);
    assert_eq!(u1.ref_count(), 0);
    assert_eq!(m1.remote.lock().shutdowns, 0);
    assert!(cache.updater_for_key("a").is_none());
    assert_eq!(cache.default_updater().map(|u| u.id().to_string()), Some("u1".to_string()));

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(m1.heartbeats(), 2);
    assert_eq!(m2.runs(), 1);
    assert_eq!(m3.runs(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_run_updaters() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("run-updaters"))?;

    assert_eq!(cache.run_updaters(None).await, Err(CacheError::NoUpdaters));

    let m1 = MapUpdater::new();
    let m2 = MapUpdater::new();
    let u1 = cache.new_updater(m1.clone(), UpdaterConfig::new().with_id("u1"))?;
    let u2 = cache.new_updater(m2.clone(), UpdaterConfig::new().with_id("u2"))?;
    cache.add_updater(&u1)?;
    cache.add_updater(&u2)?;

    assert_eq!(
        cache.run_updaters(Some("nope")).await,
        Err(CacheError::UnknownUpdater("nope".to_string()))
    );

    cache.run_updaters(None).await?;
    assert_eq!((m1.runs(), m2.runs()), (1, 1));

    // A forced run is not a heartbeat.
    assert_eq!((m1.heartbeats(), m2.heartbeats()), (0, 0));

    cache.run_updaters(Some("u1")).await?;
    assert_eq!((m1.runs(), m2.runs()), (2, 1));

    assert_eq!(cache.stats().update_calls, 3);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_updater_retired_with_its_last_key() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("refs"))?;

    let m1 = MapUpdater::new();
    let m2 = MapUpdater::new();
    let u1 = cache.new_updater(m1.clone(), UpdaterConfig::new().with_id("u1"))?;
    let u2 = cache.new_updater(m2.clone(), UpdaterConfig::new().with_id("u2"))?;

    cache
        .set_data_with("a", 1, SetOptions::new().with_updater(&u1))
        .await?;
    cache
        .set_data_with("b", 2, SetOptions::new().with_updater(&u1))
        .await?;
    assert_eq!(u1.ref_count(), 2);

    // Moving "b" away leaves one key.
    cache
        .set_data_with("b", 3, SetOptions::new().with_updater(&u2))
        .await?;
    assert_eq!((u1.ref_count(), u2.ref_count()), (1, 1));
    assert_eq!(cache.stats().num_updaters, 2);

    // Moving "a" away leaves none.
    cache
        .set_data_with("a", 4, SetOptions::new().with_updater(&u2))
        .await?;
    assert_eq!(u1.ref_count(), 0);
    assert!(u1.is_shutdown());
    assert_eq!(m1.remote.lock().shutdowns, 1);
    assert!(cache.updater("u1").is_none());

    // The last key of u2 is deleted through it.
    cache.remove_data("a").await?;
    assert_eq!(u2.ref_count(), 1);
    cache.remove_data("b").await?;
    settle().await;

    assert!(u2.is_shutdown());
    assert_eq!(cache.stats().num_updaters, 0);
    assert_eq!(m2.remote.lock().deletes, vec!["a".to_string(), "b".to_string()]);

    Ok(())
}
