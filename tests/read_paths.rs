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

//! Read path integration test
//!
//! This test validates how a miss is served by the Backing and the Updaters.
//! The key aspects being tested are:
//!
//! 1. **Backing First**: By default the Backing is read first and the Updater is the fallback
//! 2. **Updater First**: With `Prefer::Updater` the Updater is asked first
//! 3. **Failures**: A read fails only when every source that was asked failed
//! 4. **Opportunistic Refresh**: With `update_after_misses`, a Backing hit is refreshed
//! 5. **Plain Miss**: A key nobody has resolves to `None`, as does any Backing miss when there
//!    is no Updater

use std::time::Duration;

use pretty_assertions::assert_eq;
use refresh_cache::errors::CacheError;
use refresh_cache::testing::backing::MemoryBacking;
use refresh_cache::testing::types::TestConfig;
use refresh_cache::testing::updater::MapUpdater;
use refresh_cache::testing::util::wait_for;
use refresh_cache::BackingConfig;
use refresh_cache::Cache;
use refresh_cache::CacheConfig;
use refresh_cache::GetOptions;
use refresh_cache::Prefer;
use refresh_cache::UpdaterConfig;

async fn cache_with(
    name: &str,
    config: CacheConfig,
    mu: &MapUpdater,
    mb: &MemoryBacking,
) -> anyhow::Result<Cache<TestConfig>> {
    let cache = Cache::<TestConfig>::new(config.with_default_throttle(Duration::from_millis(100)))?;

    let u = cache.new_updater(mu.clone(), UpdaterConfig::new().with_id(name))?;
    cache.add_updater(&u)?;
    cache.set_default_updater(name)?;

    cache.set_backing(mb.clone(), BackingConfig::new()).await?;
    Ok(cache)
}

#[tokio::test(start_paused = true)]
async fn test_backing_hit_skips_updater() -> anyhow::Result<()> {
    let mu = MapUpdater::with_data(&[("k", 2)]);
    let mb = MemoryBacking::with_data(&[("k", 1)]);
    let cache = cache_with("u1", CacheConfig::new("backing-hit"), &mu, &mb).await?;

    assert_eq!(cache.get_data("k").await?, Some(1));
    assert_eq!(cache.get_data("k").await?, Some(1));

    assert_eq!(mb.read_calls(), 1);
    assert_eq!(mu.runs(), 0);

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_backing_failure_falls_back_to_updater() -> anyhow::Result<()> {
    let mu = MapUpdater::with_data(&[("k", 7)]);
    let mb = MemoryBacking::new();
    mb.durable.lock().fail_reads = true;
    let cache = cache_with("u1", CacheConfig::new("backing-fails"), &mu, &mb).await?;

    assert_eq!(cache.get_data("k").await?, Some(7));
    assert_eq!(mb.read_calls(), 1);
    assert_eq!(mu.runs(), 1);

    // The value came from the default Updater, which now owns the key.
    assert_eq!(cache.updater_for_key("k").map(|u| u.id().to_string()), Some("u1".to_string()));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_backing_not_found_falls_back_to_updater() -> anyhow::Result<()> {
    let mu = MapUpdater::with_data(&[("k", 7)]);
    let mb = MemoryBacking::new();
    let cache = cache_with("u1", CacheConfig::new("backing-miss"), &mu, &mb).await?;

    assert_eq!(cache.get_data("k").await?, Some(7));
    assert_eq!(cache.get_data("absent").await?, None);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_every_source_fails() -> anyhow::Result<()> {
    let mu = MapUpdater::new();
    mu.remote.lock().fail_reads = true;
    let mb = MemoryBacking::new();
    mb.durable.lock().fail_reads = true;
    let cache = cache_with("u1", CacheConfig::new("all-fail"), &mu, &mb).await?;

    let err = cache.get_data("k").await.unwrap_err();
    assert!(matches!(err, CacheError::Updater(_)), "got: {:?}", err);
    assert!(err.is_collaborator_failure());

    let err = cache
        .get_data_with("k", GetOptions::prefer(Prefer::Updater))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Backing(_)), "got: {:?}", err);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_prefer_updater() -> anyhow::Result<()> {
    let mu = MapUpdater::with_data(&[("k", 2)]);
    let mb = MemoryBacking::with_data(&[("k", 1)]);
    let cache = cache_with("u1", CacheConfig::new("prefer-updater"), &mu, &mb).await?;

    let got = cache.get_data_with("k", GetOptions::prefer(Prefer::Updater)).await?;
    assert_eq!(got, Some(2));
    assert_eq!(mb.read_calls(), 0);
    assert_eq!(mu.runs(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_prefer_updater_falls_back_to_backing() -> anyhow::Result<()> {
    let mu = MapUpdater::with_data(&[("k", 2)]);
    mu.remote.lock().fail_reads = true;
    let mb = MemoryBacking::with_data(&[("k", 1)]);
    let cache = cache_with("u1", CacheConfig::new("prefer-fallback"), &mu, &mb).await?;

    let got = cache.get_data_with("k", GetOptions::prefer(Prefer::Updater)).await?;
    assert_eq!(got, Some(1));
    assert_eq!(mb.read_calls(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_update_after_misses_refreshes_backing_hit() -> anyhow::Result<()> {
    let mu = MapUpdater::with_data(&[("k", 6)]);
    let mb = MemoryBacking::with_data(&[("k", 5)]);
    let cache = cache_with(
        "u1",
        CacheConfig::new("after-misses").with_update_after_misses(true),
        &mu,
        &mb,
    )
    .await?;

    // The Backing answers first; the Updater catches up in the background.
    assert_eq!(cache.get_data("k").await?, Some(5));

    wait_for(|| match mu.runs() {
        1 => Ok(()),
        n => Err(format!("runs: {}", n)),
    })
    .await
    .map_err(anyhow::Error::msg)?;

    assert_eq!(cache.get_data("k").await?, Some(6));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_backing_only() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("backing-only"))?;
    let mb = MemoryBacking::with_data(&[("k", 1)]);
    cache.set_backing(mb.clone(), BackingConfig::new()).await?;

    assert_eq!(cache.get_data("k").await?, Some(1));

    // With nobody else to ask, a key the Backing does not have is absent.
    assert_eq!(cache.get_data("absent").await?, None);
    assert_eq!(
        cache
            .get_data_with("absent2", GetOptions::prefer(Prefer::Updater))
            .await?,
        None
    );

    // So is a key the Backing fails to read.
    mb.durable.lock().fail_reads = true;
    assert_eq!(cache.get_data("other").await?, None);
    assert_eq!(mb.read_calls(), 4);

    let stats = cache.stats();
    assert_eq!((stats.all_gets, stats.hits, stats.misses), (4, 0, 1));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_updater_only_miss_is_none() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("updater-only"))?;
    let mu = MapUpdater::with_data(&[("k", 3)]);
    let u = cache.new_updater(mu.clone(), UpdaterConfig::new().with_id("u1"))?;
    cache.add_updater(&u)?;
    cache.set_default_updater("u1")?;

    assert_eq!(cache.get_data("k").await?, Some(3));
    assert_eq!(cache.get_data("absent").await?, None);
    assert_eq!(mu.runs(), 2);

    Ok(())
}
