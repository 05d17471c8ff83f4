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

//! Basic set/get integration test
//!
//! This test validates the cache without any collaborator. The key aspects being tested are:
//!
//! 1. **Plain Miss**: A miss with no Updater and no Backing resolves to `None`
//! 2. **Write Visibility**: A write is visible to the next read
//! 3. **Events**: `new` on the first write, `change` only when the value changes
//! 4. **TTL**: An expired entry is a miss
//! 5. **Statistics**: hits, served misses and sizes are counted

use std::time::Duration;

use pretty_assertions::assert_eq;
use refresh_cache::event_stream::CacheEvent;
use refresh_cache::event_stream::EventSource;
use refresh_cache::testing::types::TestConfig;
use refresh_cache::testing::util::drain_events;
use refresh_cache::Cache;
use refresh_cache::CacheConfig;
use refresh_cache::SetOptions;
use refresh_cache::Stats;
use refresh_cache::TtlStore;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_set_then_get_without_collaborators() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(CacheConfig::new("basic"))?;
    let mut rx = cache.subscribe();

    assert_eq!(cache.get_data("missing").await?, None);

    cache.set_data("k1", 1).await?;
    cache.set_data("k1", 1).await?;
    cache.set_data("k1", 2).await?;

    assert_eq!(cache.get_data("k1").await?, Some(2));

    assert_eq!(drain_events(&mut rx), vec![
        CacheEvent::New {
            key: "k1".to_string(),
            value: 1,
            source: EventSource::Caller,
            updater: None,
        },
        CacheEvent::Change {
            key: "k1".to_string(),
            value: 2,
            source: EventSource::Caller,
            updater: None,
        },
    ]);

    // The first miss was served by nobody, so it is not counted.
    assert_eq!(cache.stats(), Stats {
        hits: 1,
        misses: 0,
        all_gets: 2,
        update_calls: 0,
        cache_size: 1,
        num_updaters: 0,
    });

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_is_a_miss() -> anyhow::Result<()> {
    let cache = Cache::<TestConfig>::new(
        CacheConfig::new("ttl").with_default_ttl(Duration::from_millis(100)),
    )?;

    cache.set_data("short", 1).await?;
    cache
        .set_data_with(
            "long",
            2,
            SetOptions::new().with_ttl(Duration::from_secs(10)),
        )
        .await?;

    sleep(Duration::from_millis(150)).await;

    assert_eq!(cache.get_data("short").await?, None);
    assert_eq!(cache.get_data("long").await?, Some(2));
    assert_eq!(cache.stats().cache_size, 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalid_cache_config() {
    let res = Cache::<TestConfig>::new(CacheConfig::new("bad").with_event_capacity(0));
    assert!(res.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_capacity_eviction_publishes_no_del() -> anyhow::Result<()> {
    let cache =
        Cache::<TestConfig>::with_store(CacheConfig::new("small"), TtlStore::with_capacity(1))?;
    let mut rx = cache.subscribe();

    cache.set_data("a", 1).await?;
    cache.set_data("b", 2).await?;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(cache.get_data("a").await?, None);
    assert_eq!(cache.get_data("b").await?, Some(2));

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| !e.is_del()), "got: {:?}", events);

    Ok(())
}
