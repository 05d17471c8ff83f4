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

//! MemoryBacking: a durable store over a shared map for tests, with call counters and
//! failure switches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::BackingError;
use crate::testing::types::TestConfig;
use crate::BackingStore;
use crate::PendingWrite;
use crate::StoreHandle;

#[derive(Debug, Default)]
pub struct Durable {
    pub data: BTreeMap<String, i64>,

    /// Supplied to `on_connect`.
    pub seed: BTreeMap<String, i64>,

    /// The keys of every batch, per kind.
    pub write_batches: Vec<Vec<String>>,
    pub read_batches: Vec<Vec<String>>,
    pub delete_batches: Vec<Vec<String>>,

    pub fail_writes: bool,
    pub fail_reads: bool,
    pub fail_deletes: bool,
    pub fail_connect: bool,

    /// Sleep this long in every batch call.
    pub delay: Option<Duration>,

    pub connected: bool,
    pub disconnected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBacking {
    pub durable: Arc<Mutex<Durable>>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(pairs: &[(&str, i64)]) -> Self {
        let b = Self::new();
        {
            let mut d = b.durable.lock();
            for (k, v) in pairs {
                d.data.insert(k.to_string(), *v);
            }
        }
        b
    }

    pub fn read_calls(&self) -> usize {
        self.durable.lock().read_batches.len()
    }

    pub fn write_calls(&self) -> usize {
        self.durable.lock().write_batches.len()
    }

    pub fn delete_calls(&self) -> usize {
        self.durable.lock().delete_batches.len()
    }

    pub fn value(&self, key: &str) -> Option<i64> {
        self.durable.lock().data.get(key).copied()
    }

    async fn pause(&self) {
        let delay = self.durable.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl BackingStore<TestConfig> for MemoryBacking {
    async fn write(&self, pending: BTreeMap<String, PendingWrite<i64>>) -> Result<(), BackingError> {
        self.pause().await;

        let mut d = self.durable.lock();
        d.write_batches.push(pending.keys().cloned().collect());

        if d.fail_writes {
            return Err(BackingError::new("disk full"));
        }

        for (key, w) in pending {
            d.data.insert(key, w.value);
        }
        Ok(())
    }

    async fn read(
        &self,
        keys: Vec<String>,
        handle: &mut StoreHandle<TestConfig>,
    ) -> Result<(), BackingError> {
        self.pause().await;

        let mut d = self.durable.lock();
        d.read_batches.push(keys.clone());

        if d.fail_reads {
            return Err(BackingError::new("disk unreadable"));
        }

        for key in keys {
            if let Some(v) = d.data.get(&key) {
                handle.set(key, *v);
            }
        }
        Ok(())
    }

    async fn delete(&self, keys: Vec<String>) -> Result<(), BackingError> {
        self.pause().await;

        let mut d = self.durable.lock();
        d.delete_batches.push(keys.clone());

        if d.fail_deletes {
            return Err(BackingError::new("disk read-only"));
        }

        for key in keys {
            d.data.remove(&key);
        }
        Ok(())
    }

    async fn on_connect(&self, handle: &mut StoreHandle<TestConfig>) -> Result<(), BackingError> {
        let mut d = self.durable.lock();
        d.connected = true;

        if d.fail_connect {
            return Err(BackingError::new("no database"));
        }

        for (k, v) in &d.seed {
            handle.set(k, *v);
        }
        Ok(())
    }

    async fn on_disconnect(&self) {
        self.durable.lock().disconnected = true;
    }
}
