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

//! MapUpdater: a refresh callback over an in-memory "remote system" for tests.
//! Records every cycle and can be told to fail, panic, stall or leave requests unsettled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::errors::UpdaterError;
use crate::testing::types::TestConfig;
use crate::Delegate;
use crate::Refresh;

#[derive(Debug, Default)]
pub struct Remote {
    /// The data of the remote system.
    pub data: BTreeMap<String, i64>,

    /// Refresh cycles run, heartbeats included.
    pub runs: usize,

    /// Cycles with nothing queued.
    pub heartbeats: usize,

    pub run_times: Vec<Instant>,

    /// Every value persisted, in order.
    pub writes: Vec<(String, i64)>,

    /// Every key deleted, in order.
    pub deletes: Vec<String>,

    /// Values to supply unasked during the next cycle.
    pub push_next: BTreeMap<String, i64>,

    pub fail_writes: bool,
    pub fail_reads: bool,

    /// Return `Err` from the callback without settling anything.
    pub fail_cycle: bool,

    /// Return `Ok` without settling anything.
    pub leave_unsettled: bool,

    /// Panic in the next cycle.
    pub panic_next: bool,

    /// Sleep this long at the start of every cycle.
    pub delay: Option<Duration>,

    pub shutdowns: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MapUpdater {
    pub remote: Arc<Mutex<Remote>>,
}

impl MapUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(pairs: &[(&str, i64)]) -> Self {
        let u = Self::new();
        {
            let mut r = u.remote.lock();
            for (k, v) in pairs {
                r.data.insert(k.to_string(), *v);
            }
        }
        u
    }

    pub fn runs(&self) -> usize {
        self.remote.lock().runs
    }

    pub fn heartbeats(&self) -> usize {
        self.remote.lock().heartbeats
    }

    pub fn remote_value(&self, key: &str) -> Option<i64> {
        self.remote.lock().data.get(key).copied()
    }
}

#[async_trait::async_trait]
impl Refresh<TestConfig> for MapUpdater {
    async fn refresh(&self, d: &mut Delegate<TestConfig>) -> Result<(), UpdaterError> {
        let (delay, panic, fail_cycle, leave_unsettled) = {
            let mut r = self.remote.lock();
            r.runs += 1;
            if d.is_heartbeat() {
                r.heartbeats += 1;
            }
            r.run_times.push(Instant::now());
            let panic = std::mem::take(&mut r.panic_next);
            (r.delay, panic, r.fail_cycle, r.leave_unsettled)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if panic {
            panic!("MapUpdater told to panic");
        }

        if fail_cycle {
            return Err(UpdaterError::new("remote unavailable"));
        }

        if leave_unsettled {
            return Ok(());
        }

        for key in d.write_requests() {
            let value = d.get(&key);
            let accepted = {
                let mut r = self.remote.lock();
                if r.fail_writes {
                    false
                } else {
                    if let Some(v) = value {
                        r.data.insert(key.clone(), v);
                        r.writes.push((key.clone(), v));
                    }
                    true
                }
            };

            if accepted {
                d.set_complete(&key)?;
            } else {
                d.set_fail(&key, UpdaterError::new("write rejected"))?;
            }
        }

        for key in d.delete_requests() {
            {
                let mut r = self.remote.lock();
                r.data.remove(&key);
                r.deletes.push(key.clone());
            }
            d.del(&key);
        }

        for key in d.read_requests() {
            let (fail, value) = {
                let r = self.remote.lock();
                (r.fail_reads, r.data.get(&key).copied())
            };

            if fail {
                d.set_fail(&key, UpdaterError::new("read rejected"))?;
                continue;
            }

            match value {
                Some(v) => d.set(&key, v),
                // Not in the remote system either: a plain miss.
                None => d.set_complete(&key)?,
            }
        }

        let pushed = std::mem::take(&mut self.remote.lock().push_next);
        for (key, v) in pushed {
            d.set(&key, v);
        }

        Ok(())
    }

    fn on_shutdown(&self) {
        self.remote.lock().shutdowns += 1;
    }
}
