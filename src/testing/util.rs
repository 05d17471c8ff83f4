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

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::event_stream::CacheEvent;

/// Let every task that can make progress run.
///
/// With a paused clock the sleep returns only once the runtime is idle, so this does not
/// advance time far enough to fire any timer longer than a millisecond.
pub async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

/// Take every event published so far.
pub fn drain_events<V: Clone>(rx: &mut broadcast::Receiver<CacheEvent<V>>) -> Vec<CacheEvent<V>> {
    let mut events = vec![];
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

/// Retry `check` every `delay` until it passes or `max_attempts` is reached.
///
/// Returns the last failure message.
pub async fn retry_check(
    mut check: impl FnMut() -> Result<(), String>,
    max_attempts: u32,
    delay: Duration,
) -> Result<(), String> {
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match check() {
            Ok(()) => return Ok(()),
            Err(error_msg) => {
                last_error = error_msg;
                if attempt < max_attempts {
                    sleep(delay).await;
                }
            }
        }
    }

    Err(format!(
        "check failed after {} attempts. Last error: {}",
        max_attempts, last_error
    ))
}

/// [`retry_check`] with 20 attempts 50 ms apart.
pub async fn wait_for(check: impl FnMut() -> Result<(), String>) -> Result<(), String> {
    retry_check(check, 20, Duration::from_millis(50)).await
}
