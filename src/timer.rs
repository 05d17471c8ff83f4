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

use std::sync::atomic;
use std::time::Duration;

use futures::future::Either;
use tokio::sync::oneshot;

use crate::TypeConfig;

/// A one-shot timer running as a background task.
///
/// Dropping the `Timer` cancels it: the task holds the receiving end of `cancel_tx` and
/// quits as soon as the sender is dropped.
///
/// `on_fire` receives the timer id. The owner compares it with the timer it currently
/// holds, so a timer that was replaced just before firing does no work.
pub(crate) struct Timer {
    id: u64,

    #[allow(dead_code)]
    cancel_tx: oneshot::Sender<()>,
}

impl Timer {
    pub(crate) fn arm<C, F>(name: impl ToString, after: Duration, on_fire: F) -> Timer
    where
        C: TypeConfig,
        F: FnOnce(u64) + Send + 'static,
    {
        static TIMER_ID: atomic::AtomicU64 = atomic::AtomicU64::new(0);
        let id = TIMER_ID.fetch_add(1, atomic::Ordering::SeqCst);

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let fu = async move {
            let sleep = Box::pin(tokio::time::sleep(after));
            match futures::future::select(sleep, cancel_rx).await {
                Either::Left(_) => on_fire(id),
                Either::Right(_) => {}
            }
        };

        C::spawn(fu, name);

        Timer { id, cancel_tx }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::testing::types::TestConfig;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_with_its_id() {
        let fired = Arc::new(AtomicU64::new(u64::MAX));
        let f = fired.clone();

        let timer = Timer::arm::<TestConfig, _>("t", Duration::from_millis(100), move |id| {
            f.store(id, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), timer.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let fired = Arc::new(AtomicU64::new(0));
        let f = fired.clone();

        let timer = Timer::arm::<TestConfig, _>("t", Duration::from_millis(100), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
