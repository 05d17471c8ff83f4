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

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::FutureExt;
use log::debug;
use log::error;
use log::info;
use parking_lot::Mutex;

use crate::cache::CacheInner;
use crate::config::Equality;
use crate::config::UpdaterConfig;
use crate::delegate::Delegate;
use crate::delegate::TokenQueue;
use crate::errors::CacheError;
use crate::errors::UpdaterError;
use crate::timer::Timer;
use crate::token::settled;
use crate::token::TokenFuture;
use crate::Refresh;
use crate::TypeConfig;

/// The scheduling state of an [`Updater`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing running, no timer armed.
    Idle,

    /// The refresh callback is executing.
    Running,

    /// A run just finished and more work is queued; the throttle timer gates the next run.
    Throttled,

    /// Nothing queued; the interval timer will start a heartbeat cycle.
    WaitingOnInterval,

    /// Terminal.
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Throttle,
    Interval,
}

struct Schedule {
    phase: Phase,

    /// Requests for the next cycle.
    pending: TokenQueue,

    throttle_timer: Option<Timer>,
    interval_timer: Option<Timer>,
}

/// A background worker that refreshes, persists and deletes keys through a [`Refresh`] callback.
///
/// Requests are queued per cycle and handed to the callback in one [`Delegate`]. At most one
/// cycle runs at a time; the throttle spaces consecutive cycles and the optional interval
/// schedules heartbeat cycles with nothing queued.
///
/// Created by [`Cache::new_updater`](crate::Cache::new_updater).
pub struct Updater<C: TypeConfig> {
    id: String,
    throttle: Duration,
    interval: Option<Duration>,
    equality: Option<Equality<C::Value>>,
    refresh: Arc<dyn Refresh<C>>,

    cache: Weak<CacheInner<C>>,
    this: Weak<Updater<C>>,

    /// Number of keys routed to this Updater.
    refs: AtomicUsize,

    /// Mirrors `Phase::Shutdown` so it can be read without the schedule lock.
    shut: AtomicBool,

    debug: bool,

    schedule: Mutex<Schedule>,
}

impl<C> fmt::Display for Updater<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Updater({})", self.id)
    }
}

impl<C> fmt::Debug for Updater<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Updater")
            .field("id", &self.id)
            .field("throttle", &self.throttle)
            .field("interval", &self.interval)
            .field("refs", &self.ref_count())
            .field("phase", &self.phase())
            .finish()
    }
}

impl<C> Updater<C>
where
    C: TypeConfig,
{
    pub(crate) fn new(
        id: String,
        config: UpdaterConfig<C::Value>,
        default_throttle: Duration,
        refresh: Arc<dyn Refresh<C>>,
        cache: Weak<CacheInner<C>>,
        debug: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Updater {
            id,
            throttle: config.throttle.unwrap_or(default_throttle),
            interval: config.interval,
            equality: config.equality,
            refresh,
            cache,
            this: this.clone(),
            refs: AtomicUsize::new(0),
            shut: AtomicBool::new(false),
            debug,
            schedule: Mutex::new(Schedule {
                phase: Phase::Idle,
                pending: TokenQueue::default(),
                throttle_timer: None,
                interval_timer: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> Phase {
        self.schedule.lock().phase
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }

    pub(crate) fn equality(&self) -> Option<&Equality<C::Value>> {
        self.equality.as_ref()
    }

    pub(crate) fn belongs_to(&self, cache: &Arc<CacheInner<C>>) -> bool {
        std::ptr::eq(self.cache.as_ptr(), Arc::as_ptr(cache))
    }

    pub(crate) fn retain(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the ref count, never below zero. Returns the new count.
    pub(crate) fn release(&self) -> usize {
        let prev = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub(crate) fn reset_refs(&self) {
        self.refs.store(0, Ordering::SeqCst);
    }

    /// Ask for `key` to be read. Resolves when the cycle that handled it settles it.
    pub fn get_data(&self, key: &str) -> TokenFuture<()> {
        self.enqueue(|q| q.read(key))
    }

    /// Ask for the current store value of `key` to be persisted.
    pub fn set_data(&self, key: &str) -> TokenFuture<()> {
        self.enqueue(|q| q.write(key))
    }

    /// Ask for `key` to be deleted from the external system.
    pub fn remove_data(&self, key: &str) -> TokenFuture<()> {
        self.enqueue(|q| q.delete(key))
    }

    /// Queue a read of `key` that nobody waits for.
    pub fn ask_for_opportunistic_read(&self, key: &str) {
        self.enqueue(|q| {
            q.opportunistic_read(key);
            settled(Ok(()))
        });
    }

    /// Force a cycle, even with no key requests queued.
    pub fn update(&self) -> TokenFuture<()> {
        self.enqueue(|q| q.update())
    }

    fn enqueue(&self, f: impl FnOnce(&mut TokenQueue) -> TokenFuture<()>) -> TokenFuture<()> {
        let mut sched = self.schedule.lock();

        if sched.phase == Phase::Shutdown {
            return settled(Err(CacheError::Shutdown(self.id.clone())));
        }

        let fu = f(&mut sched.pending);
        self.request_run(&mut sched);
        fu
    }

    fn request_run(&self, sched: &mut Schedule) {
        match sched.phase {
            Phase::Running | Phase::Throttled | Phase::Shutdown => {}
            Phase::Idle => self.start_run(sched),
            Phase::WaitingOnInterval => {
                // A demand-driven run supersedes the heartbeat; it is re-armed after the run.
                sched.interval_timer = None;
                self.start_run(sched);
            }
        }
    }

    fn start_run(&self, sched: &mut Schedule) {
        if !sched.pending.is_dirty() && self.interval.is_none() {
            sched.phase = Phase::Idle;
            return;
        }

        let tokens = std::mem::take(&mut sched.pending);

        let (Some(cache), Some(this)) = (self.cache.upgrade(), self.this.upgrade()) else {
            sched.phase = Phase::Shutdown;
            self.shut.store(true, Ordering::SeqCst);
            tokens.close(CacheError::Closed(format!("{}: cache dropped", self)));
            return;
        };

        sched.phase = Phase::Running;
        cache.update_calls.fetch_add(1, Ordering::SeqCst);

        let delegate = Delegate::new(cache, self.id.clone(), self.equality.clone(), tokens);

        if self.debug {
            debug!(
                "{}: start cycle: reads={:?} writes={:?} deletes={:?} heartbeat={}",
                self,
                delegate.read_requests(),
                delegate.write_requests(),
                delegate.delete_requests(),
                delegate.is_heartbeat()
            );
        }

        C::spawn(this.run(delegate), format!("{}-run", self));
    }

    async fn run(self: Arc<Self>, mut delegate: Delegate<C>) {
        let res = AssertUnwindSafe(self.refresh.refresh(&mut delegate))
            .catch_unwind()
            .await;

        let (outcome, panicked) = match res {
            Ok(outcome) => (outcome, false),
            Err(_) => (Err(UpdaterError::new("refresh callback panicked")), true),
        };

        if let Err(e) = &outcome {
            error!("{}: refresh cycle failed: {}", self, e);
        }

        delegate.complete(outcome.map_err(|e| e.context(&self)));
        self.after_run(panicked);
    }

    fn after_run(&self, panicked: bool) {
        let mut sched = self.schedule.lock();

        if sched.phase == Phase::Shutdown {
            return;
        }

        if sched.pending.is_dirty() || panicked {
            sched.phase = Phase::Throttled;
            sched.throttle_timer = Some(self.arm(TimerKind::Throttle, self.throttle));
        } else {
            self.wait_on_interval(&mut sched);
        }
    }

    fn wait_on_interval(&self, sched: &mut Schedule) {
        match self.interval {
            Some(interval) => {
                sched.phase = Phase::WaitingOnInterval;
                sched.interval_timer = Some(self.arm(TimerKind::Interval, interval));
            }
            None => sched.phase = Phase::Idle,
        }
    }

    fn arm(&self, kind: TimerKind, after: Duration) -> Timer {
        let this = self.this.clone();
        Timer::arm::<C, _>(format!("{}-{:?}", self, kind), after, move |timer_id| {
            if let Some(u) = this.upgrade() {
                u.on_timer(kind, timer_id);
            }
        })
    }

    fn on_timer(&self, kind: TimerKind, timer_id: u64) {
        let mut sched = self.schedule.lock();

        match kind {
            TimerKind::Throttle => {
                let current = sched.throttle_timer.as_ref().map(|t| t.id());
                if sched.phase != Phase::Throttled || current != Some(timer_id) {
                    return;
                }
                sched.throttle_timer = None;

                if sched.pending.is_dirty() {
                    self.start_run(&mut sched);
                } else {
                    self.wait_on_interval(&mut sched);
                }
            }
            TimerKind::Interval => {
                let current = sched.interval_timer.as_ref().map(|t| t.id());
                if sched.phase != Phase::WaitingOnInterval || current != Some(timer_id) {
                    return;
                }
                sched.interval_timer = None;
                self.start_run(&mut sched);
            }
        }
    }

    /// Arm the interval timer if there is one and nothing else is scheduled.
    pub(crate) fn start_interval(&self) {
        let mut sched = self.schedule.lock();
        if sched.phase == Phase::Idle {
            self.wait_on_interval(&mut sched);
        }
    }

    /// Cancel timers and fail queued requests, leaving the Updater usable.
    ///
    /// A cycle already running is not interrupted.
    pub(crate) fn reset(&self, reason: &str) {
        let pending = {
            let mut sched = self.schedule.lock();
            if sched.phase == Phase::Shutdown {
                return;
            }

            sched.throttle_timer = None;
            sched.interval_timer = None;
            if sched.phase != Phase::Running {
                sched.phase = Phase::Idle;
            }
            std::mem::take(&mut sched.pending)
        };

        pending.close(CacheError::Closed(format!("{}: {}", self, reason)));
        self.start_interval();
    }

    /// Stop scheduling for good: cancel both timers, fail queued requests and call
    /// [`Refresh::on_shutdown`].
    ///
    /// A cycle already running completes, but nothing is scheduled after it.
    pub fn shutdown(&self) {
        let pending = {
            let mut sched = self.schedule.lock();
            if sched.phase == Phase::Shutdown {
                return;
            }

            sched.phase = Phase::Shutdown;
            self.shut.store(true, Ordering::SeqCst);
            sched.throttle_timer = None;
            sched.interval_timer = None;
            std::mem::take(&mut sched.pending)
        };

        info!("{}: shut down", self);

        pending.close(CacheError::Shutdown(self.id.clone()));
        self.refresh.on_shutdown();
    }
}
