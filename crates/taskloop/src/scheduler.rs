// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler / tick: the loop's main function. Drives
//! nextTick/microtask/ingress/timer draining under the loop thread,
//! parks between ticks on a wakeable handle, and runs the shutdown
//! drain. The park/wake idiom — CAS-retry on state-transition failure
//! paired with a `(Mutex<bool>, Condvar)` wait — is the same one a
//! multi-worker pool uses, collapsed here from N workers to a single
//! loop thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::config::LoopConfig;
use crate::error::{LoopError, PanicError};
use crate::immediate::ImmediateMap;
use crate::ingress::IngressQueue;
use crate::interval::{IntervalCallback, IntervalId, IntervalMap};
use crate::metrics::LoopMetrics;
use crate::microtask::MicrotaskQueue;
use crate::nexttick::NextTickQueue;
use crate::promisify::WaitGroup;
use crate::state::{LoopState, StateCell};
use crate::task::{Callback, Task};
use crate::timer::{clamp_delay, TimerHandle, TimerHeap};
use std::sync::{Arc, Weak};

/// Invoked once during the shutdown drain to reject every still-pending
/// promise in the registry. Wired up by the
/// top-level facade once the promise registry exists, avoiding a
/// circular module dependency between `scheduler` and `promise`.
pub type ShutdownHook = Box<dyn Fn(LoopError) + Send + Sync>;

/// Invoked once per tick to let the top-level facade drive the promise
/// registry's incremental scavenger without `scheduler` depending on
/// `promise` directly (same rationale as `ShutdownHook` above).
pub type TickHook = Box<dyn Fn() + Send + Sync>;

/// Run a callback inside a panic barrier, logging and recovering
/// instead of unwinding past the scheduler.
pub(crate) fn run_guarded(cb: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(cb)) {
        let err = PanicError::from_payload(payload);
        warn!(message = %err.message, "recovered panic in loop callback");
    }
}

pub struct Scheduler {
    state: StateCell,
    ingress: IngressQueue,
    microtasks: MicrotaskQueue,
    nexttick: NextTickQueue,
    timers: Mutex<TimerHeap>,
    immediates: Arc<ImmediateMap>,
    intervals: Arc<IntervalMap>,
    config: LoopConfig,
    metrics: LoopMetrics,
    wait_group: Arc<WaitGroup>,
    wakeup: (Mutex<bool>, Condvar),
    terminated_signal: (Mutex<bool>, Condvar),
    timer_nesting_depth: AtomicU32,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    tick_hook: Mutex<Option<TickHook>>,
}

impl Scheduler {
    pub fn new(config: LoopConfig) -> Arc<Self> {
        Arc::new(Self {
            state: StateCell::new(LoopState::Awake),
            ingress: IngressQueue::new(),
            microtasks: MicrotaskQueue::new(),
            nexttick: NextTickQueue::new(),
            timers: Mutex::new(TimerHeap::new()),
            immediates: ImmediateMap::new(),
            intervals: IntervalMap::new(),
            config,
            metrics: LoopMetrics::new(),
            wait_group: WaitGroup::new(),
            wakeup: (Mutex::new(false), Condvar::new()),
            terminated_signal: (Mutex::new(false), Condvar::new()),
            timer_nesting_depth: AtomicU32::new(0),
            shutdown_hook: Mutex::new(None),
            tick_hook: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    pub fn state(&self) -> LoopState {
        self.state.load()
    }

    pub fn wait_group(&self) -> &Arc<WaitGroup> {
        &self.wait_group
    }

    pub fn ingress(&self) -> &IngressQueue {
        &self.ingress
    }

    /// Registered once by the top-level facade after the promise
    /// registry is constructed.
    pub fn set_shutdown_hook(&self, hook: ShutdownHook) {
        *self.shutdown_hook.lock().unwrap() = Some(hook);
    }

    /// Registered once by the top-level facade to drive the promise
    /// registry's scavenger alongside the loop's own bookkeeping.
    pub fn set_tick_hook(&self, hook: TickHook) {
        *self.tick_hook.lock().unwrap() = Some(hook);
    }

    fn wake(&self) {
        let (lock, cvar) = &self.wakeup;
        let mut ready = lock.lock().unwrap();
        *ready = true;
        cvar.notify_one();
    }

    // ---- producer-facing operations (any thread) ----

    /// Submit a task to the ingress queue. On failure the task is
    /// handed back so callers with a fallback path (Promisify, §4.13)
    /// can still run it rather than dropping the user's outcome.
    pub fn submit_task(&self, task: Task) -> Result<(), (LoopError, Task)> {
        if !self.state.can_accept_work() {
            return Err((LoopError::LoopTerminated, task));
        }
        self.ingress.push(task);
        self.wake();
        Ok(())
    }

    pub fn queue_microtask(&self, cb: Callback) -> Result<(), LoopError> {
        if !self.state.can_accept_work() {
            return Err(LoopError::LoopTerminated);
        }
        self.microtasks.push(cb);
        self.wake();
        Ok(())
    }

    /// Ungated microtask enqueue used by the promise core to continue
    /// an already-pending chain. Unlike `queue_microtask`, this never
    /// rejects work based on loop state: by the time a promise exists
    /// and has subscribers, delivering its settlement isn't "new work"
    /// from an external producer, it's the tail of work the loop already
    /// committed to — including during `RejectAll`'s shutdown fan-out.
    pub(crate) fn force_queue_microtask(&self, cb: Callback) {
        self.microtasks.push(cb);
        self.wake();
    }

    pub fn next_tick(&self, cb: Callback) -> Result<(), LoopError> {
        if !self.state.can_accept_work() {
            return Err(LoopError::LoopTerminated);
        }
        self.nexttick.push(cb);
        self.wake();
        Ok(())
    }

    pub fn schedule_timer(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, LoopError> {
        if !self.state.can_accept_work() {
            return Err(LoopError::LoopTerminated);
        }
        let depth = self.timer_nesting_depth.load(Ordering::Relaxed);
        let handle = self.timers.lock().unwrap().schedule(delay, depth, callback)?;
        self.wake();
        Ok(handle)
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) -> Result<(), LoopError> {
        self.timers.lock().unwrap().cancel(handle)
    }

    pub fn set_immediate(&self, callback: Callback) -> Result<crate::immediate::ImmediateId, LoopError> {
        if !self.state.can_accept_work() {
            return Err(LoopError::LoopTerminated);
        }
        let id = self.immediates.set_immediate(&self.ingress, callback)?;
        self.wake();
        Ok(id)
    }

    pub fn clear_immediate(&self, id: crate::immediate::ImmediateId) -> Result<(), LoopError> {
        self.immediates.clear_immediate(id)
    }

    /// Register a repeating callback, firing every `period` until
    /// cleared. `self: &Arc<Self>` because the interval wrapper holds a
    /// weak back-reference to reschedule itself across fires without
    /// keeping the loop alive on its own.
    pub fn schedule_interval(
        self: &Arc<Self>,
        period: Duration,
        callback: IntervalCallback,
    ) -> Result<IntervalId, LoopError> {
        if !self.state.can_accept_work() {
            return Err(LoopError::LoopTerminated);
        }
        self.intervals.set_interval(self, period, callback)
    }

    pub fn clear_interval(&self, id: IntervalId) -> Result<(), LoopError> {
        self.intervals.clear_interval(id)
    }

    /// Request shutdown. Blocks the calling thread until the loop
    /// reaches `Terminated`; returns `LoopTerminated` immediately if it
    /// already had before this call. A second `shutdown()` call after
    /// the first succeeded just observes `LoopTerminated` rather than
    /// erroring in some other way.
    pub fn shutdown(&self) -> Result<(), LoopError> {
        match self.state.transition_any(
            &[LoopState::Awake, LoopState::Running, LoopState::Sleeping, LoopState::Terminating],
            LoopState::Terminating,
        ) {
            Ok(LoopState::Terminating) => {
                // Another thread already initiated shutdown; just wait.
            }
            Ok(_) => self.wake(),
            Err(LoopState::Terminated) => return Err(LoopError::LoopTerminated),
            Err(_) => unreachable!("transition_any only fails on states outside `froms`"),
        }
        self.wait_for_terminated();
        Ok(())
    }

    fn wait_for_terminated(&self) {
        let (lock, cvar) = &self.terminated_signal;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }

    // ---- loop-thread operations ----

    /// Run the loop until shutdown completes. Only one thread may call
    /// this at a time.
    pub fn run(self: &Arc<Self>) -> Result<(), LoopError> {
        self.state
            .try_transition(LoopState::Awake, LoopState::Running)
            .map_err(|_| LoopError::LoopAlreadyRunning)?;

        loop {
            if self.state.load() == LoopState::Terminating {
                break;
            }
            let observed_work = self.tick();

            if self.state.load() == LoopState::Terminating {
                break;
            }

            let budget = self.poll_budget(observed_work);

            match self.state.try_transition(LoopState::Running, LoopState::Sleeping) {
                Ok(()) => {}
                Err(LoopState::Terminating) => break,
                Err(_) => continue,
            }

            self.park(budget);

            match self.state.try_transition(LoopState::Sleeping, LoopState::Running) {
                Ok(()) => {}
                Err(LoopState::Terminating) => break,
                Err(_) => continue,
            }
        }

        self.shutdown_drain();
        Ok(())
    }

    fn park(&self, budget: Duration) {
        let (lock, cvar) = &self.wakeup;
        let mut ready = lock.lock().unwrap();
        while !*ready {
            let (guard, timeout) = cvar.wait_timeout(ready, budget).unwrap();
            ready = guard;
            if timeout.timed_out() {
                break;
            }
        }
        *ready = false;
    }

    /// One tick. Returns whether any task/microtask/timer fired, which
    /// forces the next poll to be non-blocking.
    ///
    /// `pub(crate)` so integration-style unit tests in other modules
    /// (promisify, promise core, unhandled tracker) can drive the loop
    /// one step at a time instead of spinning up `run()` on a thread.
    pub(crate) fn tick(&self) -> bool {
        let _span = tracing::trace_span!("loop_tick").entered();
        self.timer_nesting_depth.store(0, Ordering::Relaxed);
        let mut observed_work = false;

        observed_work |= self.drain_checkpoint();

        if self.try_pop_and_run_one_ingress_task() {
            observed_work = true;
        }

        observed_work |= self.drain_checkpoint();
        observed_work |= self.expire_ready_timers();

        if let Some(hook) = self.tick_hook.lock().unwrap().as_ref() {
            hook();
        }

        observed_work
    }

    /// Drain nextTick to empty, then microtasks to empty. Returns
    /// whether anything ran.
    fn drain_checkpoint(&self) -> bool {
        let mut ran = false;
        while let Some(cb) = self.nexttick.pop() {
            ran = true;
            run_guarded(cb);
            if self.config.metrics {
                self.metrics.record_microtask_run();
            }
        }
        while let Some(cb) = self.microtasks.pop() {
            ran = true;
            run_guarded(cb);
            if self.config.metrics {
                self.metrics.record_microtask_run();
            }
        }
        ran
    }

    fn try_pop_and_run_one_ingress_task(&self) -> bool {
        let should_try = match self.config.fast_path_mode {
            crate::config::FastPathMode::Disabled => true,
            crate::config::FastPathMode::Auto | crate::config::FastPathMode::Forced => {
                !self.ingress.is_empty()
            }
        };
        if !should_try {
            return false;
        }
        match self.ingress.pop() {
            Some(task) => {
                trace!("running one ingress task");
                run_guarded(task);
                if self.config.metrics {
                    self.metrics.record_task_run();
                }
                true
            }
            None => false,
        }
    }

    fn expire_ready_timers(&self) -> bool {
        let now = Instant::now();
        let ready = self.timers.lock().unwrap().ready_callbacks(now);
        if ready.is_empty() {
            return false;
        }
        self.timer_nesting_depth.fetch_add(1, Ordering::Relaxed);
        for cb in ready {
            run_guarded(cb);
            if self.config.metrics {
                self.metrics.record_timer_fired();
            }
            if self.config.strict_microtask_ordering {
                self.drain_checkpoint();
            }
        }
        self.timer_nesting_depth.fetch_sub(1, Ordering::Relaxed);
        true
    }

    fn poll_budget(&self, observed_work: bool) -> Duration {
        if observed_work {
            return Duration::ZERO;
        }
        let earliest = self.timers.lock().unwrap().earliest_deadline();
        match earliest {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    Duration::ZERO
                } else {
                    (deadline - now).min(self.config.max_block_time)
                }
            }
            None => self.config.max_block_time,
        }
    }

    fn shutdown_drain(&self) {
        trace!("entering shutdown drain");
        loop {
            let mut any = false;
            while let Some(task) = self.ingress.pop() {
                any = true;
                run_guarded(task);
            }
            any |= self.drain_checkpoint();
            if !any {
                break;
            }
        }

        if let Some(hook) = self.shutdown_hook.lock().unwrap().as_ref() {
            hook(LoopError::LoopTerminated);
        }

        // RejectAll above settles every still-pending promise, which
        // dispatches each subscriber as a microtask via
        // `force_queue_microtask`; drain those too so a `.catch()`
        // attached before shutdown actually observes the sentinel
        // rejection instead of it being silently queued and dropped.
        while self.drain_checkpoint() {}

        self.wait_group.wait_until_empty();

        self.state.store(LoopState::Terminated);
        let (lock, cvar) = &self.terminated_signal;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    /// Clamp a requested delay the way `TimerHeap` would, for callers
    /// (e.g. `SetInterval` wrappers) that need to pre-announce a delay
    /// before actually scheduling it.
    pub fn clamp_timer_delay(&self, delay: Duration) -> Duration {
        clamp_delay(delay, self.timer_nesting_depth.load(Ordering::Relaxed))
    }
}

/// A weak back-reference a promise or abort signal can hold to reach
/// the scheduler without keeping it alive, mirroring the registry's
/// own weak-handle ownership policy.
pub type SchedulerHandle = Weak<Scheduler>;
