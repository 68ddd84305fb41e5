// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! A single-threaded cooperative event loop — microtasks, `nextTick`,
//! timers, immediates — driven from a multi-threaded host. Producers on
//! any thread submit work through [`EventLoop`]; a single consumer
//! thread (the one that calls [`EventLoop::run`]) drains and executes
//! it in a deterministic order. On top of the loop sits a promise
//! engine (resolution, rejection, chaining, `all`/`race`/`all_settled`/
//! `any`, unhandled-rejection tracking) and an `AbortController`/
//! `AbortSignal` subsystem.
//!
//! ```no_run
//! use taskloop::{EventLoop, LoopConfig, ThenOutcome};
//!
//! let event_loop = EventLoop::new(LoopConfig::new());
//! let p = event_loop.new_promise::<i32>();
//! let child = p.then(|v| ThenOutcome::Value(v), |r| ThenOutcome::Reject(r));
//! p.resolve(7);
//! # let _ = child;
//! ```

pub mod abort;
pub mod config;
pub mod error;
pub mod immediate;
pub mod ingress;
pub mod interval;
pub mod metrics;
pub mod microtask;
pub mod nexttick;
pub mod promise;
pub mod promisify;
pub mod ring;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod timer;

use std::sync::Arc;

pub use abort::{abort_any, abort_timeout, AbortController, AbortSignal};
pub use config::{FastPathMode, LoopConfig};
pub use error::{reason, LoopError, PanicError, Reason};
pub use immediate::ImmediateId;
pub use interval::{IntervalCallback, IntervalId};
pub use metrics::LoopMetrics;
pub use promise::{
    all, all_settled, any, passthrough, race, Promise, PromiseState, Settlement, SettledResult,
    ThenOutcome,
};
pub use scheduler::Scheduler;
pub use state::LoopState;
pub use task::{Callback, Task};
pub use timer::TimerHandle;

use promise::{PromiseRegistry, UnhandledTracker};

/// Number of ring slots the registry scavenger walks per tick. Small
/// enough that a tick's cost stays bounded regardless of how many
/// promises have ever been created, large enough that a long-idle loop
/// with a backlog of dead handles clears it in a handful of ticks.
const SCAVENGE_BATCH_PER_TICK: usize = 64;

/// Top-level handle to a running (or not-yet-running) event loop.
/// Aggregates the scheduler, the promise registry, and the unhandled-
/// rejection tracker behind one facade so callers never have to wire
/// those three together themselves.
///
/// Cloning is cheap (every field is reference-counted) and every clone
/// refers to the same underlying loop.
#[derive(Clone)]
pub struct EventLoop {
    scheduler: Arc<Scheduler>,
    registry: Arc<PromiseRegistry>,
    unhandled: Arc<UnhandledTracker>,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Self {
        let scheduler = Scheduler::new(config);
        let registry = Arc::new(PromiseRegistry::new());
        let unhandled = UnhandledTracker::new(&scheduler);

        let reject_all_registry = registry.clone();
        scheduler.set_shutdown_hook(Box::new(move |err| {
            reject_all_registry.reject_all(Arc::new(err));
        }));

        let scavenge_registry = registry.clone();
        scheduler.set_tick_hook(Box::new(move || {
            scavenge_registry.scavenge(SCAVENGE_BATCH_PER_TICK);
        }));

        EventLoop { scheduler, registry, unhandled }
    }

    /// The underlying scheduler, for callers that need lower-level
    /// access (raw `submit_task`, `schedule_timer`, and so on).
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &LoopConfig {
        self.scheduler.config()
    }

    pub fn metrics(&self) -> &LoopMetrics {
        self.scheduler.metrics()
    }

    pub fn state(&self) -> LoopState {
        self.scheduler.state()
    }

    /// Run the loop on the calling thread until shutdown completes.
    pub fn run(&self) -> Result<(), LoopError> {
        self.scheduler.run()
    }

    /// Request shutdown from any thread; blocks until the loop reaches
    /// `Terminated`.
    pub fn shutdown(&self) -> Result<(), LoopError> {
        self.scheduler.shutdown()
    }

    /// Allocate a new pending promise bound to this loop.
    pub fn new_promise<T: Send + Sync + 'static>(&self) -> Promise<T> {
        Promise::new_pending(&self.scheduler, &self.registry, &self.unhandled)
    }

    /// Run `f` on a worker thread and settle the returned promise with
    /// its outcome once it lands back on the loop thread.
    pub fn promisify<T, F>(&self, f: F) -> Promise<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, Reason> + Send + 'static,
    {
        let promise = self.new_promise::<T>();
        let settle_target = promise.clone();
        promisify::promisify(&self.scheduler, f, move |outcome| match outcome {
            Ok(value) => settle_target.resolve(value),
            Err(reason) => settle_target.reject(reason),
        });
        promise
    }

    pub fn all<T: Send + Sync + 'static>(&self, promises: Vec<Promise<T>>) -> Promise<Vec<Arc<T>>> {
        promise::all(&self.scheduler, &self.registry, &self.unhandled, promises)
    }

    pub fn race<T: Send + Sync + 'static>(&self, promises: Vec<Promise<T>>) -> Promise<T> {
        promise::race(&self.scheduler, &self.registry, &self.unhandled, promises)
    }

    pub fn all_settled<T: Send + Sync + 'static>(
        &self,
        promises: Vec<Promise<T>>,
    ) -> Promise<Vec<SettledResult<T>>> {
        promise::all_settled(&self.scheduler, &self.registry, &self.unhandled, promises)
    }

    pub fn any<T: Send + Sync + 'static>(&self, promises: Vec<Promise<T>>) -> Promise<T> {
        promise::any(&self.scheduler, &self.registry, &self.unhandled, promises)
    }

    /// An `AbortSignal` that aborts with a `TimeoutError` reason after
    /// `delay_ms`, unless something else aborts it first.
    pub fn abort_timeout(&self, delay_ms: u64) -> Result<AbortSignal, LoopError> {
        abort::abort_timeout(&self.scheduler, delay_ms)
    }
}
