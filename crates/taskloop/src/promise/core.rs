// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Promise core: a strongly-typed `Promise<T>` whose settled value is
//! held as `Arc<T>` so fanning it out to many subscribers never needs
//! `T: Clone`.
//!
//! Fan-out-then-clear (drain the subscriber list, invoke each, leave it
//! empty) mirrors the drain-and-wake shape a join-waiter list uses when
//! a task completes; the panic-to-rejection conversion reuses the same
//! downcast-to-message pattern as the worker-thread bridge, via
//! `PanicError::from_payload`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{reason, PanicError, Reason};
use crate::promise::registry::{ErasedPromiseHandle, PromiseRegistry};
use crate::promise::unhandled::UnhandledTracker;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

/// A settled value, handed to subscribers. Kept distinct from
/// `ThenOutcome` below: this is what a promise *has*, the other is what
/// a `then` handler *returns*.
#[derive(Clone)]
pub enum Settlement<T> {
    Resolved(Arc<T>),
    Rejected(Reason),
}

/// What a `then` handler hands back to continue the chain: a plain
/// value, an adopted promise (possibly of a different output type), or
/// an explicit rejection.
pub enum ThenOutcome<U> {
    Value(Arc<U>),
    Chained(Promise<U>),
    Reject(Reason),
}

type Subscriber<T> = Box<dyn FnOnce(Settlement<T>) + Send>;

enum State<T> {
    Pending(Vec<Subscriber<T>>),
    Resolved(Arc<T>),
    Rejected(Reason),
}

struct Inner<T> {
    id: u64,
    scheduler: Weak<Scheduler>,
    registry: Weak<PromiseRegistry>,
    tracker: Weak<UnhandledTracker>,
    state: Mutex<State<T>>,
    /// Whether a rejection handler has ever been attached, read and
    /// written only from inside `state`'s lock so it orders the same
    /// way against a concurrent `settle()` as the state transition
    /// itself. Lives here rather than in a side table on the tracker so
    /// it's reclaimed for free when the promise is dropped, instead of
    /// accumulating for the life of the loop.
    handled: AtomicBool,
    creation_stack: Option<String>,
}

/// A handle to a promise. Cheap to clone (bumps the `Arc` refcount);
/// the registry only ever holds a weak reference to the same `Inner`.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise { inner: self.inner.clone() }
    }
}

const BACKTRACE_FRAME_LIMIT: usize = 32;

impl<T: Send + Sync + 'static> Promise<T> {
    /// Allocate a new pending promise, registering a weak handle to it
    /// under a fresh id.
    pub fn new_pending(
        scheduler: &Arc<Scheduler>,
        registry: &Arc<PromiseRegistry>,
        tracker: &Arc<UnhandledTracker>,
    ) -> Self {
        let id = registry.alloc_id();
        let creation_stack = if scheduler.config().debug_mode {
            let bt = std::backtrace::Backtrace::force_capture();
            Some(bt.to_string().lines().take(BACKTRACE_FRAME_LIMIT).collect::<Vec<_>>().join("\n"))
        } else {
            None
        };
        let inner = Arc::new(Inner {
            id,
            scheduler: Arc::downgrade(scheduler),
            registry: Arc::downgrade(registry),
            tracker: Arc::downgrade(tracker),
            state: Mutex::new(State::Pending(Vec::new())),
            handled: AtomicBool::new(false),
            creation_stack,
        });
        registry.track(id, Box::new(WeakHandle { inner: Arc::downgrade(&inner) }));
        if scheduler.config().metrics {
            scheduler.metrics().record_promise_created();
        }
        Promise { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> PromiseState {
        match &*self.inner.state.lock().unwrap() {
            State::Pending(_) => PromiseState::Pending,
            State::Resolved(_) => PromiseState::Resolved,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn value(&self) -> Option<Arc<T>> {
        match &*self.inner.state.lock().unwrap() {
            State::Resolved(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<Reason> {
        match &*self.inner.state.lock().unwrap() {
            State::Rejected(r) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn creation_stack_trace(&self) -> Option<&str> {
        self.inner.creation_stack.as_deref()
    }

    pub fn resolve(&self, value: T) {
        self.settle(Settlement::Resolved(Arc::new(value)));
    }

    pub fn reject(&self, reason: Reason) {
        self.settle(Settlement::Rejected(reason));
    }

    /// Resolve with another promise of the same type, adopting its
    /// eventual state. Resolving a promise with itself is the one case
    /// that can literally alias `self` (a differently-typed chain can
    /// never point back to `self`), so cycle detection lives here.
    pub fn resolve_with(&self, other: Promise<T>) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            self.reject(reason("TypeError: chaining cycle detected"));
            return;
        }
        let target = self.clone();
        other.subscribe(move |settlement| target.settle(settlement));
    }

    pub(crate) fn settle(&self, settlement: Settlement<T>) {
        let (subscribers, already_handled) = {
            let mut guard = self.inner.state.lock().unwrap();
            if !matches!(&*guard, State::Pending(_)) {
                return; // first terminal write wins
            }
            let new_state = match &settlement {
                Settlement::Resolved(v) => State::Resolved(v.clone()),
                Settlement::Rejected(r) => State::Rejected(r.clone()),
            };
            let subs = match std::mem::replace(&mut *guard, new_state) {
                State::Pending(subs) => subs,
                _ => unreachable!(),
            };
            // Read under the same lock `subscribe` writes under, so this
            // always observes a handler race-free: either the handler
            // was attached before this lock was taken (seen here) or it
            // attaches after (and finds the promise already terminal).
            (subs, self.inner.handled.load(Ordering::Acquire))
        };

        if let Some(scheduler) = self.inner.scheduler.upgrade() {
            if scheduler.config().metrics {
                scheduler.metrics().record_promise_settled();
            }
        }

        if let Settlement::Rejected(r) = &settlement {
            if !already_handled {
                if let Some(tracker) = self.inner.tracker.upgrade() {
                    tracker.on_reject(self.inner.id, r.clone(), self.inner.creation_stack.clone());
                }
            }
        }

        for sub in subscribers {
            self.dispatch(sub, settlement.clone());
        }
    }

    /// Queue `sub` to run as a microtask on the loop thread. Unlike the
    /// public, gated `Scheduler::queue_microtask` (used by external
    /// producers), this always succeeds while the scheduler itself is
    /// alive: continuing an already-pending promise chain during
    /// shutdown is how `RejectAll` actually reaches subscribers.
    fn dispatch(&self, sub: Subscriber<T>, settlement: Settlement<T>) {
        if let Some(scheduler) = self.inner.scheduler.upgrade() {
            scheduler.force_queue_microtask(Box::new(move || sub(settlement)));
        }
    }

    /// Attach a raw settlement subscriber. If the promise is already
    /// terminal, the subscriber still runs as a microtask rather than
    /// inline: "receive the terminal value immediately" means at the
    /// next checkpoint, not synchronously.
    pub(crate) fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(Settlement<T>) + Send + 'static,
    {
        // Anything watching this promise's eventual settlement counts
        // as a rejection handler for unhandled-rejection purposes —
        // `then`, `catch`, `to_channel`, adoption, and combinator inputs
        // all route through here. The flag is set inside the same lock
        // `settle` reads it under, so a subscribe racing a reject on
        // another thread can never be missed by both sides.
        let mut guard = self.inner.state.lock().unwrap();
        self.inner.handled.store(true, Ordering::Release);
        if let Some(tracker) = self.inner.tracker.upgrade() {
            tracker.on_handler_attached(self.inner.id);
        }
        match &mut *guard {
            State::Pending(subs) => subs.push(Box::new(f)),
            State::Resolved(v) => {
                let v = v.clone();
                drop(guard);
                self.dispatch(Box::new(f), Settlement::Resolved(v));
            }
            State::Rejected(r) => {
                let r = r.clone();
                drop(guard);
                self.dispatch(Box::new(f), Settlement::Rejected(r));
            }
        }
    }

    /// Core chaining primitive. `nil` handlers are expressed by passing
    /// a passthrough closure (see `catch`/`finally`) rather than an
    /// `Option`, so the handler signature stays a plain `FnOnce`.
    pub fn then<U, FOnFulfilled, FOnRejected>(
        &self,
        on_fulfilled: FOnFulfilled,
        on_rejected: FOnRejected,
    ) -> Promise<U>
    where
        U: Send + Sync + 'static,
        FOnFulfilled: FnOnce(Arc<T>) -> ThenOutcome<U> + Send + 'static,
        FOnRejected: FnOnce(Reason) -> ThenOutcome<U> + Send + 'static,
    {
        let scheduler = self.inner.scheduler.upgrade().expect("loop already dropped");
        let registry = self.inner.registry.upgrade().expect("registry already dropped");
        let tracker = self.inner.tracker.upgrade().expect("tracker already dropped");
        let child = Promise::<U>::new_pending(&scheduler, &registry, &tracker);
        let settle_child = child.clone();

        self.subscribe(move |settlement| {
            let outcome = match settlement {
                Settlement::Resolved(v) => guarded_call(move || on_fulfilled(v)),
                Settlement::Rejected(r) => guarded_call(move || on_rejected(r)),
            };
            match outcome {
                Ok(ThenOutcome::Value(v)) => settle_child.settle(Settlement::Resolved(v)),
                Ok(ThenOutcome::Reject(r)) => settle_child.settle(Settlement::Rejected(r)),
                Ok(ThenOutcome::Chained(p)) => settle_child.resolve_with(p),
                Err(panic_reason) => settle_child.settle(Settlement::Rejected(panic_reason)),
            }
        });

        child
    }

    /// `self.then(passthrough, on_rejected)` — the fulfilled path is
    /// unchanged (no `T: Clone` required, the `Arc` clone is free).
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> ThenOutcome<T> + Send + 'static,
    {
        self.then(|v| ThenOutcome::Value(v), on_rejected)
    }

    /// Runs `on_finally` on settlement (either path) without altering
    /// the value/reason that flows through. `on_finally` must be shared
    /// between both arms, hence the `Arc<F>`.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(on_finally);
        let on_fulfilled_hook = shared.clone();
        let on_rejected_hook = shared;
        self.then(
            move |v| {
                on_fulfilled_hook();
                ThenOutcome::Value(v)
            },
            move |r| {
                on_rejected_hook();
                ThenOutcome::Reject(r)
            },
        )
    }

    /// A one-shot channel that receives the settlement once it occurs.
    pub fn to_channel(&self) -> Receiver<Settlement<T>> {
        let (tx, rx) = sync_channel(1);
        self.subscribe(move |settlement| {
            let _ = tx.send(settlement);
        });
        rx
    }
}

/// Run a `then`/`catch`/`finally` handler under a panic barrier; a
/// recovered panic becomes the child's rejection reason wrapped in a
/// `PanicError`.
fn guarded_call<U>(f: impl FnOnce() -> ThenOutcome<U> + Send) -> Result<ThenOutcome<U>, Reason> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => Ok(outcome),
        Err(payload) => {
            let err = PanicError::from_payload(payload);
            Ok(ThenOutcome::Reject(Arc::new(err)))
        }
    }
}

struct WeakHandle<T> {
    inner: Weak<Inner<T>>,
}

impl<T: Send + Sync + 'static> ErasedPromiseHandle for WeakHandle<T> {
    fn is_collectible(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => !matches!(&*inner.state.lock().unwrap(), State::Pending(_)),
            None => true,
        }
    }

    fn reject_if_pending(&self, reason: Reason) {
        if let Some(inner) = self.inner.upgrade() {
            Promise { inner }.reject(reason);
        }
    }
}
