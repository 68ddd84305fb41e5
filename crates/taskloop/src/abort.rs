// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Abort subsystem: `AbortController` is the sole mutator of its
//! `AbortSignal`; the signal itself is the shared, clonable handle
//! callers observe and attach handlers to.
//!
//! Generalised from a bare one-shot `AtomicBool` flag into a
//! reason-carrying signal with a handler list. The handler list's
//! copy-out-then-invoke-without-the-lock-held pattern applies the same
//! idiom a read-lock-guarded shared value uses, just over a `Vec` of
//! closures instead of a value.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{reason, LoopError, Reason};
use crate::scheduler::Scheduler;

type AbortHandler = Box<dyn FnOnce(Reason) + Send>;

struct SignalInner {
    aborted: AtomicBool,
    reason: Mutex<Option<Reason>>,
    handlers: Mutex<Vec<AbortHandler>>,
    /// Strong references to source signals, populated only for
    /// composites built by `abort_any`. Keeps short-lived sources (an
    /// inline `AbortTimeout`, say) alive for as long as the composite
    /// is, without creating a cycle: the reverse edge (each source's
    /// `on_abort` hook back into this composite) is weak.
    #[allow(dead_code)]
    composed_sources: Vec<AbortSignal>,
}

/// The read side of an abort: `Aborted`, `Reason`, `OnAbort`,
/// `ThrowIfAborted`. Cheap to clone; every clone shares the same
/// underlying state.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    fn new() -> Self {
        Self::with_composed_sources(Vec::new())
    }

    fn with_composed_sources(sources: Vec<AbortSignal>) -> Self {
        AbortSignal {
            inner: Arc::new(SignalInner {
                aborted: AtomicBool::new(false),
                reason: Mutex::new(None),
                handlers: Mutex::new(Vec::new()),
                composed_sources: sources,
            }),
        }
    }

    pub fn aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<Reason> {
        self.inner.reason.lock().unwrap().clone()
    }

    /// `Ok(())` if not aborted, `Err(AbortError)` carrying the reason
    /// otherwise.
    pub fn throw_if_aborted(&self) -> Result<(), LoopError> {
        match self.reason() {
            Some(r) => Err(LoopError::AbortError { reason: r }),
            None => Ok(()),
        }
    }

    /// Attach a handler, invoked once with the abort reason. If the
    /// signal is already aborted, the handler fires synchronously and
    /// inline, on the calling thread.
    pub fn on_abort<F>(&self, handler: F)
    where
        F: FnOnce(Reason) + Send + 'static,
    {
        let existing_reason = {
            let guard = self.inner.reason.lock().unwrap();
            guard.clone()
        };
        if let Some(r) = existing_reason {
            handler(r);
            return;
        }
        let mut handlers = self.inner.handlers.lock().unwrap();
        // Re-check under the lock: another thread may have aborted
        // between the read above and taking this lock.
        if let Some(r) = self.inner.reason.lock().unwrap().clone() {
            drop(handlers);
            handler(r);
            return;
        }
        handlers.push(Box::new(handler));
    }

    /// First-writer-wins transition to aborted. Returns `true` if this
    /// call performed the transition (used by `AbortController::abort`
    /// and by composite propagation to decide whether to run handlers).
    fn try_abort(&self, reason: Reason) -> bool {
        {
            let mut guard = self.inner.reason.lock().unwrap();
            if guard.is_some() {
                return false;
            }
            *guard = Some(reason.clone());
        }
        self.inner.aborted.store(true, Ordering::Release);

        let handlers = std::mem::take(&mut *self.inner.handlers.lock().unwrap());
        // A panicking handler propagates to the Abort caller; remaining
        // handlers are not invoked. Reentrant Abort calls on this same
        // signal from inside a handler are no-ops because `reason` is
        // already set above.
        for handler in handlers {
            let reason = reason.clone();
            match catch_unwind(AssertUnwindSafe(|| handler(reason))) {
                Ok(()) => {}
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        true
    }
}

/// The write side of an abort: the sole mutator of its `AbortSignal`.
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        AbortController { signal: AbortSignal::new() }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort with `reason`. One-shot: subsequent calls are silent
    /// no-ops and the reason stays the first one.
    pub fn abort(&self, reason: Reason) {
        self.signal.try_abort(reason);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a signal that aborts with a `TimeoutError` reason after
/// `delay_ms`, unless something else aborts it first. The timer itself
/// is cancelled once the signal settles by any route, so a manual abort
/// doesn't leave a dangling timer callback.
pub fn abort_timeout(scheduler: &Arc<Scheduler>, delay_ms: u64) -> Result<AbortSignal, LoopError> {
    let controller = Arc::new(AbortController::new());
    let signal = controller.signal();
    let handle = scheduler.schedule_timer(
        std::time::Duration::from_millis(delay_ms),
        Box::new({
            let controller = controller.clone();
            move || controller.abort(reason_timeout())
        }),
    )?;
    // If something else aborts first, cancel the still-pending timer
    // so its callback never fires against an already-settled signal.
    let sched_weak = Arc::downgrade(scheduler);
    signal.on_abort(move |_reason| {
        if let Some(sched) = sched_weak.upgrade() {
            let _ = sched.cancel_timer(&handle);
        }
    });
    Ok(signal)
}

fn reason_timeout() -> Reason {
    Arc::new(LoopError::TimeoutError)
}

/// Compose several signals into one: the first source to abort wins
/// and its reason propagates to the composite. Composite signals hold
/// strong references to their sources (see DESIGN.md): a composite is
/// frequently the only thing keeping short-lived derived signals (e.g.
/// an inline `AbortTimeout`) alive, and a weak reference would let such
/// a source be dropped and its timer cancelled before it had a chance
/// to fire.
///
/// The back edge — each source's `on_abort` hook into the composite —
/// is weak, so this doesn't form a reference cycle: once nothing else
/// holds the composite, it (and its strong grip on the sources) drops
/// normally, and any source that later aborts just finds the weak
/// upgrade fails.
pub fn abort_any(sources: Vec<AbortSignal>) -> AbortSignal {
    let composite = AbortSignal::with_composed_sources(sources.clone());
    let weak_composite = Arc::downgrade(&composite.inner);
    for source in &sources {
        let weak_composite = weak_composite.clone();
        source.on_abort(move |r| {
            if let Some(inner) = weak_composite.upgrade() {
                AbortSignal { inner }.try_abort(r);
            }
        });
    }
    composite
}
