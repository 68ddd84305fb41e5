// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Promisify bridge: runs a blocking function on a worker thread and
//! funnels its result back through the ingress queue so it settles on
//! the loop thread like everything else.
//!
//! The worker body follows a `thread::spawn` + `catch_unwind` +
//! downcast-to-message shape; the wait group tracking in-flight workers
//! across shutdown follows the same active-count/all-done condvar
//! bookkeeping a worker pool uses to know when it's safe to join.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::{reason, PanicError, Reason};
use crate::scheduler::Scheduler;

/// Tracks in-flight Promisify workers so shutdown can wait for them
/// instead of silently dropping their results: shutdown blocks until
/// this group is empty.
pub struct WaitGroup {
    active: AtomicUsize,
    all_done: (Mutex<()>, Condvar),
}

impl WaitGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            all_done: (Mutex::new(()), Condvar::new()),
        })
    }

    fn enter(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (lock, cvar) = &self.all_done;
            let _guard = lock.lock().unwrap();
            cvar.notify_all();
        }
    }

    pub fn wait_until_empty(&self) {
        let (lock, cvar) = &self.all_done;
        let mut guard = lock.lock().unwrap();
        while self.active.load(Ordering::Acquire) > 0 {
            guard = cvar.wait(guard).unwrap();
        }
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Run `f` on a worker thread and invoke `settle` with its outcome. The
/// invocation normally happens as a task on the loop thread; if the
/// loop is already terminating by the time the worker finishes, it
/// falls back to calling `settle` directly on the worker thread so the
/// user's outcome is never silently dropped — a deliberate
/// anti-zombie-promise fallback, not an edge case to close off.
pub fn promisify<T, F, S>(scheduler: &Arc<Scheduler>, f: F, settle: S)
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Reason> + Send + 'static,
    S: FnOnce(Result<T, Reason>) + Send + 'static,
{
    let wait_group = scheduler.wait_group().clone();
    let scheduler = scheduler.clone();
    wait_group.enter();

    thread::spawn(move || {
        let outcome = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                let err = PanicError::from_payload(payload);
                Err(reason(err.message))
            }
        };

        let settle_box: Box<dyn FnOnce() + Send> = {
            let settle = settle;
            Box::new(move || settle(outcome))
        };

        if let Err((_, task)) = scheduler.submit_task(settle_box) {
            // Loop is past the point of accepting new ingress work; run
            // the settlement directly so the caller's promise still
            // resolves instead of hanging forever.
            task();
        }

        wait_group.exit();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    #[test]
    fn worker_result_settles_on_loop_thread() {
        let sched = Scheduler::new(LoopConfig::new());
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        promisify(
            &sched,
            || -> Result<i32, Reason> { Ok(42) },
            move |outcome| {
                *r.lock().unwrap() = Some(outcome);
            },
        );

        // Wait for the worker to submit, then let the loop thread run it.
        std::thread::sleep(Duration::from_millis(20));
        sched.tick();

        match result.lock().unwrap().take() {
            Some(Ok(v)) => assert_eq!(v, 42),
            other => panic!("expected Ok(42), got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn panicking_worker_rejects_with_panic_reason() {
        let sched = Scheduler::new(LoopConfig::new());
        let result: Arc<Mutex<Option<Result<i32, Reason>>>> = Arc::new(Mutex::new(None));
        let r = result.clone();
        promisify(
            &sched,
            || -> Result<i32, Reason> { panic!("boom") },
            move |outcome| {
                *r.lock().unwrap() = Some(outcome);
            },
        );
        std::thread::sleep(Duration::from_millis(20));
        sched.tick();
        let outcome = result.lock().unwrap().take().unwrap();
        assert!(outcome.is_err());
    }

    #[test]
    fn shutdown_waits_for_in_flight_worker() {
        let sched = Scheduler::new(LoopConfig::new());
        let fired = Arc::new(AtomicI32::new(0));
        let f = fired.clone();
        promisify(
            &sched,
            move || -> Result<(), Reason> {
                std::thread::sleep(Duration::from_millis(30));
                Ok(())
            },
            move |_| {
                f.fetch_add(1, Ordering::Relaxed);
            },
        );

        let sched2 = sched.clone();
        let handle = std::thread::spawn(move || sched.run().unwrap());
        std::thread::sleep(Duration::from_millis(5));
        sched2.shutdown().unwrap();
        handle.join().unwrap();

        // The fallback path must have run the settle callback even
        // though the loop had already finished its own drain.
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
