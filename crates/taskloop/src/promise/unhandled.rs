// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Unhandled-rejection tracker: watches promises that reject with
//! nobody listening and reports them to the host after a short grace
//! window, with retroactive cleanup if a handler shows up late.
//!
//! The per-rejection wait can't happen on the loop thread (the loop
//! never blocks outside the poll step), so each rejection gets a
//! short-lived watcher thread, same worker-thread idiom as
//! `promisify.rs`. The CAS-deduped "check" microtask batches watcher
//! creation so rejections handled within the same tick (the common
//! `let p = f(); p.catch(...)` pattern) never spin up a thread at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Reason;
use crate::scheduler::Scheduler;

const GRACE_WINDOW: Duration = Duration::from_millis(10);

/// Passed to the host's unhandled-rejection handler instead of the bare
/// reason when `DebugMode` is enabled.
#[derive(Debug)]
pub struct UnhandledRejectionDebugInfo {
    pub reason: Reason,
    pub creation_stack: Option<String>,
}

impl std::fmt::Display for UnhandledRejectionDebugInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unhandled rejection: {}", self.reason)?;
        if let Some(stack) = &self.creation_stack {
            write!(f, "\ncreated at:\n{stack}")?;
        }
        Ok(())
    }
}

impl std::error::Error for UnhandledRejectionDebugInfo {}

struct PendingRejection {
    reason: Reason,
    creation_stack: Option<String>,
    /// Set once a watcher is spawned; dropping it (via `on_handler_attached`
    /// removing the whole record) closes the channel the watcher is
    /// waiting on.
    #[allow(dead_code)]
    handler_ready_tx: Option<SyncSender<()>>,
    watcher_spawned: bool,
}

/// Side table of pending (rejected, not-yet-known-to-be-handled)
/// promises, keyed by id. Whether a given promise has *ever* been
/// handled is not tracked here — that bit lives on the promise's own
/// `Inner<T>` (an `AtomicBool` read and written under the same state
/// lock that guards its settlement), so this table only ever holds
/// entries for promises currently inside their grace window, not one
/// for every promise that was ever subscribed to. A promise is only
/// reported here at all if `Promise::settle` decided it was unhandled
/// at the moment it rejected.
pub struct UnhandledTracker {
    scheduler: Weak<Scheduler>,
    pending: Mutex<HashMap<u64, PendingRejection>>,
    check_scheduled: AtomicBool,
}

impl UnhandledTracker {
    pub fn new(scheduler: &Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            scheduler: Arc::downgrade(scheduler),
            pending: Mutex::new(HashMap::new()),
            check_scheduled: AtomicBool::new(false),
        })
    }

    /// A rejection handler was attached to promise `id`: if a pending
    /// record exists (the promise rejected before this handler showed
    /// up, and is still inside its grace window), drop it. Dropping the
    /// tx half closes the handler-ready channel; any live watcher
    /// observes `Disconnected` and exits without reporting.
    pub fn on_handler_attached(&self, id: u64) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Promise `id` just transitioned to Rejected with nobody having
    /// subscribed yet. `creation_stack` is `Some` only in debug mode.
    pub fn on_reject(&self, id: u64, reason: Reason, creation_stack: Option<String>) {
        self.pending.lock().unwrap().insert(
            id,
            PendingRejection { reason, creation_stack, handler_ready_tx: None, watcher_spawned: false },
        );

        if self
            .check_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(scheduler) = self.scheduler.upgrade() {
                let tracker = self.self_handle();
                scheduler.force_queue_microtask(Box::new(move || {
                    if let Some(t) = tracker.upgrade() {
                        t.check_scheduled.store(false, Ordering::Release);
                        t.spawn_watchers();
                    }
                }));
            }
        }
    }

    /// Spawn a grace-window watcher for every pending record that
    /// doesn't have one yet. Runs on the loop thread (from the "check"
    /// microtask), so records handled earlier in the same tick never
    /// get a watcher at all.
    fn spawn_watchers(self: &Arc<Self>) {
        let ids: Vec<u64> = {
            let mut pending = self.pending.lock().unwrap();
            pending
                .iter_mut()
                .filter(|(_, rec)| !rec.watcher_spawned)
                .map(|(id, rec)| {
                    rec.watcher_spawned = true;
                    *id
                })
                .collect()
        };

        for id in ids {
            let (tx, rx) = sync_channel::<()>(1);
            // Swap in the real paired sender so on_handler_attached's
            // removal actually closes the channel this watcher reads.
            if let Some(rec) = self.pending.lock().unwrap().get_mut(&id) {
                rec.handler_ready_tx = Some(tx);
            } else {
                continue; // handled between the scan above and now
            }

            let tracker = self.self_handle();
            let started_at = Instant::now();
            thread::spawn(move || {
                let remaining = GRACE_WINDOW.saturating_sub(started_at.elapsed());
                match rx.recv_timeout(remaining) {
                    Ok(()) => return,       // shouldn't happen (nothing ever sends), treated as handled
                    Err(RecvTimeoutError::Disconnected) => {} // on_handler_attached dropped the sender: timed out naturally or was handled, check below
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if let Some(t) = tracker.upgrade() {
                    t.report_if_still_pending(id);
                }
            });
        }
    }

    fn report_if_still_pending(&self, id: u64) {
        let record = self.pending.lock().unwrap().remove(&id);
        let Some(record) = record else { return };
        let Some(scheduler) = self.scheduler.upgrade() else { return };
        if scheduler.config().metrics {
            scheduler.metrics().record_unhandled_rejection();
        }
        let Some(handler) = scheduler.config().unhandled_rejection_handler.clone() else { return };
        let payload: Reason = if scheduler.config().debug_mode {
            Arc::new(UnhandledRejectionDebugInfo { reason: record.reason, creation_stack: record.creation_stack })
        } else {
            record.reason
        };
        scheduler.force_queue_microtask(Box::new(move || handler(payload)));
    }

    /// A `Weak<Self>` to pass into a closure/thread without assuming
    /// the tracker outlives it. `UnhandledTracker` is always stored
    /// behind an `Arc` by its owner, so this just re-derives a weak ref
    /// from a strong one held elsewhere; see the facade for the
    /// canonical strong owner.
    fn self_handle(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn reject_then_timeout_invokes_handler() {
        let reported: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let r = reported.clone();
        let sched = Scheduler::new(
            LoopConfig::new().with_unhandled_rejection_handler(move |reason| {
                r.lock().unwrap().push(reason.to_string());
            }),
        );
        let tracker = UnhandledTracker::new(&sched);
        tracker.on_reject(1, crate::error::reason("boom"), None);
        sched.tick(); // runs the "check" microtask, spawns the watcher

        std::thread::sleep(Duration::from_millis(30));
        sched.tick(); // delivers the handler-invocation microtask

        assert_eq!(reported.lock().unwrap().as_slice(), ["boom"]);
    }

    #[test]
    fn handler_attached_before_grace_window_suppresses_report() {
        let reported = Arc::new(StdMutex::new(Vec::<String>::new()));
        let r = reported.clone();
        let sched = Scheduler::new(
            LoopConfig::new().with_unhandled_rejection_handler(move |reason| {
                r.lock().unwrap().push(reason.to_string());
            }),
        );
        let tracker = UnhandledTracker::new(&sched);
        tracker.on_reject(2, crate::error::reason("boom"), None);
        sched.tick();
        tracker.on_handler_attached(2);

        std::thread::sleep(Duration::from_millis(30));
        sched.tick();

        assert!(reported.lock().unwrap().is_empty());
        assert_eq!(tracker.pending_count(), 0);
    }
}
