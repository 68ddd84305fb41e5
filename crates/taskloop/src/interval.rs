// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interval map: a repeating timer, implemented as a self-rescheduling
//! wrapper over the single-shot `TimerHeap` rather than a structure of
//! its own. Each tick of the interval re-enters `TimerHeap::schedule`
//! from inside its own callback, so the heap never needs to know an
//! entry is periodic.
//!
//! The rescheduling step is also where `ClearInterval` can race a fire:
//! the wrapper reads the record's cancelled flag before it does
//! anything, then takes the map lock to reschedule and re-reads the
//! flag under that same lock before actually pushing the next
//! `TimerHeap` entry. `ClearInterval` takes the same lock to remove the
//! record and flip the flag, so the two checks bracket the only window
//! where a clear can land between "decided to reschedule" and
//! "rescheduled" — whichever side observes the flag second wins, and
//! the loser either skips its reschedule or finds nothing left to
//! remove.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::LoopError;
use crate::scheduler::Scheduler;
use crate::task::Callback;
use crate::timer::MAX_SAFE_ID;

/// Ids start here: above the immediate range, visually distinguishable
/// from both timer and immediate ids.
const INTERVAL_ID_BASE: u64 = 1 << 49;

/// Unlike a timer/immediate `Callback` (`FnOnce`, fired exactly once),
/// an interval's callback runs on every tick, so it has to be callable
/// more than once — the same `Fn` + `Arc` shape `ShutdownHook`/
/// `TickHook` use in `scheduler.rs` for a repeatedly-invoked hook.
pub type IntervalCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalId(pub u64);

struct IntervalRecord {
    cancelled: Arc<AtomicBool>,
}

pub struct IntervalMap {
    entries: Mutex<HashMap<IntervalId, IntervalRecord>>,
    next_id: AtomicU64,
}

impl IntervalMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(INTERVAL_ID_BASE),
        })
    }

    /// Register a repeating `callback`, firing every `period` on
    /// `scheduler`'s timer heap until cleared. `scheduler` is a weak
    /// back-reference so a live interval never keeps the loop alive by
    /// itself — the same relationship timers and promises hold.
    pub fn set_interval(
        self: &Arc<Self>,
        scheduler: &Arc<Scheduler>,
        period: Duration,
        callback: IntervalCallback,
    ) -> Result<IntervalId, LoopError> {
        let raw_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if raw_id > MAX_SAFE_ID {
            return Err(LoopError::IntervalIdExhausted);
        }
        let id = IntervalId(raw_id);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.entries.lock().unwrap().insert(id, IntervalRecord { cancelled: cancelled.clone() });

        let wrapper = self.make_wrapper(scheduler, id, period, cancelled, callback);
        scheduler.schedule_timer(period, wrapper)?;
        Ok(id)
    }

    /// Build the single-shot `TimerHeap` callback for one fire of
    /// interval `id`. Pure construction, no locking — the lock only
    /// needs to guard the *reschedule* decision made inside the
    /// callback body, not building the closure itself.
    fn make_wrapper(
        self: &Arc<Self>,
        scheduler: &Arc<Scheduler>,
        id: IntervalId,
        period: Duration,
        cancelled: Arc<AtomicBool>,
        callback: IntervalCallback,
    ) -> Callback {
        let map = self.clone();
        let scheduler_handle = Arc::downgrade(scheduler);
        Box::new(move || {
            // Run the user callback without holding the map lock — it
            // may itself call ClearInterval on this same id.
            callback();
            let Some(scheduler) = scheduler_handle.upgrade() else { return };

            // First check, unlocked: cheap early-out for the common
            // case where the interval was cleared well before this
            // fire, without contending for the map lock at all.
            if cancelled.load(Ordering::Acquire) {
                return;
            }

            // Double-check, re-read under the same lock ClearInterval
            // takes to flip the flag and drop the record, and hold that
            // lock across the actual reschedule so ClearInterval can't
            // land in between "decided to reschedule" and "rescheduled"
            // — the two operations contend for the identical mutex, so
            // the only race window is closed by construction rather
            // than by timing.
            let entries = map.entries.lock().unwrap();
            if cancelled.load(Ordering::Acquire) || !entries.contains_key(&id) {
                return;
            }
            let next = map.make_wrapper(&scheduler, id, period, cancelled.clone(), callback.clone());
            let _ = scheduler.schedule_timer(period, next);
            drop(entries);
        })
    }

    /// Cancel interval `id`. Returns `TimerNotFound` if it was never
    /// registered, was already cleared, or — unlike a plain timer —
    /// simply no longer exists because it outlived the loop's other
    /// references to it; an interval that is still firing is always
    /// present in the map between ticks.
    pub fn clear_interval(&self, id: IntervalId) -> Result<(), LoopError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(&id) {
            Some(record) => {
                record.cancelled.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(LoopError::TimerNotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::sync::atomic::AtomicI32;
    use std::thread;

    #[test]
    fn fires_repeatedly_until_cleared() {
        let sched = Scheduler::new(LoopConfig::new());
        let map = IntervalMap::new();
        let fired = Arc::new(AtomicI32::new(0));
        let f = fired.clone();
        let id = map
            .set_interval(&sched, Duration::from_millis(2), Arc::new(move || {
                f.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        for _ in 0..5 {
            thread::sleep(Duration::from_millis(3));
            sched.tick();
        }
        let count_before_clear = fired.load(Ordering::Relaxed);
        assert!(count_before_clear >= 2, "expected multiple fires, got {count_before_clear}");

        map.clear_interval(id).unwrap();
        thread::sleep(Duration::from_millis(10));
        sched.tick();
        let count_after_clear = fired.load(Ordering::Relaxed);

        thread::sleep(Duration::from_millis(10));
        sched.tick();
        assert_eq!(fired.load(Ordering::Relaxed), count_after_clear, "must not fire again after clear");
    }

    #[test]
    fn clear_unknown_id_returns_not_found() {
        let map = IntervalMap::new();
        assert!(matches!(map.clear_interval(IntervalId(999)), Err(LoopError::TimerNotFound)));
    }

    #[test]
    fn double_clear_returns_not_found() {
        let sched = Scheduler::new(LoopConfig::new());
        let map = IntervalMap::new();
        let id = map.set_interval(&sched, Duration::from_millis(5), Arc::new(|| {})).unwrap();
        map.clear_interval(id).unwrap();
        assert!(matches!(map.clear_interval(id), Err(LoopError::TimerNotFound)));
    }

    #[test]
    fn clear_racing_a_fire_never_lets_it_reschedule() {
        // Exercises the TOCTOU window directly: clear the interval from
        // another thread at roughly the same moment its wrapper is
        // deciding whether to reschedule. Whichever side wins, the
        // interval must not keep firing afterward.
        let sched = Scheduler::new(LoopConfig::new());
        let map = IntervalMap::new();
        let fired = Arc::new(AtomicI32::new(0));
        let f = fired.clone();
        let id = map
            .set_interval(&sched, Duration::from_millis(1), Arc::new(move || {
                f.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        let map2 = map.clone();
        let clearer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            let _ = map2.clear_interval(id);
        });

        for _ in 0..20 {
            thread::sleep(Duration::from_millis(1));
            sched.tick();
        }
        clearer.join().unwrap();

        let settled = fired.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        sched.tick();
        assert_eq!(fired.load(Ordering::Relaxed), settled, "must stop firing once cleared");
    }

    #[test]
    fn ids_start_above_immediate_id_space() {
        let sched = Scheduler::new(LoopConfig::new());
        let map = IntervalMap::new();
        let id = map.set_interval(&sched, Duration::from_millis(5), Arc::new(|| {})).unwrap();
        assert!(id.0 >= INTERVAL_ID_BASE);
    }
}
