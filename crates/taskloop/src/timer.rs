// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer heap: min-heap keyed by deadline, owned by the loop thread
//! exclusively. Ids are monotonic; cancellation sets a flag rather than
//! removing the entry so the heap never has to support arbitrary
//! deletion.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::LoopError;
use crate::task::Callback;

/// Safe-integer ceiling (2^53 - 1).
pub const MAX_SAFE_ID: u64 = (1u64 << 53) - 1;

/// Timer entries scheduled from inside a running timer callback below
/// this nesting depth are left alone; at/above it, sub-4ms delays are
/// clamped up to 4ms (HTML-style nesting clamp).
const NESTING_CLAMP_DEPTH: u32 = 5;
const NESTING_CLAMP_FLOOR: Duration = Duration::from_millis(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// What a caller keeps to later cancel a scheduled timer. Carries the
/// cancelled-flag directly so `cancel` never needs an id-indexed lookup
/// table of its own (the heap entry already owns the same `Arc`).
#[derive(Clone)]
pub struct TimerHandle {
    pub id: TimerId,
    pub(crate) cancelled: Arc<AtomicBool>,
}

struct TimerEntry {
    deadline: Instant,
    insertion_seq: u64,
    id: TimerId,
    cancelled: Arc<AtomicBool>,
    callback: Option<Callback>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.insertion_seq == other.insertion_seq
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Equal deadlines fire in insertion order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.insertion_seq.cmp(&other.insertion_seq))
    }
}

pub struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_id: AtomicU64,
    next_insertion_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: AtomicU64::new(1),
            next_insertion_seq: 0,
        }
    }

    fn alloc_id(&self) -> Result<TimerId, LoopError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id > MAX_SAFE_ID {
            return Err(LoopError::TimerIdExhausted);
        }
        Ok(TimerId(id))
    }

    /// Schedule `callback` to run after `delay`. `nesting_depth` is the
    /// current timer-callback nesting depth as tracked by the
    /// scheduler; 0 means "not inside a timer callback".
    pub fn schedule(
        &mut self,
        delay: Duration,
        nesting_depth: u32,
        callback: Callback,
    ) -> Result<TimerHandle, LoopError> {
        let id = self.alloc_id()?;
        let delay = clamp_delay(delay, nesting_depth);
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = self.next_insertion_seq;
        self.next_insertion_seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            insertion_seq: seq,
            id,
            cancelled: cancelled.clone(),
            callback: Some(callback),
        }));
        Ok(TimerHandle { id, cancelled })
    }

    /// Mark a timer cancelled. The heap entry is left in place; it is
    /// skipped when popped by `ready_callbacks`.
    pub fn cancel(&mut self, handle: &TimerHandle) -> Result<(), LoopError> {
        if handle.cancelled.swap(true, Ordering::AcqRel) {
            return Err(LoopError::TimerNotFound);
        }
        Ok(())
    }

    /// Pop every timer whose deadline has passed, skipping cancelled
    /// entries, and return their callbacks in fire order. Callbacks are
    /// captured first and executed by the caller after the list is
    /// built, so a callback that schedules a new timer can't be popped
    /// in the same pass.
    pub fn ready_callbacks(&mut self, now: Instant) -> Vec<Callback> {
        let mut ready = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(mut entry) = self.heap.pop().unwrap();
            if entry.cancelled.swap(true, Ordering::AcqRel) {
                continue;
            }
            if let Some(cb) = entry.callback.take() {
                ready.push(cb);
            }
        }
        ready
    }

    /// Earliest pending deadline, ignoring cancelled entries lazily
    /// (a cancelled head is cheap to skip here too, avoiding an
    /// artificially short poll budget).
    pub fn earliest_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.cancelled.load(Ordering::Acquire) {
                self.heap.pop();
                continue;
            }
            return Some(entry.deadline);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Round sub-millisecond positive delays up to 1ms, then apply the
/// nesting clamp.
fn clamp_delay(delay: Duration, nesting_depth: u32) -> Duration {
    let delay = if delay.is_zero() {
        delay
    } else {
        delay.max(Duration::from_millis(1))
    };
    if nesting_depth > NESTING_CLAMP_DEPTH && delay < NESTING_CLAMP_FLOOR {
        NESTING_CLAMP_FLOOR
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        heap.schedule(Duration::from_millis(20), 0, Box::new(move || o1.lock().unwrap().push("b")))
            .unwrap();
        let o2 = order.clone();
        heap.schedule(Duration::from_millis(5), 0, Box::new(move || o2.lock().unwrap().push("a")))
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        for cb in heap.ready_callbacks(Instant::now()) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut heap = TimerHeap::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let now_delay = Duration::from_millis(0);
        for i in 0..5 {
            let order = order.clone();
            heap.schedule(now_delay, 0, Box::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        for cb in heap.ready_callbacks(Instant::now()) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_skips_execution_and_is_idempotent_err() {
        let mut heap = TimerHeap::new();
        let fired = Arc::new(AtomicI32::new(0));
        let f = fired.clone();
        let handle = heap
            .schedule(Duration::from_millis(1), 0, Box::new(move || {
                f.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        heap.cancel(&handle).unwrap();
        assert!(matches!(heap.cancel(&handle), Err(LoopError::TimerNotFound)));

        std::thread::sleep(Duration::from_millis(5));
        for cb in heap.ready_callbacks(Instant::now()) {
            cb();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cancel_after_fire_returns_not_found() {
        let mut heap = TimerHeap::new();
        let handle = heap.schedule(Duration::from_millis(1), 0, Box::new(|| {})).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let ready = heap.ready_callbacks(Instant::now());
        assert_eq!(ready.len(), 1);
        for cb in ready {
            cb();
        }

        assert!(matches!(heap.cancel(&handle), Err(LoopError::TimerNotFound)));
    }

    #[test]
    fn nesting_clamp_raises_short_delays() {
        let mut heap = TimerHeap::new();
        heap.schedule(Duration::from_millis(0), NESTING_CLAMP_DEPTH + 1, Box::new(|| {}))
            .unwrap();
        let deadline = heap.earliest_deadline().unwrap();
        assert!(deadline >= Instant::now() + Duration::from_millis(3));
    }

    #[test]
    fn shallow_nesting_does_not_clamp() {
        let mut heap = TimerHeap::new();
        let before = Instant::now();
        heap.schedule(Duration::from_millis(0), 1, Box::new(|| {})).unwrap();
        let deadline = heap.earliest_deadline().unwrap();
        assert!(deadline - before < NESTING_CLAMP_FLOOR);
    }
}
