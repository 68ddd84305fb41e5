// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Loop metrics: a block of counters updated with `Relaxed` ordering
//! from the loop thread and read from any thread.
//!
//! Counters are always incremented, `Metrics: true` or not, so the hot
//! path has a single code shape; the host simply chooses whether to
//! read them.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct LoopMetrics {
    tasks_run: AtomicU64,
    microtasks_run: AtomicU64,
    timers_fired: AtomicU64,
    promises_created: AtomicU64,
    promises_settled: AtomicU64,
    unhandled_rejections: AtomicU64,
}

impl LoopMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_task_run(&self) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_microtask_run(&self) {
        self.microtasks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_fired(&self) {
        self.timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promise_created(&self) {
        self.promises_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promise_settled(&self) {
        self.promises_settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhandled_rejection(&self) {
        self.unhandled_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.load(Ordering::Relaxed)
    }

    pub fn microtasks_run(&self) -> u64 {
        self.microtasks_run.load(Ordering::Relaxed)
    }

    pub fn timers_fired(&self) -> u64 {
        self.timers_fired.load(Ordering::Relaxed)
    }

    pub fn promises_created(&self) -> u64 {
        self.promises_created.load(Ordering::Relaxed)
    }

    pub fn promises_settled(&self) -> u64 {
        self.promises_settled.load(Ordering::Relaxed)
    }

    pub fn unhandled_rejections(&self) -> u64 {
        self.unhandled_rejections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let m = LoopMetrics::new();
        assert_eq!(m.tasks_run(), 0);
        m.record_task_run();
        m.record_task_run();
        m.record_timer_fired();
        assert_eq!(m.tasks_run(), 2);
        assert_eq!(m.timers_fired(), 1);
    }
}
