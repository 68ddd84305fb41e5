// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Microtask queue: a thin, named wrapper over
//! `TaskRing` so the scheduler can keep "microtasks" and "nextTick"
//! distinct types even though they share an implementation.

use crate::ring::TaskRing;
use crate::task::Callback;

pub struct MicrotaskQueue {
    ring: TaskRing,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self { ring: TaskRing::new() }
    }

    pub fn push(&self, cb: Callback) {
        self.ring.push(cb);
    }

    pub fn pop(&self) -> Option<Callback> {
        self.ring.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn drain_all(&self) {
        self.ring.drain_all();
    }
}

impl Default for MicrotaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
