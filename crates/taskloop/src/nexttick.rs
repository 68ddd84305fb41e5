// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! NextTick queue: same contract as the microtask ring, drained first
//! on every microtask checkpoint.

use crate::ring::TaskRing;
use crate::task::Callback;

pub struct NextTickQueue {
    ring: TaskRing,
}

impl NextTickQueue {
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

impl Default for NextTickQueue {
    fn default() -> Self {
        Self::new()
    }
}
