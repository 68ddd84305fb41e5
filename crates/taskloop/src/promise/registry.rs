// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Promise registry: id → weak handle, plus a ring buffer walked
//! incrementally by a scavenger. Generalised from a task table of strong
//! `Arc` entries to weak ones, so a promise with no remaining strong
//! handle or subscriber can still be collected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Reason;

/// A promise, type-erased down to the two things the registry cares
/// about: whether it's still worth keeping around, and how to reject it
/// during shutdown. Implemented for every `Promise<T>` in `core.rs`.
pub(crate) trait ErasedPromiseHandle: Send + Sync {
    /// True once the target is gone (dropped) or has reached a terminal
    /// state — either way the registry has nothing left to do for it.
    fn is_collectible(&self) -> bool;
    fn reject_if_pending(&self, reason: Reason);
}

struct Ring {
    slots: Vec<Option<u64>>,
    cursor: usize,
    live: usize,
}

impl Ring {
    fn new() -> Self {
        Self { slots: Vec::new(), cursor: 0, live: 0 }
    }

    fn push(&mut self, id: u64) {
        self.slots.push(Some(id));
        self.live += 1;
    }

    fn occupancy(&self) -> f64 {
        if self.slots.is_empty() {
            1.0
        } else {
            self.live as f64 / self.slots.len() as f64
        }
    }

    /// Drop `None` slots, keeping relative order, and reset the cursor.
    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.live = self.slots.len();
        self.cursor = 0;
    }
}

/// Map from id → weak promise handle, scavenged incrementally rather
/// than all at once.
pub struct PromiseRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Box<dyn ErasedPromiseHandle>>>,
    ring: Mutex<Ring>,
}

/// Below this capacity, compaction isn't worth the rebuild.
const COMPACTION_MIN_CAPACITY: usize = 256;
const COMPACTION_OCCUPANCY_THRESHOLD: f64 = 0.25;

impl PromiseRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            ring: Mutex::new(Ring::new()),
        }
    }

    pub(crate) fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a newly created promise under `id`.
    pub(crate) fn track(&self, id: u64, handle: Box<dyn ErasedPromiseHandle>) {
        self.entries.lock().unwrap().insert(id, handle);
        self.ring.lock().unwrap().push(id);
    }

    /// Walk up to `batch` ring slots starting at the cursor, reclaiming
    /// entries whose target is gone or terminal. Ring slots are nulled
    /// rather than shifted; compaction happens separately once the
    /// cursor wraps and occupancy has dropped low enough to be worth it.
    pub fn scavenge(&self, batch: usize) {
        let mut ring = self.ring.lock().unwrap();
        if ring.slots.is_empty() {
            return;
        }
        let len = ring.slots.len();
        let steps = batch.min(len);
        let mut wrapped = false;

        for _ in 0..steps {
            let idx = ring.cursor;
            if let Some(id) = ring.slots[idx] {
                let collectible = {
                    let entries = self.entries.lock().unwrap();
                    entries.get(&id).map(|h| h.is_collectible()).unwrap_or(true)
                };
                if collectible {
                    self.entries.lock().unwrap().remove(&id);
                    ring.slots[idx] = None;
                    ring.live = ring.live.saturating_sub(1);
                }
            }
            ring.cursor += 1;
            if ring.cursor >= len {
                ring.cursor = 0;
                wrapped = true;
            }
        }

        if wrapped
            && ring.slots.len() >= COMPACTION_MIN_CAPACITY
            && ring.occupancy() < COMPACTION_OCCUPANCY_THRESHOLD
        {
            ring.compact();
        }
    }

    /// Reject every still-pending promise with `reason` and drop the
    /// registry's bookkeeping for it. Only called from the shutdown
    /// drain.
    pub fn reject_all(&self, reason: Reason) {
        let entries = self.entries.lock().unwrap();
        for handle in entries.values() {
            handle.reject_if_pending(reason.clone());
        }
        drop(entries);
        self.entries.lock().unwrap().clear();
        let mut ring = self.ring.lock().unwrap();
        ring.slots.clear();
        ring.cursor = 0;
        ring.live = 0;
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn ring_capacity(&self) -> usize {
        self.ring.lock().unwrap().slots.len()
    }
}

impl Default for PromiseRegistry {
    fn default() -> Self {
        Self::new()
    }
}
