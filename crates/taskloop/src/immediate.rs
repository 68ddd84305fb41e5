// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Immediate map: bypasses the timer heap entirely by submitting a
//! wrapper task straight to the ingress queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LoopError;
use crate::ingress::IngressQueue;
use crate::task::{Callback, Task};
use crate::timer::MAX_SAFE_ID;

/// Ids start here to be visually distinguishable from timer ids.
const IMMEDIATE_ID_BASE: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImmediateId(pub u64);

pub struct ImmediateMap {
    entries: Mutex<HashMap<ImmediateId, Arc<AtomicBool>>>,
    next_id: AtomicU64,
}

impl ImmediateMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(IMMEDIATE_ID_BASE),
        })
    }

    /// Register `callback` and submit a wrapper task to `ingress`. If
    /// submission somehow can't happen (caller already knows the loop
    /// is terminating), the entry is removed so it never leaks.
    pub fn set_immediate(
        self: &Arc<Self>,
        ingress: &IngressQueue,
        callback: Callback,
    ) -> Result<ImmediateId, LoopError> {
        let raw_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if raw_id > MAX_SAFE_ID {
            return Err(LoopError::ImmediateIdExhausted);
        }
        let id = ImmediateId(raw_id);
        let cleared = Arc::new(AtomicBool::new(false));
        self.entries.lock().unwrap().insert(id, cleared.clone());

        let map = self.clone();
        let wrapper: Task = Box::new(move || {
            // Panic barrier for this entry: removal happens on drop,
            // so it runs even if `callback` panics.
            struct RemoveGuard {
                map: Arc<ImmediateMap>,
                id: ImmediateId,
            }
            impl Drop for RemoveGuard {
                fn drop(&mut self) {
                    self.map.entries.lock().unwrap().remove(&self.id);
                }
            }
            let _guard = RemoveGuard { map, id };

            // CAS-set cleared before running; a double-clear race means
            // ClearImmediate already won and we must not execute.
            if cleared.swap(true, Ordering::AcqRel) {
                return;
            }
            callback();
        });
        ingress.push(wrapper);
        Ok(id)
    }

    /// CAS-sets the cleared flag. A double-clear, or clearing an id
    /// that already ran or was never registered, returns
    /// `TimerNotFound` — the same "not found" error kind timers and
    /// intervals share.
    pub fn clear_immediate(&self, id: ImmediateId) -> Result<(), LoopError> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(flag) => {
                if flag.swap(true, Ordering::AcqRel) {
                    Err(LoopError::TimerNotFound)
                } else {
                    Ok(())
                }
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
    use std::sync::atomic::AtomicI32;

    #[test]
    fn runs_and_removes_entry() {
        let map = ImmediateMap::new();
        let ingress = IngressQueue::new();
        let fired = Arc::new(AtomicI32::new(0));
        let f = fired.clone();
        map.set_immediate(&ingress, Box::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();
        assert_eq!(map.len(), 1);
        ingress.pop().unwrap()();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn clear_before_run_prevents_execution() {
        let map = ImmediateMap::new();
        let ingress = IngressQueue::new();
        let fired = Arc::new(AtomicI32::new(0));
        let f = fired.clone();
        let id = map
            .set_immediate(&ingress, Box::new(move || {
                f.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        map.clear_immediate(id).unwrap();
        ingress.pop().unwrap()();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn double_clear_returns_not_found() {
        let map = ImmediateMap::new();
        let ingress = IngressQueue::new();
        let id = map.set_immediate(&ingress, Box::new(|| {})).unwrap();
        map.clear_immediate(id).unwrap();
        assert!(matches!(map.clear_immediate(id), Err(LoopError::TimerNotFound)));
    }

    #[test]
    fn ids_start_above_timer_id_space() {
        let map = ImmediateMap::new();
        let ingress = IngressQueue::new();
        let id = map.set_immediate(&ingress, Box::new(|| {})).unwrap();
        assert!(id.0 >= IMMEDIATE_ID_BASE);
    }

    #[test]
    fn panic_in_callback_still_removes_entry() {
        let map = ImmediateMap::new();
        let ingress = IngressQueue::new();
        map.set_immediate(&ingress, Box::new(|| panic!("boom"))).unwrap();
        assert_eq!(map.len(), 1);
        let wrapper = ingress.pop().unwrap();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(wrapper));
        assert_eq!(map.len(), 0);
    }
}
