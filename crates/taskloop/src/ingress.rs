// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ingress queue: unbounded MPSC FIFO of `Task`s.
//!
//! Vyukov-style intrusive MPSC queue. `tail` is the producers' append
//! point: a producer claims its slot with one atomic swap of `tail` —
//! the queue's linearisation point — and then stores the forward link
//! on the node it displaced. Between those two steps a concurrent
//! consumer can observe a node whose `next` is still null even though
//! it isn't actually the end of the queue — the consumer distinguishes
//! that from genuine emptiness by comparing its own cursor (`head`)
//! against `tail`, and structurally spins (yielding) until the link
//! appears.
//!
//! Freed nodes return to a small Treiber-stack free list so steady-state
//! pushes acquire a node from the pool instead of calling the
//! allocator: no allocation on the hot producer path beyond node
//! acquisition from that pool.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::task::Task;

struct Node {
    next: AtomicPtr<Node>,
    data: Option<Task>,
}

impl Node {
    fn stub() -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            data: None,
        }))
    }
}

/// Treiber-stack free list recycling `Node` allocations.
struct NodePool {
    top: AtomicPtr<Node>,
}

impl NodePool {
    fn new() -> Self {
        Self {
            top: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pop a free node, or allocate a fresh one if the pool is empty.
    fn acquire(&self, data: Task) -> *mut Node {
        loop {
            let top = self.top.load(Ordering::Acquire);
            if top.is_null() {
                return Box::into_raw(Box::new(Node {
                    next: AtomicPtr::new(ptr::null_mut()),
                    data: Some(data),
                }));
            }
            // SAFETY: `top` came from this pool; nodes are only ever
            // linked back in by `release`, which never exposes a node
            // that is concurrently reachable from the queue itself.
            let next = unsafe { (*top).next.load(Ordering::Acquire) };
            if self
                .top
                .compare_exchange(top, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe {
                    (*top).next.store(ptr::null_mut(), Ordering::Relaxed);
                    (*top).data = Some(data);
                }
                return top;
            }
        }
    }

    /// Return a dequeued node to the pool for reuse.
    fn release(&self, node: *mut Node) {
        loop {
            let top = self.top.load(Ordering::Acquire);
            unsafe {
                (*node).next.store(top, Ordering::Relaxed);
            }
            if self
                .top
                .compare_exchange(top, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        let mut cur = self.top.load(Ordering::Acquire);
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Acquire) };
            unsafe {
                drop(Box::from_raw(cur));
            }
            cur = next;
        }
    }
}

/// Unbounded multi-producer single-consumer FIFO queue of `Task`s.
pub struct IngressQueue {
    tail: AtomicPtr<Node>,
    head: AtomicPtr<Node>,
    pool: NodePool,
    len: AtomicUsize,
}

// SAFETY: all mutation goes through atomics or the consumer-only `head`
// cursor; `Node::data` is only ever read by the single consumer after
// the link making it reachable has been published with Release.
unsafe impl Send for IngressQueue {}
unsafe impl Sync for IngressQueue {}

impl IngressQueue {
    pub fn new() -> Self {
        let stub = Node::stub();
        Self {
            tail: AtomicPtr::new(stub),
            head: AtomicPtr::new(stub),
            pool: NodePool::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Push a task. Wait-free beyond node acquisition; never blocks.
    pub fn push(&self, task: Task) {
        let node = self.pool.acquire(task);
        // Linearisation point: claim the append slot.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // Publish the link. Between the swap above and this store, a
        // concurrent consumer walking from `head` toward `prev` sees
        // `prev.next == null` despite `prev` no longer being the real
        // tail — the documented structural-spin window.
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop one task. May structurally spin (yielding) across the window
    /// described on `IngressQueue`; returns `None` only once the queue
    /// is genuinely empty.
    pub fn pop(&self) -> Option<Task> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                let tail = self.tail.load(Ordering::Acquire);
                if head == tail {
                    return None; // genuinely empty
                }
                // A producer has claimed `tail` but not yet linked its
                // node onto `head`'s chain. Spin-yield, never panic.
                std::thread::yield_now();
                continue;
            }
            // SAFETY: `next` is reachable and stays alive: the consumer
            // is the only thread that frees nodes, and it only does so
            // after advancing `head` past them.
            let data = unsafe { (*next).data.take() };
            self.head.store(next, Ordering::Release);
            self.pool.release(head);
            self.len.fetch_sub(1, Ordering::Relaxed);
            return data;
        }
    }

    /// Pop up to `max` tasks into `buf`, returning how many were popped.
    pub fn pop_batch(&self, buf: &mut Vec<Task>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.pop() {
                Some(task) => {
                    buf.push(task);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Approximate length; monotone under applied ops, not a
    /// linearisation point.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IngressQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IngressQueue {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        // Free the remaining stub.
        let stub = self.head.load(Ordering::Acquire);
        unsafe {
            drop(Box::from_raw(stub));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn task(n: i64, out: Arc<AtomicI64>) -> Task {
        Box::new(move || {
            out.fetch_add(n, Ordering::Relaxed);
        })
    }

    #[test]
    fn push_pop_fifo_single_thread() {
        let q = IngressQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            q.push(Box::new(move || order.lock().unwrap().push(i)));
        }
        let mut seen = Vec::new();
        while let Some(t) = q.pop() {
            t();
        }
        seen.extend(order.lock().unwrap().iter().copied());
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn empty_queue_pops_none() {
        let q = IngressQueue::new();
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_producers_single_consumer_preserves_count() {
        let q = Arc::new(IngressQueue::new());
        let total = Arc::new(AtomicI64::new(0));
        let producers = 8;
        let per_producer = 500;
        let barrier = Arc::new(Barrier::new(producers));
        let mut handles = vec![];

        for p in 0..producers {
            let q = q.clone();
            let total = total.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..per_producer {
                    q.push(task(1, total.clone()));
                    let _ = (p, i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut popped = 0;
        while let Some(t) = q.pop() {
            t();
            popped += 1;
        }
        assert_eq!(popped, producers * per_producer);
        assert_eq!(total.load(Ordering::Relaxed), (producers * per_producer) as i64);
    }

    #[test]
    fn pop_batch_respects_max() {
        let q = IngressQueue::new();
        for _ in 0..5 {
            q.push(Box::new(|| {}));
        }
        let mut buf = Vec::new();
        let n = q.pop_batch(&mut buf, 3);
        assert_eq!(n, 3);
        assert_eq!(q.len(), 2);
    }
}
