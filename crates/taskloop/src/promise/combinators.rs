// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Promise combinators: all/race/allSettled/any. Each
//! builds a fresh result promise and subscribes to every input; the
//! short-circuit is first-terminal-write on the result, not
//! cancellation of the remaining inputs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LoopError;
use crate::promise::core::{Promise, Settlement, ThenOutcome};
use crate::promise::registry::PromiseRegistry;
use crate::promise::unhandled::UnhandledTracker;
use crate::scheduler::Scheduler;

/// Per-input outcome recorded by `all_settled`.
pub enum SettledResult<T> {
    Fulfilled(Arc<T>),
    Rejected(crate::error::Reason),
}

/// Resolves with every input's value, in input order, once all have
/// resolved; rejects with the first rejection reason. Empty input
/// resolves immediately with an empty vector.
pub fn all<T: Send + Sync + 'static>(
    scheduler: &Arc<Scheduler>,
    registry: &Arc<PromiseRegistry>,
    tracker: &Arc<UnhandledTracker>,
    promises: Vec<Promise<T>>,
) -> Promise<Vec<Arc<T>>> {
    let result = Promise::new_pending(scheduler, registry, tracker);
    if promises.is_empty() {
        result.resolve(Vec::new());
        return result;
    }

    let n = promises.len();
    let slots: Arc<Mutex<Vec<Option<Arc<T>>>>> = Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let remaining = Arc::new(AtomicUsize::new(n));

    for (i, p) in promises.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let result = result.clone();
        p.subscribe(move |settlement| match settlement {
            Settlement::Resolved(v) => {
                slots.lock().unwrap()[i] = Some(v);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values = slots.lock().unwrap().iter_mut().map(|s| s.take().unwrap()).collect();
                    result.resolve(values);
                }
            }
            Settlement::Rejected(r) => result.reject(r),
        });
    }

    result
}

/// Settles with whichever input settles first. Empty input never
/// settles.
pub fn race<T: Send + Sync + 'static>(
    scheduler: &Arc<Scheduler>,
    registry: &Arc<PromiseRegistry>,
    tracker: &Arc<UnhandledTracker>,
    promises: Vec<Promise<T>>,
) -> Promise<T> {
    let result = Promise::new_pending(scheduler, registry, tracker);
    for p in promises {
        let result = result.clone();
        p.subscribe(move |settlement| result.settle(settlement));
    }
    result
}

/// Resolves with a `SettledResult` per input, in input order, once
/// every input has settled. Never rejects. Empty input resolves
/// immediately with an empty vector.
pub fn all_settled<T: Send + Sync + 'static>(
    scheduler: &Arc<Scheduler>,
    registry: &Arc<PromiseRegistry>,
    tracker: &Arc<UnhandledTracker>,
    promises: Vec<Promise<T>>,
) -> Promise<Vec<SettledResult<T>>> {
    let result = Promise::new_pending(scheduler, registry, tracker);
    if promises.is_empty() {
        result.resolve(Vec::new());
        return result;
    }

    let n = promises.len();
    let slots: Arc<Mutex<Vec<Option<SettledResult<T>>>>> =
        Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let remaining = Arc::new(AtomicUsize::new(n));

    for (i, p) in promises.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let result = result.clone();
        p.subscribe(move |settlement| {
            let entry = match settlement {
                Settlement::Resolved(v) => SettledResult::Fulfilled(v),
                Settlement::Rejected(r) => SettledResult::Rejected(r),
            };
            slots.lock().unwrap()[i] = Some(entry);
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let values = slots.lock().unwrap().iter_mut().map(|s| s.take().unwrap()).collect();
                result.resolve(values);
            }
        });
    }

    result
}

/// Resolves with the first fulfilled value; rejects with an
/// `AggregateError` wrapping every rejection reason, in input order,
/// once every input has rejected. Empty input rejects immediately with
/// an `AggregateError` containing a single sentinel reason.
pub fn any<T: Send + Sync + 'static>(
    scheduler: &Arc<Scheduler>,
    registry: &Arc<PromiseRegistry>,
    tracker: &Arc<UnhandledTracker>,
    promises: Vec<Promise<T>>,
) -> Promise<T> {
    let result = Promise::new_pending(scheduler, registry, tracker);
    if promises.is_empty() {
        result.reject(Arc::new(LoopError::aggregate(
            vec![crate::error::reason("no promises were provided")],
            "no promises were provided",
        )));
        return result;
    }

    let n = promises.len();
    let errs: Arc<Mutex<Vec<Option<crate::error::Reason>>>> = Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let remaining = Arc::new(AtomicUsize::new(n));

    for (i, p) in promises.into_iter().enumerate() {
        let errs = errs.clone();
        let remaining = remaining.clone();
        let result = result.clone();
        p.subscribe(move |settlement| match settlement {
            Settlement::Resolved(v) => result.settle(Settlement::Resolved(v)),
            Settlement::Rejected(r) => {
                errs.lock().unwrap()[i] = Some(r);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let errors = errs.lock().unwrap().iter_mut().map(|e| e.take().unwrap()).collect();
                    result.reject(Arc::new(LoopError::aggregate(errors, "all promises were rejected")));
                }
            }
        });
    }

    result
}

/// A nil-handler `then`: inherits the parent's state and value verbatim.
pub fn passthrough<T: Send + Sync + 'static>(p: &Promise<T>) -> Promise<T> {
    p.then(|v| ThenOutcome::Value(v), |r| ThenOutcome::Reject(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::promise::core::PromiseState;

    fn harness() -> (Arc<Scheduler>, Arc<PromiseRegistry>, Arc<UnhandledTracker>) {
        let sched = Scheduler::new(LoopConfig::new());
        let tracker = UnhandledTracker::new(&sched);
        (sched, Arc::new(PromiseRegistry::new()), tracker)
    }

    #[test]
    fn all_resolves_in_input_order_regardless_of_settlement_order() {
        let (sched, reg, tr) = harness();
        let a = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let b = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let combined = all(&sched, &reg, &tr, vec![a.clone(), b.clone()]);
        b.resolve(2);
        a.resolve(1);
        sched.tick();
        let values = combined.value().unwrap();
        assert_eq!(values.iter().map(|v| **v).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn all_rejects_with_first_rejection_and_ignores_later_ones() {
        let (sched, reg, tr) = harness();
        let a = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let b = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let combined = all(&sched, &reg, &tr, vec![a.clone(), b.clone()]);
        a.reject(crate::error::reason("first"));
        b.reject(crate::error::reason("second"));
        sched.tick();
        assert_eq!(combined.reason().unwrap().to_string(), "first");
    }

    #[test]
    fn all_empty_input_resolves_immediately() {
        let (sched, reg, tr) = harness();
        let combined: Promise<Vec<Arc<i32>>> = all(&sched, &reg, &tr, Vec::new());
        assert_eq!(combined.state(), PromiseState::Resolved);
        assert!(combined.value().unwrap().is_empty());
    }

    #[test]
    fn race_settles_with_first_input() {
        let (sched, reg, tr) = harness();
        let a = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let b = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let winner = race(&sched, &reg, &tr, vec![a.clone(), b.clone()]);
        b.resolve(99);
        a.resolve(1);
        sched.tick();
        assert_eq!(*winner.value().unwrap(), 99);
    }

    #[test]
    fn all_settled_never_rejects() {
        let (sched, reg, tr) = harness();
        let a = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let b = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let combined = all_settled(&sched, &reg, &tr, vec![a.clone(), b.clone()]);
        a.resolve(1);
        b.reject(crate::error::reason("nope"));
        sched.tick();
        let results = combined.value().unwrap();
        assert!(matches!(&results[0], SettledResult::Fulfilled(v) if **v == 1));
        assert!(matches!(&results[1], SettledResult::Rejected(_)));
    }

    #[test]
    fn any_resolves_with_first_fulfilled() {
        let (sched, reg, tr) = harness();
        let a = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let b = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let winner = any(&sched, &reg, &tr, vec![a.clone(), b.clone()]);
        a.reject(crate::error::reason("nope"));
        b.resolve(7);
        sched.tick();
        assert_eq!(*winner.value().unwrap(), 7);
    }

    #[test]
    fn any_rejects_with_aggregate_error_once_all_reject() {
        let (sched, reg, tr) = harness();
        let a = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let b = Promise::<i32>::new_pending(&sched, &reg, &tr);
        let result = any(&sched, &reg, &tr, vec![a.clone(), b.clone()]);
        a.reject(crate::error::reason("one"));
        b.reject(crate::error::reason("two"));
        sched.tick();
        assert!(matches!(result.state(), PromiseState::Rejected));
        assert!(result.reason().unwrap().to_string().contains("all promises were rejected"));
    }

    #[test]
    fn any_empty_input_rejects_with_sentinel() {
        let (sched, reg, tr) = harness();
        let result: Promise<i32> = any(&sched, &reg, &tr, Vec::new());
        assert!(result.reason().unwrap().to_string().contains("no promises were provided"));
    }
}
