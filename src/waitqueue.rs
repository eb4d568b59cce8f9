// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadline-ordered timer scheduling.
//!
//! Grounded on `kasync::time::timer::Timer`'s role (own every pending
//! deadline, hand expired entries to the run queue), but a six-level
//! hierarchical wheel is replaced with a single
//! `BTreeMap<(deadline_ms, id), Entry>` — an augmented balanced BST keyed by
//! `(deadline, identity)` — a better fit for a bounded, non-`no_std` timer
//! set than a wheel sized for millions of in-flight timers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::runqueue::RunQueue;
use crate::task::{Callback, Task};

/// A handle to a single pending (or already-fired) timer entry.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    deadline_ms: u64,
}

impl Timer {
    /// The absolute deadline, in clock milliseconds, this timer was armed for.
    #[must_use]
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline_ms", &self.deadline_ms)
            .finish()
    }
}

struct Entry {
    task: Task,
    callback: Callback,
}

struct Core {
    /// Ordered by `(deadline_ms, id)` so equal deadlines tie-break on arming
    /// order (lower id fires first).
    entries: BTreeMap<(u64, u64), Entry>,
    /// Reverse lookup so `cancel`/`reschedule` don't need to scan the map.
    deadlines: HashMap<u64, u64>,
    next_id: u64,
}

/// A deadline-ordered queue of timer entries, each promoted onto a
/// [`RunQueue`] once its deadline elapses.
#[derive(Clone)]
pub struct WaitQueue {
    shared: Arc<Shared>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    runq: RunQueue,
    core: Mutex<Core>,
    /// Invoked, outside of `core`'s lock, whenever a newly armed timer
    /// becomes the new earliest deadline. An `IoQueue` uses this to wake a
    /// poller blocked on a now-stale timeout; bare `WaitQueue` use (no
    /// surrounding reactor) can leave this `None`.
    wakeup: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl WaitQueue {
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        runq: RunQueue,
        wakeup: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                runq,
                core: Mutex::new(Core {
                    entries: BTreeMap::new(),
                    deadlines: HashMap::new(),
                    next_id: 0,
                }),
                wakeup,
            }),
        }
    }

    /// Arm a timer that fires `delay_ms` from now, running `callback` on
    /// `task` via the backing run queue once it elapses.
    pub fn wait(&self, delay_ms: u64, task: Task, callback: Callback) -> Timer {
        let deadline_ms = self.shared.clock.now_ms().saturating_add(delay_ms);
        self.arm(deadline_ms, task, callback)
    }

    fn arm(&self, deadline_ms: u64, task: Task, callback: Callback) -> Timer {
        let mut core = self.shared.core.lock().unwrap();
        let id = core.next_id;
        core.next_id += 1;

        let was_earliest = match core.entries.keys().next() {
            Some(&(earliest, _)) => deadline_ms < earliest,
            None => true,
        };

        core.entries.insert((deadline_ms, id), Entry { task, callback });
        core.deadlines.insert(id, deadline_ms);
        drop(core);

        if was_earliest {
            if let Some(wakeup) = &self.shared.wakeup {
                wakeup();
            }
        }

        Timer { id, deadline_ms }
    }

    /// Cancel `timer`: equivalent to rescheduling it to deadline `0`, i.e.
    /// immediately expired. The callback is *not* discarded — it still fires
    /// on the next `dispatch`, just without waiting out the rest of the
    /// original interval, so the caller must disambiguate a cancellation from
    /// a real completion itself (by elapsed time, a flag taken atomically, or
    /// similar).
    ///
    /// Returns `true` if `timer` was still pending (and has been rearmed to
    /// fire immediately), `false` if it had already been dispatched. Racing
    /// `cancel` against `dispatch` resolves as a silent no-op on the losing
    /// side: if `dispatch` won the race, `timer` is no longer in the set and
    /// `cancel` has nothing left to rearm.
    pub fn cancel(&self, timer: &Timer) -> bool {
        let mut core = self.shared.core.lock().unwrap();
        let Some(deadline_ms) = core.deadlines.get(&timer.id).copied() else {
            return false;
        };
        if deadline_ms == 0 {
            // Already rearmed to fire immediately by an earlier `cancel`;
            // still pending, nothing left to move.
            return true;
        }

        let entry = core.entries.remove(&(deadline_ms, timer.id)).unwrap();
        let was_earliest = match core.entries.keys().next() {
            Some(&(earliest, _)) => 0 < earliest,
            None => true,
        };
        core.entries.insert((0, timer.id), entry);
        core.deadlines.insert(timer.id, 0);
        drop(core);

        if was_earliest {
            if let Some(wakeup) = &self.shared.wakeup {
                wakeup();
            }
        }
        true
    }

    /// Cancel `timer` if still pending and arm a new one `delay_ms` from now
    /// with the same callback. Returns `None` if `timer` had already fired.
    pub fn reschedule(&self, timer: &Timer, delay_ms: u64) -> Option<Timer> {
        let mut core = self.shared.core.lock().unwrap();
        let deadline_ms = core.deadlines.remove(&timer.id)?;
        let entry = core.entries.remove(&(deadline_ms, timer.id))?;
        drop(core);
        Some(self.arm(
            self.shared.clock.now_ms().saturating_add(delay_ms),
            entry.task,
            entry.callback,
        ))
    }

    /// Milliseconds until the earliest pending deadline, or `None` if the
    /// queue is empty. A deadline already in the past reports `0`.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        let core = self.shared.core.lock().unwrap();
        let &(deadline_ms, _) = core.entries.keys().next()?;
        let now_ms = self.shared.clock.now_ms();
        Some(deadline_ms.saturating_sub(now_ms))
    }

    /// Promote entries whose deadline has elapsed onto the run queue, in
    /// deadline order, stopping once `limit` have been promoted (`0` means
    /// unlimited). Returns the number of entries promoted.
    pub fn dispatch(&self, limit: usize) -> usize {
        let now_ms = self.shared.clock.now_ms();
        let expired: Vec<Entry> = {
            let mut core = self.shared.core.lock().unwrap();
            let mut expired = Vec::new();
            loop {
                if limit != 0 && expired.len() >= limit {
                    break;
                }
                let Some(&(deadline_ms, id)) = core.entries.keys().next() else {
                    break;
                };
                if deadline_ms > now_ms {
                    break;
                }
                let entry = core.entries.remove(&(deadline_ms, id)).unwrap();
                core.deadlines.remove(&id);
                expired.push(entry);
            }
            expired
        };

        let count = expired.len();
        for entry in expired {
            self.shared.runq.exec(entry.task, entry.callback);
        }
        count
    }

    /// Number of timers currently pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.core.lock().unwrap().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::mpsc;

    fn test_waitqueue() -> (WaitQueue, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let runq = RunQueue::new(2).unwrap();
        let wq = WaitQueue::new(clock.clone(), runq, None);
        (wq, clock)
    }

    #[test]
    fn fires_only_after_deadline_elapses() {
        let (wq, clock) = test_waitqueue();
        let (tx, rx) = mpsc::channel();

        wq.wait(10, Task::new(), Box::new(move |_| tx.send(()).unwrap()));
        assert_eq!(wq.dispatch(0), 0);
        assert!(rx.try_recv().is_err());

        clock.advance(10);
        assert_eq!(wq.dispatch(0), 1);
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn equal_deadlines_fire_in_arming_order() {
        let (wq, clock) = test_waitqueue();
        let (tx, rx) = mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            wq.wait(5, Task::new(), Box::new(move |_| tx.send(i).unwrap()));
        }
        drop(tx);

        clock.advance(5);
        assert_eq!(wq.dispatch(0), 5);

        let order: Vec<i32> = rx.iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dispatch_respects_a_nonzero_limit() {
        let (wq, clock) = test_waitqueue();
        let (tx, rx) = mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            wq.wait(5, Task::new(), Box::new(move |_| tx.send(i).unwrap()));
        }
        drop(tx);

        clock.advance(5);
        assert_eq!(wq.dispatch(2), 2, "limit caps a single dispatch pass");
        assert_eq!(wq.dispatch(2), 2);
        assert_eq!(wq.dispatch(0), 1, "unlimited pass drains the remainder");
        assert_eq!(wq.dispatch(0), 0);

        let order: Vec<i32> = rx.iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_rearms_a_pending_timer_to_fire_immediately() {
        let (wq, _clock) = test_waitqueue();
        let (tx, rx) = mpsc::channel();
        let timer = wq.wait(100, Task::new(), Box::new(move |_| tx.send(()).unwrap()));

        assert!(wq.cancel(&timer));
        assert!(
            wq.cancel(&timer),
            "re-cancelling a still-pending (not yet dispatched) timer is still a hit"
        );

        assert_eq!(
            wq.dispatch(0),
            1,
            "cancel promotes the original callback immediately, it does not discard it"
        );
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn cancel_loses_race_against_already_fired_timer() {
        let (wq, clock) = test_waitqueue();
        let (tx, rx) = mpsc::channel();
        let timer = wq.wait(1, Task::new(), Box::new(move |_| tx.send(()).unwrap()));

        clock.advance(1);
        assert_eq!(wq.dispatch(0), 1);
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();

        assert!(!wq.cancel(&timer), "already-fired timer cannot be cancelled");
    }

    #[test]
    fn next_deadline_reports_remaining_time() {
        let (wq, clock) = test_waitqueue();
        assert_eq!(wq.next_deadline(), None);

        wq.wait(20, Task::new(), Box::new(|_| {}));
        assert_eq!(wq.next_deadline(), Some(20));

        clock.advance(15);
        assert_eq!(wq.next_deadline(), Some(5));

        clock.advance(15);
        assert_eq!(wq.next_deadline(), Some(0));
    }

    #[test]
    fn reschedule_moves_an_unfired_timer() {
        let (wq, clock) = test_waitqueue();
        let (tx, rx) = mpsc::channel();
        let timer = wq.wait(5, Task::new(), Box::new(move |_| tx.send(()).unwrap()));

        let rescheduled = wq.reschedule(&timer, 50).expect("still pending");
        clock.advance(5);
        assert_eq!(wq.dispatch(0), 0, "original deadline must not fire");

        clock.advance(45);
        assert_eq!(wq.dispatch(0), 1);
        assert_eq!(rescheduled.deadline_ms(), 50);
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }
}
