// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A thread-pool-backed FIFO run queue.
//!
//! Grounded on the worker loop shape of `kasync::executor::Worker::run` (tick
//! → fetch-next → execute), simplified from work-stealing across per-worker
//! queues down to one shared FIFO, since nothing here calls for work
//! stealing: tasks carry plain callbacks, not futures that re-park
//! mid-poll.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::RunQueueError;
use crate::task::Task;

#[derive(Clone)]
pub struct RunQueue {
    shared: Arc<Shared>,
}

struct QueueState {
    queue: VecDeque<Task>,
    shutting_down: bool,
}

struct Shared {
    // `shutting_down` lives behind the *same* mutex as `queue`, not a
    // separate one: a worker must observe "empty and shutting down" as a
    // single atomic check before calling `Condvar::wait`, or a `shutdown`
    // that flips the flag and notifies between the worker's check and its
    // `wait` call would be a lost wakeup.
    state: Mutex<QueueState>,
    not_empty: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RunQueue {
    /// Spawn `num_workers` worker threads backing a shared FIFO queue.
    ///
    /// # Errors
    /// Returns [`RunQueueError::Spawn`] if any worker thread fails to spawn.
    /// Threads already spawned before the failure are shut down before the
    /// error is returned, so no threads leak.
    pub fn new(num_workers: usize) -> Result<Self, RunQueueError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
        });

        for idx in 0..num_workers {
            let shared_for_worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("strandio-run-{idx}"))
                .spawn(move || worker_loop(&shared_for_worker));

            match spawned {
                Ok(handle) => shared.workers.lock().unwrap().push(handle),
                Err(err) => {
                    let this = Self { shared };
                    this.shutdown();
                    return Err(RunQueueError::Spawn(err));
                }
            }
        }

        Ok(Self { shared })
    }

    /// Enqueue `task` with `callback` attached; a worker will run it in FIFO
    /// order relative to other calls to `exec`.
    ///
    /// This call never blocks and never fails: enqueueing onto the shared
    /// `VecDeque` is infallible.
    pub fn exec(&self, task: Task, callback: Box<dyn FnOnce(&Task) + Send + 'static>) {
        task.install(callback);
        self.shared.state.lock().unwrap().queue.push_back(task);
        self.shared.not_empty.notify_one();
    }

    /// Signal all workers to drain the queue and exit, then join them.
    ///
    /// Shutdown is explicit rather than `Drop`-triggered: worker threads hold
    /// an `Arc<Shared>` clone, so a `Drop` impl on the last external handle
    /// would never run while workers are alive, and workers have no reason
    /// to exit on their own. Mirrors an explicit `Executor::stop()` rather
    /// than relying on reference-count races.
    pub fn shutdown(&self) {
        self.shared.state.lock().unwrap().shutting_down = true;
        self.shared.not_empty.notify_all();

        let handles: Vec<JoinHandle<()>> = self.shared.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Number of tasks currently queued but not yet picked up by a worker.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break Some(task);
                }
                if state.shutting_down {
                    break None;
                }
                state = shared.not_empty.wait(state).unwrap();
            }
        };

        let Some(task) = task else {
            tracing::trace!("run queue worker exiting");
            return;
        };

        let Some(callback) = task.take() else {
            tracing::trace!(?task, "task dequeued with no callback attached, skipping");
            continue;
        };

        let span = tracing::trace_span!("task_exec");
        let _guard = span.enter();
        callback(&task);
    }
}

impl std::fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQueue")
            .field("queued_len", &self.queued_len())
            .finish_non_exhaustive()
    }
}
