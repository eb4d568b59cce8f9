// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The unit of work dispatched through a [`RunQueue`](crate::runqueue::RunQueue).

use std::fmt;
use std::sync::{Arc, Mutex};

/// The closure a [`Task`] runs once it reaches the front of a run queue.
pub(crate) type Callback = Box<dyn FnOnce(&Task) + Send + 'static>;

/// A cheap, cloneable handle to a schedulable unit of work.
///
/// A `Task` carries no payload of its own; callers attach a callback each
/// time they hand it to [`RunQueue::exec`](crate::runqueue::RunQueue::exec),
/// [`WaitQueue::wait`](crate::waitqueue::WaitQueue::wait),
/// [`Mailbox::wait`](crate::mailbox::Mailbox::wait), or
/// [`FdWatch::wait`](crate::ioqueue::FdWatch::wait). A `Task` must not be
/// submitted to a second operation while a submission is still pending —
/// this is checked in debug builds and is a caller bug in release builds,
/// matching the "single owner, single pending submission" contract every
/// subsystem in this crate relies on.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

struct Inner {
    callback: Mutex<Option<Callback>>,
}

impl Task {
    /// Create a fresh, idle task.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                callback: Mutex::new(None),
            }),
        }
    }

    /// Returns `true` if this and `other` are handles to the same task.
    #[must_use]
    pub fn is_same(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach the callback to run when this task is next executed.
    ///
    /// # Panics
    /// Panics in debug builds if a callback is already attached.
    pub(crate) fn install(&self, callback: Callback) {
        let mut slot = self.inner.callback.lock().unwrap();
        debug_assert!(
            slot.is_none(),
            "task submitted while a previous submission is still pending"
        );
        *slot = Some(callback);
    }

    /// Take the attached callback, if any, leaving the task idle again.
    pub(crate) fn take(&self) -> Option<Callback> {
        self.inner.callback.lock().unwrap().take()
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("addr", &Arc::as_ptr(&self.inner))
            .field("pending", &self.inner.callback.lock().unwrap().is_some())
            .finish_non_exhaustive()
    }
}
