// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A 32-flag mailbox with level-triggered, single-waiter notification.
//!
//! Grounded on `kasync::sync::wait_cell::WaitCell`'s atomic state-machine
//! style (`bitflags` state word, `compare_exchange`-driven transitions,
//! `#[tracing::instrument]` on the public operations), adapted from a
//! single-bit "has a value been set" cell to a 32-bit flag register that
//! callers can `raise` and `wait`/`wait_all` against arbitrary masks of.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::MailboxError;
use crate::runqueue::RunQueue;
use crate::task::{Callback, Task};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Mode {
    /// Satisfied once any bit in the mask is set.
    Any,
    /// Satisfied once every bit in the mask is set.
    All,
}

struct Waiter {
    mask: u32,
    mode: Mode,
    task: Task,
    callback: Callback,
}

impl Waiter {
    fn satisfied_by(&self, state: u32) -> bool {
        match self.mode {
            Mode::Any => state & self.mask != 0,
            Mode::All => state & self.mask == self.mask,
        }
    }
}

/// A handle to a 32-bit flag register shared between raisers and waiters.
///
/// At most one `wait`/`wait_all` may be outstanding at a time; a second
/// registration while one is pending is rejected with
/// [`MailboxError::AlreadyWaiting`] rather than leaving the first waiter's
/// callback unreachable.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<Inner>,
}

struct Inner {
    runq: RunQueue,
    state: AtomicU32,
    waiter: Mutex<Option<Waiter>>,
}

impl Mailbox {
    #[must_use]
    pub fn new(runq: RunQueue) -> Self {
        Self {
            inner: Arc::new(Inner {
                runq,
                state: AtomicU32::new(0),
                waiter: Mutex::new(None),
            }),
        }
    }

    /// Set `bits` in the register (`state |= bits`) and promote the pending
    /// waiter, if any, whose predicate is now satisfied.
    #[tracing::instrument(level = "trace", skip(self), fields(bits = bits))]
    pub fn raise(&self, bits: u32) {
        let state = self.inner.state.fetch_or(bits, Ordering::AcqRel) | bits;
        self.try_promote(state);
    }

    /// Atomically read and clear every currently-set bit, returning the bits
    /// that were set. `take` is the sole operation that clears bits —
    /// satisfying a waiter via `raise` does not.
    pub fn take(&self) -> u32 {
        self.inner.state.swap(0, Ordering::AcqRel)
    }

    /// Peek the current bits without clearing them.
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.inner.state.load(Ordering::Acquire)
    }

    /// Subscribe to be notified once at least one bit in `mask` is set.
    ///
    /// If the predicate is already satisfied, `callback` is scheduled onto
    /// the run queue immediately (still asynchronously, never inline) rather
    /// than stored as a waiter — this is the "level-triggered" behavior:
    /// `wait` checks the current level before arming an edge.
    ///
    /// # Errors
    /// Returns [`MailboxError::AlreadyWaiting`] if a `wait`/`wait_all` is
    /// already pending on this mailbox.
    pub fn wait(&self, mask: u32, task: Task, callback: Callback) -> Result<(), MailboxError> {
        self.subscribe(mask, Mode::Any, task, callback)
    }

    /// Subscribe to be notified once every bit in `mask` is set.
    ///
    /// # Errors
    /// Returns [`MailboxError::AlreadyWaiting`] if a `wait`/`wait_all` is
    /// already pending on this mailbox.
    pub fn wait_all(&self, mask: u32, task: Task, callback: Callback) -> Result<(), MailboxError> {
        self.subscribe(mask, Mode::All, task, callback)
    }

    fn subscribe(
        &self,
        mask: u32,
        mode: Mode,
        task: Task,
        callback: Callback,
    ) -> Result<(), MailboxError> {
        let mut slot = self.inner.waiter.lock().unwrap();
        if slot.is_some() {
            return Err(MailboxError::AlreadyWaiting);
        }

        let waiter = Waiter {
            mask,
            mode,
            task,
            callback,
        };
        let state = self.inner.state.load(Ordering::Acquire);

        if waiter.satisfied_by(state) {
            drop(slot);
            self.inner.runq.exec(waiter.task, waiter.callback);
        } else {
            *slot = Some(waiter);
        }

        Ok(())
    }

    fn try_promote(&self, state: u32) {
        let mut slot = self.inner.waiter.lock().unwrap();
        let promote = match slot.as_ref() {
            Some(waiter) => waiter.satisfied_by(state),
            None => false,
        };
        if !promote {
            return;
        }
        let waiter = slot.take().unwrap();
        drop(slot);
        self.inner.runq.exec(waiter.task, waiter.callback);
    }

    /// Cancel a pending `wait`/`wait_all`, if one is outstanding. Returns
    /// `true` if a waiter was removed.
    pub fn cancel(&self) -> bool {
        self.inner.waiter.lock().unwrap().take().is_some()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("state", &self.peek())
            .field("has_waiter", &self.inner.waiter.lock().unwrap().is_some())
            .finish_non_exhaustive()
    }
}
