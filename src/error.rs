// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// Failure modes for [`RunQueue::new`](crate::runqueue::RunQueue::new).
#[derive(Debug)]
pub enum RunQueueError {
    /// Spawning one of the `N` worker threads failed.
    Spawn(io::Error),
}

impl fmt::Display for RunQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunQueueError::Spawn(err) => write!(f, "failed to spawn worker thread: {err}"),
        }
    }
}

impl std::error::Error for RunQueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunQueueError::Spawn(err) => Some(err),
        }
    }
}

/// Misuse detected on a [`Mailbox`](crate::mailbox::Mailbox).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxError {
    /// A second `wait`/`wait_all` was attempted while one was already pending.
    ///
    /// Turned into a checked precondition (returning this error) rather than
    /// left as unchecked API misuse; see `DESIGN.md`.
    AlreadyWaiting,
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxError::AlreadyWaiting => f.write_str("mailbox already has a pending waiter"),
        }
    }
}

impl std::error::Error for MailboxError {}

/// Failure modes for [`IoQueue`](crate::ioqueue::IoQueue) and [`FdWatch`](crate::ioqueue::FdWatch).
#[derive(Debug)]
pub enum IoQueueError {
    /// Constructing the run queue failed.
    RunQueue(RunQueueError),
    /// The OS readiness poller rejected an operation (creation, `add`, `modify`, `delete`).
    Poller(io::Error),
    /// A second `wait` was attempted on an `FdWatch` while one was already pending.
    AlreadyWaiting,
}

impl fmt::Display for IoQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoQueueError::RunQueue(err) => write!(f, "{err}"),
            IoQueueError::Poller(err) => write!(f, "OS poller error: {err}"),
            IoQueueError::AlreadyWaiting => f.write_str("fd watch already has a pending wait"),
        }
    }
}

impl std::error::Error for IoQueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoQueueError::RunQueue(err) => Some(err),
            IoQueueError::Poller(err) => Some(err),
            IoQueueError::AlreadyWaiting => None,
        }
    }
}
