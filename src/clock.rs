// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Time source abstraction for [`WaitQueue`](crate::waitqueue::WaitQueue).
//!
//! A hand-rolled vtable over an `unsafe` pointer makes sense for a `no_std`
//! executor that cannot assume a `dyn Trait` vtable layout. This crate is
//! hosted (`std`-only), so `dyn Clock` already gives us that indirection
//! safely; an `unsafe` reimplementation would buy nothing. See `DESIGN.md`
//! for the full rationale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// A monotonic millisecond time source.
///
/// Implementors must be monotonic: successive calls to `now_ms` never
/// decrease. [`WaitQueue`](crate::waitqueue::WaitQueue) deadlines are computed
/// as `now_ms() + delay_ms`, so a clock that jumps backwards can delay or
/// reorder timer firing but never causes unsoundness.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since some fixed, implementation-defined epoch.
    fn now_ms(&self) -> u64;
}

/// The real wall clock, backed by [`std::time::Instant`].
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }
}

/// A manually-advanced clock for deterministic timer tests.
///
/// Deliberately simpler than a `schedule_wakeup`-hooked mock clock:
/// [`WaitQueue`](crate::waitqueue::WaitQueue) reads
/// the clock only when it is itself polled (from `next_deadline`/`dispatch`),
/// it never asks the clock to call back.
#[derive(Debug)]
pub struct MockClock {
    now_ms: AtomicU64,
    #[expect(dead_code, reason = "retained for Debug/inspection in tests")]
    log: Mutex<Vec<u64>>,
}

impl MockClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now_ms: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward by `millis` and return the new reading.
    pub fn advance(&self, millis: u64) -> u64 {
        let new = self.now_ms.fetch_add(millis, Ordering::SeqCst) + millis;
        self.log.lock().unwrap().push(new);
        new
    }

    /// Jump directly to an absolute reading. Must not move the clock backwards.
    pub fn set(&self, millis: u64) {
        self.now_ms.store(millis, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
