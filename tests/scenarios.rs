// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios exercising the run queue, wait queue, mailbox, and
//! I/O queue together rather than in isolation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use strandio::{IoQueue, Mailbox, MockClock, RunQueue, SystemClock, Task, WaitQueue};

const FLAG_DONE: u32 = 0b0001;
const FLAG_A: u32 = 0b0001;
const FLAG_B: u32 = 0b0010;
const QUEUE_READY: u32 = 0b0001;

/// Installs a `tracing` subscriber scoped to the returned guard's lifetime,
/// following `RUST_LOG` (nothing shown if unset). Mirrors the per-test
/// `tracing_subscriber::fmt()...set_default()` pattern `kasync::executor`'s
/// own tests use to observe worker activity while debugging a flaky run.
fn trace_subscriber() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}

/// A single timer re-armed ten times from its own callback, signaling a
/// mailbox flag on the tenth firing. The driving loop polls `iterate` and
/// advances a `MockClock` by hand so the ten firings are deterministic.
#[test]
fn counter_fires_exactly_ten_times_then_signals_done() {
    let _trace = trace_subscriber();
    let clock = Arc::new(MockClock::new());
    let ioq = IoQueue::new(2, clock.clone()).unwrap();
    let mailbox = Mailbox::new(ioq.runq().clone());
    let count = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    fn arm(
        ioq: IoQueue,
        mailbox: Mailbox,
        count: Arc<AtomicU32>,
        seen: Arc<Mutex<Vec<u32>>>,
    ) {
        let ioq_for_cb = ioq.clone();
        ioq.waitq().wait(
            1,
            Task::new(),
            Box::new(move |_| {
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                seen.lock().unwrap().push(n);
                if n < 10 {
                    arm(ioq_for_cb, mailbox, count, seen);
                } else {
                    mailbox.raise(FLAG_DONE);
                }
            }),
        );
    }

    arm(ioq.clone(), mailbox.clone(), count.clone(), seen.clone());

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        clock.advance(1);
        ioq.iterate(Some(Duration::from_millis(20))).unwrap();
        if mailbox.peek() & FLAG_DONE != 0 {
            break;
        }
        assert!(Instant::now() < deadline, "counter never reached ten");
    }

    assert_eq!(mailbox.take(), FLAG_DONE);
    assert_eq!(*seen.lock().unwrap(), (1..=10).collect::<Vec<_>>());
    ioq.shutdown();
}

/// Two run-queue tasks each raise their own flag; a single `wait_all`
/// subscriber must fire exactly once, after both flags are set, and see both
/// bits via `take` from inside its own callback.
#[test]
fn fork_join_wait_all_fires_once_after_both_flags_raised() {
    let _trace = trace_subscriber();
    let runq = RunQueue::new(4).unwrap();
    let mailbox = Mailbox::new(runq.clone());
    let fire_count = Arc::new(AtomicU32::new(0));
    let observed = Arc::new(Mutex::new(0u32));

    {
        let mailbox_for_cb = mailbox.clone();
        let fire_count = fire_count.clone();
        let observed = observed.clone();
        mailbox
            .wait_all(
                FLAG_A | FLAG_B,
                Task::new(),
                Box::new(move |_| {
                    fire_count.fetch_add(1, Ordering::SeqCst);
                    *observed.lock().unwrap() = mailbox_for_cb.take();
                }),
            )
            .unwrap();
    }

    let mailbox_a = mailbox.clone();
    runq.exec(Task::new(), Box::new(move |_| mailbox_a.raise(FLAG_A)));
    let mailbox_b = mailbox.clone();
    runq.exec(Task::new(), Box::new(move |_| mailbox_b.raise(FLAG_B)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while fire_count.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "wait_all callback never fired");
        std::thread::sleep(Duration::from_millis(1));
    }

    // Give a buggy implementation a chance to double-fire before asserting.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    assert_eq!(*observed.lock().unwrap(), FLAG_A | FLAG_B);
    runq.shutdown();
}

/// One thousand producers append under an external mutex and raise
/// `QUEUE_READY`; a single consumer drains to empty and re-subscribes each
/// time it wakes. No item may be lost to a race between "queue looked empty"
/// and "producer raised the flag".
#[test]
fn producer_consumer_drains_every_item_without_loss() {
    let _trace = trace_subscriber();
    const TOTAL: u32 = 1000;

    let runq = RunQueue::new(8).unwrap();
    let mailbox = Mailbox::new(runq.clone());
    let queue: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new(VecDeque::new()));
    let drained: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let consumed = Arc::new(AtomicU32::new(0));

    fn resubscribe(
        mailbox: Mailbox,
        queue: Arc<Mutex<VecDeque<u32>>>,
        drained: Arc<Mutex<Vec<u32>>>,
        consumed: Arc<AtomicU32>,
    ) {
        let mailbox_for_cb = mailbox.clone();
        mailbox
            .wait(
                QUEUE_READY,
                Task::new(),
                Box::new(move |_| {
                    mailbox_for_cb.take();
                    loop {
                        let item = queue.lock().unwrap().pop_front();
                        match item {
                            Some(item) => {
                                drained.lock().unwrap().push(item);
                                consumed.fetch_add(1, Ordering::SeqCst);
                            }
                            None => break,
                        }
                    }
                    if consumed.load(Ordering::SeqCst) < TOTAL {
                        resubscribe(mailbox_for_cb, queue, drained, consumed);
                    }
                }),
            )
            .unwrap();
    }

    resubscribe(mailbox.clone(), queue.clone(), drained.clone(), consumed.clone());

    let producers: Vec<_> = (0..TOTAL)
        .map(|i| {
            let queue = queue.clone();
            let mailbox = mailbox.clone();
            std::thread::spawn(move || {
                queue.lock().unwrap().push_back(i);
                mailbox.raise(QUEUE_READY);
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    while consumed.load(Ordering::SeqCst) < TOTAL {
        assert!(Instant::now() < deadline, "consumer stalled before draining every item");
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut seen = drained.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..TOTAL).collect::<Vec<_>>());
    runq.shutdown();
}

/// Two timers armed for the same deadline must both promote out of a single
/// `dispatch` call, in the order they were armed.
#[test]
fn equal_deadline_timers_both_promote_in_arming_order() {
    let _trace = trace_subscriber();
    let clock = Arc::new(MockClock::new());
    let runq = RunQueue::new(2).unwrap();
    let wq = WaitQueue::new(clock.clone(), runq.clone(), None);
    let (tx, rx) = std::sync::mpsc::channel();

    for label in ["first", "second"] {
        let tx = tx.clone();
        wq.wait(5, Task::new(), Box::new(move |_| tx.send(label).unwrap()));
    }
    drop(tx);

    clock.advance(5);
    assert_eq!(wq.dispatch(0), 2, "both timers share a deadline and must promote together");

    assert_eq!(rx.recv().unwrap(), "first");
    assert_eq!(rx.recv().unwrap(), "second");
    runq.shutdown();
}

/// Racing `cancel` against `dispatch` for a zero-delay timer must never run
/// the callback twice — and, since `cancel` reschedules to an immediate
/// deadline rather than discarding the callback, must also never run it
/// zero times: whichever side reaches the shared entry first, the callback
/// ends up promoted exactly once.
#[test]
fn cancel_racing_a_zero_delay_fire_never_double_fires() {
    let _trace = trace_subscriber();
    let clock = Arc::new(MockClock::new());
    let runq = RunQueue::new(2).unwrap();
    let wq = WaitQueue::new(clock, runq.clone(), None);

    for _ in 0..200 {
        let fire_count = Arc::new(AtomicU32::new(0));
        let fire_count_cb = fire_count.clone();
        let timer = wq.wait(0, Task::new(), Box::new(move |_| {
            fire_count_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let wq_for_cancel = wq.clone();
        let timer_for_cancel = timer.clone();
        let canceller = std::thread::spawn(move || wq_for_cancel.cancel(&timer_for_cancel));
        let wq_for_dispatch = wq.clone();
        let dispatcher = std::thread::spawn(move || wq_for_dispatch.dispatch(0));

        canceller.join().unwrap();
        dispatcher.join().unwrap();
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(
            fire_count.load(Ordering::SeqCst),
            1,
            "cancel reschedules to an immediate deadline, it never suppresses the callback"
        );
    }

    runq.shutdown();
}

/// A timer armed for the far future, cancelled before it could ever fire,
/// is rearmed to an immediate deadline but never actually promoted: nothing
/// drives a further `dispatch` before `IoQueue::shutdown`, which only joins
/// the run queue and never drains the wait queue itself. So no callback
/// runs and teardown completes without blocking.
#[test]
fn shutdown_after_cancelling_a_long_pending_timer_runs_no_callback() {
    let _trace = trace_subscriber();
    let ioq = IoQueue::new(2, Arc::new(SystemClock::new())).unwrap();
    let fire_count = Arc::new(AtomicU32::new(0));
    let fire_count_cb = fire_count.clone();

    let timer = ioq.waitq().wait(
        10_000,
        Task::new(),
        Box::new(move |_| {
            fire_count_cb.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(ioq.waitq().cancel(&timer));
    ioq.shutdown();

    assert_eq!(fire_count.load(Ordering::SeqCst), 0);
}
