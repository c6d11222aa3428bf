//! Helpers shared by the kernel test cases.
#![allow(dead_code)]
use std::sync::atomic::{AtomicUsize, Ordering};

use tern_kernel::{KernelTraits, System, TimePoint};

/// Asserts that a set of events is performed in a specific order.
///
/// The test calls `point(x)` with `x` increasing by one with each call,
/// starting from zero. `assert_sequence(y)` passes iff exactly `y` calls
/// were made and all of them arrived in order.
pub struct SequenceAsserter {
    expected: AtomicUsize,
    count: AtomicUsize,
}

impl SequenceAsserter {
    pub const fn new() -> Self {
        Self {
            expected: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    pub fn point(&self, point: usize) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .expected
            .compare_exchange(point, point + 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn assert_sequence(&self, points: usize) {
        assert_eq!(
            self.expected.load(Ordering::SeqCst),
            points,
            "events arrived out of order"
        );
        assert_eq!(
            self.count.load(Ordering::SeqCst),
            points,
            "wrong number of events"
        );
    }
}

/// A lock-free event log for recording scheduling orders from task context.
/// (An OS mutex must not be used there: a preempted holder would stall the
/// simulated processor.)
pub struct EventLog<const N: usize> {
    entries: [AtomicUsize; N],
    len: AtomicUsize,
}

impl<const N: usize> EventLog<N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicUsize = AtomicUsize::new(0);

    pub const fn new() -> Self {
        Self {
            entries: [Self::ZERO; N],
            len: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, value: usize) {
        let i = self.len.fetch_add(1, Ordering::SeqCst);
        self.entries[i].store(value, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<usize> {
        let len = self.len.load(Ordering::SeqCst);
        (0..len)
            .map(|i| self.entries[i].load(Ordering::SeqCst))
            .collect()
    }
}

/// Spin until the tick clock reaches `deadline`, polling the kernel so that
/// pending preemptions are delivered.
pub fn busy_until<Traits: KernelTraits>(deadline: TimePoint) {
    while System::<Traits>::now().unwrap() < deadline {
        std::hint::spin_loop();
    }
}

/// Spin for `ticks` kernel ticks.
pub fn busy_ticks<Traits: KernelTraits>(ticks: i64) {
    let deadline = System::<Traits>::now().unwrap() + tern_kernel::Duration::from_ticks(ticks);
    busy_until::<Traits>(deadline);
}
