//! Compile-time kernel configuration.
//!
//! These constants are fixed when the kernel is built, mirroring the Kconfig
//! surface of a classic deeply-embedded RTOS. Boolean options live in Cargo
//! features instead (`signals`, `thread-detach`).

/// The tick frequency in hertz, used by the duration conversion helpers in
/// [`crate::time`]. The port's tick interrupt is expected to fire at this
/// rate.
pub const TICK_FREQUENCY_HZ: u64 = 1000;

/// The number of thread control block slots. Thread creation fails with
/// `EMFILE` once all slots are live.
pub const THREAD_CAPACITY: usize = 32;

/// The number of priority levels. Priorities are `0..PRIORITY_LEVELS`;
/// priority 0 is reserved for the idle thread.
pub const PRIORITY_LEVELS: usize = 256;

/// The smallest stack size accepted by `create_thread` (`ENOSPC` below).
pub const MIN_STACK_SIZE: usize = 256;

/// The stack size used when [`crate::task::ThreadOptions::new`] is not given
/// an explicit one.
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// The stack size of the built-in idle thread.
pub const IDLE_STACK_SIZE: usize = 512;

/// The round-robin time quantum, in ticks. A round-robin thread that runs
/// this many ticks without blocking is rotated behind its equal-priority
/// peers.
pub const ROUND_ROBIN_QUANTUM: u32 = 4;

/// The number of distinct signal numbers. Valid signal numbers are
/// `0..SIGNAL_COUNT`; at most 32.
pub const SIGNAL_COUNT: usize = 32;

/// The per-thread queued-signal capacity. `queue_signal` fails with `EAGAIN`
/// when the receiving thread's queue is full.
pub const SIGNAL_QUEUE_DEPTH: usize = 8;

/// The maximum number of entries in the global timeout heap. Each thread
/// uses at most one entry for its timed wait; the rest are available to
/// software timers, whose `start` fails with `ENOBUFS` when the heap is
/// full.
pub const TIMEOUT_CAPACITY: usize = THREAD_CAPACITY + 32;

/// Catch-up policy for periodic timers that missed one or more periods
/// (e.g. because a handler ran long). `false` = burst-fire every missed
/// period without skipping; `true` = coalesce to the next deadline in the
/// future.
pub const TIMER_COALESCE_MISSED: bool = false;
