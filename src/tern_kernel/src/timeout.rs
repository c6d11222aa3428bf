//! The tick clock, timeouts (timed events), and the sleep engine.
//!
//! Time is a 64-bit count of kernel ticks since boot, advanced exactly once
//! per tick by [`handle_tick`] (the tick interrupt entry). Outstanding
//! timed events - thread deadlines and software timers - live in one global
//! min-heap keyed by `(deadline, registration sequence)`, so simultaneous
//! deadlines fire in registration order. Deadlines are compared
//! inclusively: an event with `deadline <= now` is due.
use arrayvec::ArrayVec;

use crate::{
    cfg,
    error::{Errno, Result},
    klock::{self, MaskTokenRefMut},
    task::{self, task_cb, SchedulingPolicy, TaskSt},
    time::{Duration, TimePoint},
    timer,
    utils::binary_heap,
    wait, KernelTraits, PortThreading, System,
};

/// Storage for the outstanding timeouts.
pub(crate) type TimeoutHeap<Traits> = ArrayVec<TimeoutEntry<Traits>, { cfg::TIMEOUT_CAPACITY }>;

/// Whose deadline a timeout entry tracks.
pub(crate) enum TimeoutOwner<Traits: PortThreading> {
    /// A thread's timed wait. Expiry interrupts the wait with `ETIMEDOUT`
    /// (`0` for a plain sleep).
    Thread(u16),
    /// A software timer. Expiry runs the timer's handler.
    Timer(&'static timer::Timer<Traits>),
}

impl<Traits: PortThreading> Clone for TimeoutOwner<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TimeoutOwner<Traits> {}

/// An outstanding timed event.
pub(crate) struct TimeoutEntry<Traits: PortThreading> {
    /// Absolute deadline in ticks.
    pub(crate) at: u64,
    /// Registration sequence number; breaks deadline ties.
    pub(crate) seq: u64,
    pub(crate) owner: TimeoutOwner<Traits>,
}

impl<Traits: PortThreading> Clone for TimeoutEntry<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TimeoutEntry<Traits> {}

impl<Traits: PortThreading> PartialEq for TimeoutEntry<Traits> {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}
impl<Traits: PortThreading> Eq for TimeoutEntry<Traits> {}
impl<Traits: PortThreading> PartialOrd for TimeoutEntry<Traits> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<Traits: PortThreading> Ord for TimeoutEntry<Traits> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Initialize the timekeeping state at boot.
pub(crate) fn init<Traits: KernelTraits>(mut lock: MaskTokenRefMut<'_, Traits>) {
    let state = Traits::state();
    state.tick_count.replace(&mut *lock, 0);
    debug_assert!(state.timeout_heap.read(&*lock).is_empty());
}

/// The current tick count.
#[inline]
pub(crate) fn now_ticks<Traits: KernelTraits>(lock: MaskTokenRefMut<'_, Traits>) -> u64 {
    Traits::state().tick_count.get(&*lock)
}

fn insert_entry<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    owner: TimeoutOwner<Traits>,
    at: u64,
) {
    let state = Traits::state();
    let seq = state.timeout_seq.get(&*lock);
    state.timeout_seq.replace(&mut *lock, seq.wrapping_add(1));

    binary_heap::push(
        state.timeout_heap.write(&mut *lock),
        TimeoutEntry { at, seq, owner },
    );
}

/// Register a deadline for the specified thread's current wait. Each thread
/// has at most one outstanding deadline; capacity is reserved for that.
pub(crate) fn insert_thread_timeout<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
    at: u64,
) {
    debug_assert!(binary_heap::position(Traits::state().timeout_heap.read(&*lock), |e| {
        matches!(e.owner, TimeoutOwner::Thread(s) if s == slot)
    })
    .is_none());
    debug_assert!(!Traits::state().timeout_heap.read(&*lock).is_full());
    insert_entry(lock, TimeoutOwner::Thread(slot), at);
}

/// Unregister the specified thread's deadline. Does nothing if none is
/// registered. Returns `true` if an entry was removed.
pub(crate) fn cancel_thread_timeout<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) -> bool {
    let state = Traits::state();
    let pos = binary_heap::position(state.timeout_heap.read(&*lock), |e| {
        matches!(e.owner, TimeoutOwner::Thread(s) if s == slot)
    });
    match pos {
        Some(i) => {
            binary_heap::remove(state.timeout_heap.write(&mut *lock), i);
            true
        }
        None => false,
    }
}

/// Register a software timer's next expiry.
///
/// Fails with `ENOBUFS` when the timer share of the heap is exhausted (the
/// per-thread share is reserved so that timed waits can't fail this way).
pub(crate) fn insert_timer_timeout<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    t: &'static timer::Timer<Traits>,
    at: u64,
) -> Result<()> {
    let state = Traits::state();
    let timer_entries = state
        .timeout_heap
        .read(&*lock)
        .iter()
        .filter(|e| matches!(e.owner, TimeoutOwner::Timer(_)))
        .count();
    if timer_entries >= cfg::TIMEOUT_CAPACITY - cfg::THREAD_CAPACITY {
        return Err(Errno::ENOBUFS);
    }
    insert_entry(lock, TimeoutOwner::Timer(t), at);
    Ok(())
}

/// Unregister a software timer's expiry. Does nothing if it isn't
/// registered.
pub(crate) fn cancel_timer_timeout<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    t: &'static timer::Timer<Traits>,
) {
    let state = Traits::state();
    let pos = binary_heap::position(state.timeout_heap.read(&*lock), |e| {
        matches!(e.owner, TimeoutOwner::Timer(other) if core::ptr::eq(other, t))
    });
    if let Some(i) = pos {
        binary_heap::remove(state.timeout_heap.write(&mut *lock), i);
    }
}

/// Implements [`crate::PortToKernel::timer_tick`].
///
/// Advances the tick counter, then fires every due entry in `(deadline,
/// registration)` order - software timer handlers run here, at tick-ISR
/// priority, with CPU Lock released around the user callback - and finally
/// performs round-robin quantum accounting for the running thread.
///
/// Precondition: CPU Lock inactive, an interrupt context.
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = klock::CriticalSection::<Traits>::enter().unwrap();
    let state = Traits::state();

    let now = state.tick_count.get(&*lock) + 1;
    state.tick_count.replace(&mut *lock, now);

    // Process expired timeouts, earliest first
    loop {
        let front = state.timeout_heap.read(&*lock).get(0).map(|e| e.at);
        match front {
            Some(at) if at <= now => {}
            _ => break,
        }

        let entry = binary_heap::pop(state.timeout_heap.write(&mut *lock)).unwrap();

        match entry.owner {
            TimeoutOwner::Thread(slot) => {
                // A plain sleep completes successfully on expiry; every
                // other wait reports `ETIMEDOUT`
                let is_sleep = matches!(
                    task_cb::<Traits>(slot).wait.payload.get(&*lock),
                    Some(wait::WaitObject::Sleep)
                );
                let result = if is_sleep { Ok(()) } else { Err(Errno::ETIMEDOUT) };
                wait::interrupt_thread(lock.borrow_mut(), slot, result);
            }
            TimeoutOwner::Timer(t) => {
                lock = timer::fire_timer(t, lock, entry.at, now);
            }
        }
    }

    // Round-robin accounting for the running thread
    if let Some(slot) = state.running_task.get(&*lock) {
        let task = task_cb::<Traits>(slot);
        if *task.st.read(&*lock) == TaskSt::Running
            && task.policy.get(&*lock) == SchedulingPolicy::RoundRobin
        {
            let quantum = task.quantum.get(&*lock).saturating_sub(1);
            task.quantum.replace(&mut *lock, quantum);

            if quantum == 0 {
                let pri = task.effective_priority.get(&*lock);
                if state.ready.has_ready_task_at(lock.borrow_mut(), pri) {
                    // Rotate behind the equal-priority peers; `make_ready`
                    // also resets the quantum
                    task::make_ready(lock.borrow_mut(), slot, false);
                } else {
                    task.quantum.replace(&mut *lock, cfg::ROUND_ROBIN_QUANTUM);
                }
            }
        }
    }

    // Timer handlers and expired waits might have made threads Ready.
    // Check for dispatch and release CPU Lock.
    task::unlock_cpu_and_check_preemption(lock);
}

/// Clock and sleep services.
impl<Traits: KernelTraits> System<Traits> {
    /// Read the monotonic tick clock.
    pub fn now() -> Result<TimePoint> {
        let lock = klock::CriticalSection::<Traits>::enter()?;
        Ok(TimePoint::from_ticks(Traits::state().tick_count.get(&*lock)))
    }

    /// Sleep until the tick clock reaches `deadline` (inclusive). Returns
    /// immediately if it already has.
    ///
    /// Interruptible; returns `EINTR` when a signal is delivered while
    /// sleeping.
    pub fn sleep_until(deadline: TimePoint) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;

        if deadline.as_ticks() <= now_ticks::<Traits>(lock.borrow_mut()) {
            return Ok(());
        }

        let r = wait::wait(
            lock.borrow_mut(),
            wait::WaitObject::Sleep,
            true,
            Some(deadline.as_ticks()),
        );
        wait::finish_wait(lock, r)
    }

    /// Sleep for at least `duration` full ticks.
    ///
    /// Defined as `sleep_until(now() + duration + 1)`; the extra tick
    /// guarantees the full duration elapses regardless of where within the
    /// current tick the call is made (so even a zero duration sleeps until
    /// the next tick). A sufficiently negative duration, one that places
    /// the deadline at or before the current tick, returns immediately.
    pub fn sleep_for(duration: Duration) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;

        let now = now_ticks::<Traits>(lock.borrow_mut());
        let Some(deadline) = now.checked_add_signed(duration.as_ticks().saturating_add(1))
        else {
            return Ok(());
        };
        if deadline <= now {
            return Ok(());
        }

        let r = wait::wait(
            lock.borrow_mut(),
            wait::WaitObject::Sleep,
            true,
            Some(deadline),
        );
        wait::finish_wait(lock, r)
    }
}
