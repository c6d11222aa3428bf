//! Semaphores.
use crate::{
    error::{Errno, Result},
    klock::{self, MaskCell, MaskTokenRefMut},
    task,
    time::{Duration, TimePoint},
    timeout,
    utils::{slot_list::ListHead, Init},
    wait, KernelTraits, PortThreading,
};

/// *Semaphore control block* - a bounded counting semaphore.
///
/// Invariant: `value <= max_value`, and whenever `value > 0` the waiter
/// list is empty - a `post` with waiters present hands the token directly
/// to the top waiter instead of incrementing the value.
pub struct Semaphore<Traits: PortThreading> {
    max_value: usize,

    pub(crate) value: MaskCell<Traits, usize>,

    /// Threads blocked in `wait`, ordered by effective priority.
    pub(crate) wait_queue: MaskCell<Traits, ListHead>,
}

// Safety: the mutable state is confined to `MaskCell`s
unsafe impl<Traits: PortThreading> Sync for Semaphore<Traits> {}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Construct a semaphore with the given initial and maximum values.
    /// The initial value is clamped to the maximum.
    pub const fn new(value: usize, max_value: usize) -> Self {
        Self {
            max_value,
            value: MaskCell::new(if value > max_value { max_value } else { value }),
            wait_queue: Init::INIT,
        }
    }

    /// Acquire a token, blocking until one is available.
    ///
    /// Interruptible; returns `EINTR` when a signal is delivered while
    /// blocked (the semaphore's value is untouched in that case).
    pub fn wait(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;

        if poll_core(self, lock.borrow_mut()) {
            return Ok(());
        }
        let r = wait::wait(
            lock.borrow_mut(),
            wait::WaitObject::Semaphore(self),
            true,
            None,
        );
        wait::finish_wait(lock, r)
    }

    /// Acquire a token without blocking; fails with `EAGAIN` when none is
    /// available.
    pub fn try_wait(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        if poll_core(self, lock.borrow_mut()) {
            Ok(())
        } else {
            Err(Errno::EAGAIN)
        }
    }

    /// Acquire a token, giving up with `ETIMEDOUT` once at least
    /// `duration` full ticks have elapsed.
    pub fn try_wait_for(&'static self, duration: Duration) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let now = timeout::now_ticks::<Traits>(lock.borrow_mut());
        let deadline = now.saturating_add_signed(duration.as_ticks().saturating_add(1));
        if poll_core(self, lock.borrow_mut()) {
            return Ok(());
        }
        let r = wait::wait(
            lock.borrow_mut(),
            wait::WaitObject::Semaphore(self),
            true,
            Some(deadline),
        );
        wait::finish_wait(lock, r)
    }

    /// Acquire a token, giving up with `ETIMEDOUT` once the tick clock
    /// reaches `deadline`.
    pub fn try_wait_until(&'static self, deadline: TimePoint) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        if poll_core(self, lock.borrow_mut()) {
            return Ok(());
        }
        let r = wait::wait(
            lock.borrow_mut(),
            wait::WaitObject::Semaphore(self),
            true,
            Some(deadline.as_ticks()),
        );
        wait::finish_wait(lock, r)
    }

    /// Release a token.
    ///
    /// If a thread is waiting, the token is handed to the highest-priority
    /// waiter without touching `value`; otherwise the value is
    /// incremented, failing with `EOVERFLOW` at the maximum. Callable from
    /// an interrupt handler.
    pub fn post(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;

        if wait::wake_one(lock.borrow_mut(), &self.wait_queue).is_some() {
            // Handed over; the waiter returns `0` without decrementing
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let value = self.value.get(&*lock);
        if value >= self.max_value {
            return Err(Errno::EOVERFLOW);
        }
        self.value.replace(&mut *lock, value + 1);
        Ok(())
    }

    /// The current value.
    pub fn value(&'static self) -> Result<usize> {
        let lock = klock::CriticalSection::<Traits>::enter()?;
        Ok(self.value.get(&*lock))
    }

    /// The maximum value.
    pub fn max_value(&self) -> usize {
        self.max_value
    }
}

/// Check if the semaphore's current state satisfies the wait condition,
/// updating it if so.
#[inline]
fn poll_core<Traits: KernelTraits>(
    sem: &'static Semaphore<Traits>,
    mut lock: MaskTokenRefMut<'_, Traits>,
) -> bool {
    let value = sem.value.get(&*lock);
    if value > 0 {
        debug_assert!(sem.wait_queue.read(&*lock).first.is_none());
        sem.value.replace(&mut *lock, value - 1);
        true
    } else {
        false
    }
}
