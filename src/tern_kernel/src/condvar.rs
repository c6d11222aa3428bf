//! Condition variables.
use crate::{
    error::{Errno, Result},
    klock::{self, MaskCell, MaskTokenRefMut},
    mutex::{self, Mutex, MutexProtocol},
    task::{self, task_cb},
    time::{Duration, TimePoint},
    timeout,
    utils::{slot_list::ListHead, Init},
    wait, KernelTraits, PortThreading,
};

/// *Condition variable control block* - a priority-ordered list of waiting
/// threads bound, per wait, to an external mutex. The object itself never
/// owns a mutex.
pub struct ConditionVariable<Traits: PortThreading> {
    /// Threads blocked in `wait`, ordered by effective priority.
    pub(crate) wait_queue: MaskCell<Traits, ListHead>,
}

// Safety: the mutable state is confined to `MaskCell`s
unsafe impl<Traits: PortThreading> Sync for ConditionVariable<Traits> {}

impl<Traits: KernelTraits> ConditionVariable<Traits> {
    /// Construct a condition variable with no waiters.
    pub const fn new() -> Self {
        Self {
            wait_queue: Init::INIT,
        }
    }

    /// Atomically release `mutex` (which the caller must own) and wait for
    /// a notification, re-acquiring `mutex` before returning.
    ///
    /// A recursive mutex is released fully; the recursion count is restored
    /// on re-acquisition. Returns `EPERM` when the caller doesn't own
    /// `mutex`, and `EINTR` when a signal unwinds the wait - the mutex is
    /// re-acquired first even then.
    pub fn wait(&'static self, mutex: &'static Mutex<Traits>) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let r = wait_inner(self, lock.borrow_mut(), mutex, None);
        wait::finish_wait(lock, r)
    }

    /// Like [`Self::wait`], giving up with `ETIMEDOUT` once at least
    /// `duration` full ticks have elapsed. The mutex is re-acquired before
    /// returning in every case.
    pub fn wait_for(&'static self, mutex: &'static Mutex<Traits>, duration: Duration) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let now = timeout::now_ticks::<Traits>(lock.borrow_mut());
        let deadline = now.saturating_add_signed(duration.as_ticks().saturating_add(1));
        let r = wait_inner(self, lock.borrow_mut(), mutex, Some(deadline));
        wait::finish_wait(lock, r)
    }

    /// Like [`Self::wait`], giving up with `ETIMEDOUT` once the tick clock
    /// reaches `deadline`.
    pub fn wait_until(
        &'static self,
        mutex: &'static Mutex<Traits>,
        deadline: TimePoint,
    ) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let r = wait_inner(self, lock.borrow_mut(), mutex, Some(deadline.as_ticks()));
        wait::finish_wait(lock, r)
    }

    /// Wake the highest-priority (oldest within a priority) waiter, if any.
    ///
    /// If the waiter's mutex is currently owned, the waiter is moved
    /// directly onto the mutex's waiter list - it competes for the mutex at
    /// its proper priority position instead of racing to re-lock.
    /// Callable from an interrupt handler.
    pub fn notify_one(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        notify_one_inner(self, lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake every waiter, as if by repeated [`Self::notify_one`]. The
    /// thundering herd is bounded by the mutex requeue: all waiters whose
    /// mutex is held simply line up on its waiter list. Callable from an
    /// interrupt handler.
    pub fn notify_all(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        while notify_one_inner(self, lock.borrow_mut()) {}
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

impl<Traits: KernelTraits> Default for ConditionVariable<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

fn wait_inner<Traits: KernelTraits>(
    cv: &'static ConditionVariable<Traits>,
    mut lock: MaskTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
    deadline: Option<u64>,
) -> Result<()> {
    let cur = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

    if mutex.owner.get(&*lock) != Some(cur) {
        return Err(Errno::EPERM);
    }

    // Fully release the mutex, remembering the recursion count, and join
    // the waiter list. Both happen under the same critical section, so no
    // notification can slip in between, and the list records our settled
    // effective priority (releasing may have dropped a ceiling boost).
    let saved_count = mutex.recursion_count.replace(&mut *lock, 0);
    mutex::release_and_hand_off(lock.borrow_mut(), mutex, cur);

    let r = wait::wait(
        lock.borrow_mut(),
        wait::WaitObject::CondVar { cv, mutex },
        true,
        deadline,
    );

    if mutex.owner.get(&*lock) == Some(cur) {
        // A notification granted us the mutex (directly or through the
        // waiter-list handoff)
        mutex.recursion_count.replace(&mut *lock, saved_count);
        debug_assert_eq!(r, Ok(()));
        return r;
    }

    // Timed out, interrupted, or never blocked at all (a signal was
    // already pending): re-acquire the mutex before reporting it. The
    // re-acquisition is not interruptible and has no deadline, but it
    // re-runs the same priority-ceiling precondition as `lock` and can
    // fail with `EINVAL`.
    match mutex::lock_inner(mutex, lock.borrow_mut(), None, false) {
        Ok(()) => {
            mutex.recursion_count.replace(&mut *lock, saved_count);
            r
        }
        Err(e) => {
            debug_assert_eq!(e, Errno::EINVAL);
            Err(e)
        }
    }
}

/// Wake up the top waiter. Returns `false` if there was none.
///
/// This function may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn notify_one_inner<Traits: KernelTraits>(
    cv: &'static ConditionVariable<Traits>,
    mut lock: MaskTokenRefMut<'_, Traits>,
) -> bool {
    let Some(slot) = cv.wait_queue.read(&*lock).first else {
        return false;
    };
    let task = task_cb::<Traits>(slot);

    let Some(wait::WaitObject::CondVar { mutex, .. }) =
        wait::current_wait_object(lock.borrow_mut(), task)
    else {
        unreachable!("condition variable waiter has the wrong wait object");
    };

    if mutex.owner.get(&*lock).is_none() {
        // The mutex is free: grant it and complete the wait in one step
        mutex::lock_core(lock.borrow_mut(), mutex, slot);
        wait::complete_wait(lock, slot, Ok(()));
    } else {
        // Requeue: the thread stops waiting for the notification and
        // starts waiting for the mutex, deadline-free and no longer
        // interruptible (the notification is already consumed)
        wait::remove_from_queue(lock.borrow_mut(), &cv.wait_queue, slot);
        timeout::cancel_thread_timeout(lock.borrow_mut(), slot);

        task.wait
            .payload
            .replace(&mut *lock, Some(wait::WaitObject::Mutex(mutex)));
        task.wait.interruptible.replace(&mut *lock, false);
        task.wait.result.replace(&mut *lock, Ok(()));

        wait::insert_queue_ordered(lock.borrow_mut(), &mutex.wait_queue, slot);

        if mutex.protocol() == MutexProtocol::PriorityInheritance {
            if let Some(owner) = mutex.owner.get(&*lock) {
                mutex::reevaluate_priority_chain(lock, owner);
            }
        }
    }

    true
}
