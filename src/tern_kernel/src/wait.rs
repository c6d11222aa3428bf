//! The blocking/wakeup protocol shared by every synchronization primitive.
//!
//! A blocking operation stores a [`WaitObject`] into the calling thread's
//! TCB, links the thread into the target's waiter list (ordered by
//! effective priority, FIFO within a priority), optionally registers a
//! deadline, and yields. The party that ends the wait - a waker, the tick
//! handler, or signal delivery - writes the reason into the TCB's
//! wait-result slot and makes the thread Ready again; the woken thread
//! returns the reason to its caller.
use crate::{
    error::{Errno, Result},
    klock::{CriticalSection, MaskCell, MaskTokenRefMut},
    task::{self, task_cb, TaskCb, TaskSt},
    timeout,
    utils::{
        slot_list::{Link, ListAccessor, ListHead},
        Init,
    },
    KernelTraits, PortThreading,
};

/// What a Waiting thread is blocked on.
pub(crate) enum WaitObject<Traits: PortThreading> {
    /// Acquiring a mutex.
    Mutex(&'static crate::mutex::Mutex<Traits>),
    /// A condition variable wait. The mutex is recorded so that a
    /// notification can requeue the thread directly onto its waiter list.
    CondVar {
        cv: &'static crate::condvar::ConditionVariable<Traits>,
        mutex: &'static crate::mutex::Mutex<Traits>,
    },
    /// A semaphore wait.
    Semaphore(&'static crate::semaphore::Semaphore<Traits>),
    /// A call-once in-progress wait.
    Once(&'static crate::once::OnceFlag<Traits>),
    /// Joining the thread in the given slot.
    Join(u16),
    /// Waiting for any signal in the set.
    #[cfg(feature = "signals")]
    Signal(crate::signal::SignalSet),
    /// A timed sleep.
    Sleep,
    /// Suspended until explicitly resumed.
    Suspended,
}

impl<Traits: PortThreading> Clone for WaitObject<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for WaitObject<Traits> {}

/// The wait state of a thread.
pub(crate) struct TaskWait<Traits: PortThreading> {
    /// What the thread is blocked on. `Some(_)` iff the thread is in the
    /// Waiting state.
    pub(crate) payload: MaskCell<Traits, Option<WaitObject<Traits>>>,

    /// The result of the last wait operation, written by the waker before
    /// the thread becomes Ready.
    pub(crate) result: MaskCell<Traits, Result<()>>,

    /// Whether signal delivery may unwind the current wait with `EINTR`.
    pub(crate) interruptible: MaskCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    const INIT: Self = Self {
        payload: MaskCell::new(None),
        result: MaskCell::new(Ok(())),
        interruptible: MaskCell::new(false),
    };
}

/// Get a `ListAccessor` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($head:expr, $lock:expr) => {
        ListAccessor::new($head, |i| &task_cb::<Traits>(i).link, $lock)
    };
}

/// The waiter list a thread with this wait object is linked into, if any.
pub(crate) fn queue_of<Traits: KernelTraits>(
    payload: &WaitObject<Traits>,
) -> Option<&'static MaskCell<Traits, ListHead>> {
    match payload {
        WaitObject::Mutex(m) => Some(&m.wait_queue),
        WaitObject::CondVar { cv, .. } => Some(&cv.wait_queue),
        WaitObject::Semaphore(s) => Some(&s.wait_queue),
        WaitObject::Once(f) => Some(&f.wait_queue),
        WaitObject::Join(slot) => Some(&task_cb::<Traits>(*slot).join_waiters),
        #[cfg(feature = "signals")]
        WaitObject::Signal(_) => None,
        WaitObject::Sleep | WaitObject::Suspended => None,
    }
}

/// Reset a slot's wait state during thread creation.
pub(crate) fn reset_wait_state<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) {
    let task = task_cb::<Traits>(slot);
    debug_assert_eq!(*task.link.read(&*lock), Link::INIT);
    task.wait.payload.replace(&mut *lock, None);
    task.wait.result.replace(&mut *lock, Ok(()));
    task.wait.interruptible.replace(&mut *lock, false);
}

/// The specified thread's current wait object, if it is Waiting.
pub(crate) fn current_wait_object<Traits: KernelTraits>(
    lock: MaskTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) -> Option<WaitObject<Traits>> {
    task.wait.payload.get(&*lock)
}

/// Insert `slot` into a waiter list, keeping the list sorted by
/// `(effective priority descending, arrival ascending)`.
///
/// Walking from the back preserves FIFO order among equal priorities
/// without a per-queue arrival counter.
pub(crate) fn insert_queue_ordered<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    head: &'static MaskCell<Traits, ListHead>,
    slot: u16,
) {
    let pri = task_cb::<Traits>(slot).effective_priority.get(&*lock);

    let mut accessor = wait_queue_accessor!(head, lock.borrow_mut());
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(j) = cursor {
        let j_pri = task_cb::<Traits>(j)
            .effective_priority
            .get(&**accessor.cell_key());
        if j_pri < pri {
            // The new waiter outranks `j`; a viable position might exist
            // even earlier
            insert_at = Some(j);
            cursor = accessor.prev(j);
        } else {
            break;
        }
    }
    accessor.insert_before(slot, insert_at);
}

/// Set up the calling thread's wait state: the wait object, the waiter-list
/// link, and the optional deadline.
///
/// Fails with `EINTR` (before blocking) when the wait is interruptible and
/// a signal is already pending, and with `ETIMEDOUT` when the deadline has
/// already passed.
pub(crate) fn prepare_wait<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    payload: WaitObject<Traits>,
    interruptible: bool,
    deadline: Option<u64>,
) -> Result<()> {
    let slot = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

    #[cfg(feature = "signals")]
    if interruptible && crate::signal::is_signal_pending(lock.borrow_mut(), slot) {
        return Err(Errno::EINTR);
    }

    if let Some(at) = deadline {
        if at <= timeout::now_ticks::<Traits>(lock.borrow_mut()) {
            return Err(Errno::ETIMEDOUT);
        }
    }

    let task = task_cb::<Traits>(slot);
    task.wait.payload.replace(&mut *lock, Some(payload));
    task.wait.interruptible.replace(&mut *lock, interruptible);
    task.wait.result.replace(&mut *lock, Ok(()));

    if let Some(head) = queue_of(&payload) {
        insert_queue_ordered(lock.borrow_mut(), head, slot);
    }

    if let Some(at) = deadline {
        timeout::insert_thread_timeout(lock.borrow_mut(), slot, at);
    }

    Ok(())
}

/// Block the calling thread prepared by [`prepare_wait`] until a waker
/// completes the wait, and return the wait result.
pub(crate) fn commit_wait<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
) -> Result<()> {
    let slot = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

    // This statement completes when the thread is woken up
    task::wait_until_woken_up(lock.borrow_mut());

    // The deadline (if it didn't fire) is no longer wanted
    timeout::cancel_thread_timeout(lock.borrow_mut(), slot);

    let task = task_cb::<Traits>(slot);
    debug_assert!(task.wait.payload.read(&*lock).is_none());
    debug_assert_eq!(*task.link.read(&*lock), Link::INIT);

    task.wait.result.get(&*lock)
}

/// [`prepare_wait`] followed by [`commit_wait`].
pub(crate) fn wait<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    payload: WaitObject<Traits>,
    interruptible: bool,
    deadline: Option<u64>,
) -> Result<()> {
    prepare_wait(lock.borrow_mut(), payload, interruptible, deadline)?;
    commit_wait(lock)
}

/// Release CPU Lock and translate the completed wait's result, running
/// pending signal handlers in the caller's context first when the wait was
/// unwound by a signal.
pub(crate) fn finish_wait<Traits: KernelTraits>(
    lock: CriticalSection<Traits>,
    r: Result<()>,
) -> Result<()> {
    drop(lock);

    #[cfg(feature = "signals")]
    if r == Err(Errno::EINTR) {
        crate::signal::deliver_pending_handlers::<Traits>();
    }

    r
}

/// Deassociate the specified Waiting thread from its wait object and wake
/// it up: unlink it from the waiter list, write the wait result, and make
/// it Ready.
///
/// This function may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
    result: Result<()>,
) {
    let task = task_cb::<Traits>(slot);
    assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);

    let payload = task.wait.payload.replace(&mut *lock, None);
    let payload = payload.expect("waiting thread has no wait object");

    if let Some(head) = queue_of(&payload) {
        let mut accessor = wait_queue_accessor!(head, lock.borrow_mut());
        accessor.remove(slot);
    }

    task.wait.result.replace(&mut *lock, result);

    // Safety of resumption: the thread was Waiting, so its saved context is
    // valid and the wait bookkeeping has been fully undone above
    task::make_ready(lock, slot, false);
}

/// Interrupt any ongoing wait operation of the thread, waking it with the
/// given result. Returns `false` if the thread wasn't Waiting.
///
/// This function may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn interrupt_thread<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
    result: Result<()>,
) -> bool {
    let task = task_cb::<Traits>(slot);
    if *task.st.read(&*lock) != TaskSt::Waiting {
        return false;
    }
    complete_wait(lock, slot, result);
    true
}

/// Wake up the first waiter of a waiter list with a success result.
/// Returns the woken thread's slot.
///
/// This function may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn wake_one<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    head: &'static MaskCell<Traits, ListHead>,
) -> Option<u16> {
    let first = {
        let accessor = wait_queue_accessor!(head, lock.borrow_mut());
        accessor.front()
    }?;
    complete_wait(lock, first, Ok(()));
    Some(first)
}

/// Unlink `slot` from the given waiter list without completing its wait
/// (used by the condition variable's requeue-on-notify path).
pub(crate) fn remove_from_queue<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    head: &'static MaskCell<Traits, ListHead>,
    slot: u16,
) {
    let mut accessor = wait_queue_accessor!(head, lock.borrow_mut());
    accessor.remove(slot);
}

/// Reposition the given thread within its waiter list after a change of its
/// effective priority. Does nothing if the thread's wait has no queue.
pub(crate) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) {
    let task = task_cb::<Traits>(slot);
    let Some(payload) = task.wait.payload.get(&*lock) else {
        return;
    };
    let Some(head) = queue_of(&payload) else {
        return;
    };

    {
        let mut accessor = wait_queue_accessor!(head, lock.borrow_mut());
        accessor.remove(slot);
    }
    insert_queue_ordered(lock, head, slot);
}
