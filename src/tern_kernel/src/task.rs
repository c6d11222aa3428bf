//! Threads and the scheduler.
use crate::{
    cfg,
    error::{Errno, Result},
    klock::{self, CriticalSection, MaskCell, MaskTokenRefMut},
    mutex, timeout,
    utils::{
        slot_list::{Link, ListHead},
        Init, RawCell,
    },
    wait, BootOptions, KernelTraits, PortThreading, System,
};

pub(crate) mod readyqueue;

/// A thread's entry point.
pub type ThreadEntry = fn(usize);

/// Per-thread scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// The thread runs until it blocks or is preempted by a strictly
    /// higher-priority thread.
    Fifo,
    /// Like [`Self::Fifo`], but the thread additionally yields to its
    /// equal-priority peers when its time quantum expires.
    RoundRobin,
}

/// The externally visible state of a thread. See the state table in the
/// kernel documentation for the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but not yet started.
    Created,
    /// Ready to run, waiting for the processor.
    Runnable,
    /// Currently executing.
    Running,
    /// Sleeping until a deadline.
    Sleeping,
    /// Blocked acquiring a mutex.
    BlockedOnMutex,
    /// Blocked in a condition variable wait.
    BlockedOnConditionVariable,
    /// Blocked in a semaphore wait.
    BlockedOnSemaphore,
    /// Blocked waiting for a signal.
    BlockedOnSignal,
    /// Blocked joining another thread.
    BlockedOnJoin,
    /// Suspended until resumed.
    Suspended,
    /// Terminated but not yet reclaimed by `join` or `detach`.
    Terminated,
    /// Detached and still alive; its slot is reclaimed automatically on
    /// termination.
    Detached,
}

/// Identifies a thread: an arena slot plus the slot's generation at
/// creation. Stale identifiers (the thread terminated and its slot was
/// reclaimed) fail every operation with `EINVAL` and never alias a newer
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId {
    pub(crate) slot: u16,
    pub(crate) generation: u32,
}

/// Parameters for `create_thread`.
#[derive(Debug, Clone, Copy)]
pub struct ThreadOptions {
    /// The thread's entry point.
    pub entry: ThreadEntry,
    /// The parameter passed to `entry`.
    pub param: usize,
    /// The base priority. Must not be zero (reserved for the idle thread).
    pub priority: u8,
    /// The stack size in bytes; at least [`cfg::MIN_STACK_SIZE`].
    pub stack_size: usize,
    /// The scheduling policy.
    pub policy: SchedulingPolicy,
}

impl ThreadOptions {
    /// Construct a `ThreadOptions` with the default stack size and FIFO
    /// scheduling.
    pub const fn new(entry: ThreadEntry, param: usize, priority: u8) -> Self {
        Self {
            entry,
            param,
            priority,
            stack_size: cfg::DEFAULT_STACK_SIZE,
            policy: SchedulingPolicy::Fifo,
        }
    }
}

/// Thread state machine (internal representation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// The slot holds no thread.
    Vacant,
    /// Created but not yet started.
    Created,
    /// In the ready queue.
    Ready,
    /// The currently running thread.
    Running,
    /// Blocked; `TaskWait::payload` describes on what.
    Waiting,
    /// Terminated, awaiting reclamation by `join` or `detach`.
    Terminated,
}

/// *Task control block* - the state data of a thread, one per arena slot.
pub struct TaskCb<Traits: PortThreading> {
    /// Port-specific execution state (saved context, port thread handle,
    /// ...).
    pub port_task_state: Traits::PortTaskState,

    /// Bumped whenever the slot is reclaimed, invalidating outstanding
    /// [`ThreadId`]s.
    pub(crate) generation: MaskCell<Traits, u32>,

    pub(crate) st: MaskCell<Traits, TaskSt>,

    pub(crate) detached: MaskCell<Traits, bool>,

    /// The thread's base priority.
    pub(crate) base_priority: MaskCell<Traits, u8>,

    /// The thread's effective priority. It's calculated based on
    /// `base_priority` and may be temporarily elevated by a mutex locking
    /// protocol:
    ///
    /// ```text
    /// max(base,
    ///     max over owned priority-protect mutexes of their ceilings,
    ///     max over owned priority-inheritance mutexes of their top
    ///     waiter's effective priority)
    /// ```
    ///
    /// The effective priority determines the thread's position within the
    /// ready queue and every wait queue. After updating it for a Ready or
    /// Waiting thread, the thread must be repositioned
    /// ([`set_effective_priority`] does both).
    pub(crate) effective_priority: MaskCell<Traits, u8>,

    pub(crate) policy: MaskCell<Traits, SchedulingPolicy>,

    /// Remaining round-robin quantum in ticks. Reset on every (re)entry to
    /// the ready queue.
    pub(crate) quantum: MaskCell<Traits, u32>,

    /// Entry point and parameter. Written during creation, read by the
    /// port when it first dispatches the thread.
    pub(crate) entry: RawCell<(ThreadEntry, usize)>,

    /// Requested stack size. The hosted port ignores it beyond validation;
    /// a hardware port carves the stack region from it.
    pub(crate) stack_size: RawCell<usize>,

    /// The thread's list node. A thread is linked into at most one kernel
    /// queue at a time, so one node is enough.
    pub(crate) link: MaskCell<Traits, Link>,

    /// The wait state: what the thread is blocked on, why it woke, and
    /// whether signals may unwind the wait.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// Threads blocked joining this one.
    pub(crate) join_waiters: MaskCell<Traits, ListHead>,

    /// The head of the chain of mutexes this thread currently owns,
    /// threaded through [`mutex::Mutex::prev_mutex_held`].
    pub(crate) last_mutex_held: MaskCell<Traits, Option<&'static mutex::Mutex<Traits>>>,

    /// Per-thread signal state.
    #[cfg(feature = "signals")]
    pub(crate) sig: crate::signal::SignalState<Traits>,
}

// Safety: every field is either a `MaskCell` (accessible only under the
// critical section), a `RawCell` with its own access contract, or the
// port's own state
unsafe impl<Traits: PortThreading> Sync for TaskCb<Traits> {}

impl<Traits: PortThreading> Init for TaskCb<Traits> {
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        generation: Init::INIT,
        st: MaskCell::new(TaskSt::Vacant),
        detached: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        policy: MaskCell::new(SchedulingPolicy::Fifo),
        quantum: Init::INIT,
        entry: RawCell::new((noop_entry, 0)),
        stack_size: RawCell::new(0),
        link: Init::INIT,
        wait: Init::INIT,
        join_waiters: Init::INIT,
        last_mutex_held: Init::INIT,
        #[cfg(feature = "signals")]
        sig: Init::INIT,
    };
}

fn noop_entry(_: usize) {}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Get the entry point and parameter.
    ///
    /// # Safety
    ///
    /// The thread must have been created (the port only calls this for a
    /// thread it was asked to dispatch, which implies that).
    #[inline]
    pub unsafe fn entry_raw(&self) -> (ThreadEntry, usize) {
        // Safety: Upheld by the caller
        unsafe { self.entry.get() }
    }
}

// Arena helpers
// ---------------------------------------------------------------------------

/// Get the [`TaskCb`] in the specified arena slot.
#[inline]
pub(crate) fn task_cb<Traits: KernelTraits>(slot: u16) -> &'static TaskCb<Traits> {
    &Traits::state().tasks[slot as usize]
}

/// Resolve a [`ThreadId`], failing with `EINVAL` if it is stale.
pub(crate) fn get_task<Traits: KernelTraits>(
    lock: MaskTokenRefMut<'_, Traits>,
    id: ThreadId,
) -> Result<&'static TaskCb<Traits>> {
    if id.slot as usize >= cfg::THREAD_CAPACITY {
        return Err(Errno::EINVAL);
    }
    let task = task_cb::<Traits>(id.slot);
    if task.generation.get(&*lock) != id.generation || *task.st.read(&*lock) == TaskSt::Vacant {
        return Err(Errno::EINVAL);
    }
    Ok(task)
}

/// The currently running thread's slot.
#[inline]
pub(crate) fn running_slot<Traits: KernelTraits>(
    lock: MaskTokenRefMut<'_, Traits>,
) -> Option<u16> {
    Traits::state().running_task.get(&*lock)
}

/// If the current context is not a task context, return `Err(EPERM)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<()> {
    if !Traits::is_task_context() {
        Err(Errno::EPERM)
    } else {
        Ok(())
    }
}

// Scheduling
// ---------------------------------------------------------------------------

/// Transition the thread into the Ready state and insert it into the ready
/// queue. This function doesn't do any proper cleanup for a previous state.
///
/// `front` places the thread ahead of its equal-priority peers (preemption);
/// otherwise it goes behind them.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
    front: bool,
) {
    let task = task_cb::<Traits>(slot);
    task.st.replace(&mut *lock, TaskSt::Ready);
    task.quantum.replace(&mut *lock, cfg::ROUND_ROBIN_QUANTUM);
    Traits::state().ready.push(lock, slot, front);
}

/// Relinquish CPU Lock. After that, if there's a thread that should preempt
/// the current one, call `Port::yield_cpu`.
///
/// System services that transition a thread into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CriticalSection<Traits>,
) {
    let state = Traits::state();
    let prev_task_priority = match state.running_task.get(&*lock) {
        Some(slot) => {
            let task = task_cb::<Traits>(slot);
            if *task.st.read(&*lock) == TaskSt::Running {
                Some(task.effective_priority.get(&*lock))
            } else {
                None
            }
        }
        None => None,
    };

    let has_preempting_task = state
        .ready
        .has_ready_task_above(lock.borrow_mut(), prev_task_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Make a scheduling decision: elect the next thread to run and update
/// `running_task`.
///
/// The scheduling invariant: after this function returns, no Ready thread
/// has an effective priority strictly higher than the running thread's.
/// Equal-priority preemption never occurs.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();

    let prev_slot = state.running_task.get(&*lock);
    let prev_task_priority = match prev_slot {
        Some(slot) => {
            let task = task_cb::<Traits>(slot);
            if *task.st.read(&*lock) == TaskSt::Running {
                Some(task.effective_priority.get(&*lock))
            } else {
                // The current thread can't run anymore; a new one must be
                // elected even if the ready queue is empty
                None
            }
        }
        None => None,
    };

    let next_task_priority = state.ready.highest_ready_priority(lock.borrow_mut());

    match next_task_priority {
        Some(next_pri) => {
            if let Some(prev_pri) = prev_task_priority {
                if next_pri <= prev_pri as usize {
                    // The current thread continues to run
                    return;
                }
            }

            let next = state
                .ready
                .pop_front_at(lock.borrow_mut(), next_pri)
                .unwrap();
            task_cb::<Traits>(next).st.replace(&mut *lock, TaskSt::Running);

            if prev_slot == Some(next) {
                return;
            }

            // `prev_slot` now loses the control of the processor
            if let Some(prev) = prev_slot {
                if *task_cb::<Traits>(prev).st.read(&*lock) == TaskSt::Running {
                    // Preempted; it resumes ahead of its equal-priority
                    // peers
                    make_ready(lock.borrow_mut(), prev, true);
                }
            }

            state.running_task.replace(&mut *lock, Some(next));
        }
        None => {
            if prev_task_priority.is_none() {
                // No thread can run. This only happens before the idle
                // thread is started.
                state.running_task.replace(&mut *lock, None);
            }
        }
    }
}

/// Transition the currently running thread into the Waiting state. Returns
/// when woken up.
///
/// The caller must have already set the thread's wait state; the waker is
/// responsible for transitioning the thread back to Ready.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(expect_task_context::<Traits>(), Ok(()));

    // Transition the current thread to Waiting
    let slot = running_slot::<Traits>(lock.borrow_mut()).unwrap();
    let task = task_cb::<Traits>(slot);
    assert_eq!(*task.st.read(&*lock), TaskSt::Running);
    task.st.replace(&mut *lock, TaskSt::Waiting);

    loop {
        // Temporarily release CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from
        //             this function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *task.st.read(&*lock) == TaskSt::Running {
            break;
        }

        assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);
    }
}

/// Update a thread's effective priority and reposition it in whatever queue
/// it is linked into.
pub(crate) fn set_effective_priority<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
    new: u8,
) {
    let task = task_cb::<Traits>(slot);
    let old = task.effective_priority.replace(&mut *lock, new);
    if old == new {
        return;
    }

    match *task.st.read(&*lock) {
        TaskSt::Ready => {
            let state = Traits::state();
            state.ready.remove(lock.borrow_mut(), slot, old as usize);
            state.ready.push(lock, slot, false);
        }
        TaskSt::Waiting => {
            wait::reorder_wait_of_task(lock, slot);
        }
        _ => {}
    }
}

// Boot
// ---------------------------------------------------------------------------

fn idle_entry<Traits: KernelTraits>(_: usize) {
    loop {
        // Safety: We are the idle thread
        unsafe { Traits::idle() };
    }
}

/// Implements [`crate::PortToKernel::boot`].
pub(crate) fn boot<Traits: KernelTraits>(opts: BootOptions) -> ! {
    // Safety: CPU Lock inactive, per the caller's contract
    let mut lock = unsafe {
        Traits::enter_cpu_lock();
        klock::CriticalSection::<Traits>::assume_active()
    };

    timeout::init::<Traits>(lock.borrow_mut());

    // The idle thread occupies the lowest priority level and never blocks
    let idle = create_thread_inner::<Traits>(
        lock.borrow_mut(),
        &ThreadOptions {
            entry: idle_entry::<Traits>,
            param: 0,
            priority: 0,
            stack_size: cfg::IDLE_STACK_SIZE,
            policy: SchedulingPolicy::Fifo,
        },
        true,
    )
    .expect("failed to create the idle thread");
    start_thread_inner::<Traits>(lock.borrow_mut(), idle).unwrap();

    let main = create_thread_inner::<Traits>(
        lock.borrow_mut(),
        &ThreadOptions {
            entry: opts.main_entry,
            param: opts.main_param,
            priority: opts.main_priority,
            stack_size: opts.main_stack_size,
            policy: opts.main_policy,
        },
        false,
    )
    .expect("failed to create the main thread");
    start_thread_inner::<Traits>(lock.borrow_mut(), main).unwrap();

    choose_next_running_task(lock.borrow_mut());

    // Interrupts stay masked across `dispatch_first_task`; the port
    // releases the masking when it starts the first thread
    lock.transfer_to_port();

    // Safety: CPU Lock active, boot time
    unsafe { Traits::dispatch_first_task() }
}

// Thread operations
// ---------------------------------------------------------------------------

fn create_thread_inner<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    opts: &ThreadOptions,
    allow_idle_priority: bool,
) -> Result<ThreadId> {
    if opts.priority == 0 && !allow_idle_priority {
        // Priority 0 is reserved for the idle thread
        return Err(Errno::EINVAL);
    }
    if opts.stack_size < cfg::MIN_STACK_SIZE && !allow_idle_priority {
        return Err(Errno::ENOSPC);
    }

    let state = Traits::state();
    let slot = (0..cfg::THREAD_CAPACITY as u16)
        .find(|&i| *state.tasks[i as usize].st.read(&*lock) == TaskSt::Vacant)
        .ok_or(Errno::EMFILE)?;

    let task = task_cb::<Traits>(slot);
    task.st.replace(&mut *lock, TaskSt::Created);
    task.detached.replace(&mut *lock, false);
    task.base_priority.replace(&mut *lock, opts.priority);
    task.effective_priority.replace(&mut *lock, opts.priority);
    task.policy.replace(&mut *lock, opts.policy);
    task.quantum.replace(&mut *lock, cfg::ROUND_ROBIN_QUANTUM);
    task.last_mutex_held.replace(&mut *lock, None);
    wait::reset_wait_state(lock.borrow_mut(), slot);
    #[cfg(feature = "signals")]
    crate::signal::reset_signal_state(lock.borrow_mut(), slot);

    // Safety: CPU Lock active and the slot is not visible to any other
    // execution context yet
    unsafe {
        task.entry.set((opts.entry, opts.param));
        task.stack_size.set(opts.stack_size);
    }

    Ok(ThreadId {
        slot,
        generation: task.generation.get(&*lock),
    })
}

fn start_thread_inner<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    id: ThreadId,
) -> Result<()> {
    let task = get_task::<Traits>(lock.borrow_mut(), id)?;
    if *task.st.read(&*lock) != TaskSt::Created {
        return Err(Errno::EINVAL);
    }

    // Safety: CPU Lock active, the thread is in the Created state
    unsafe { Traits::initialize_task_state(task) };

    make_ready(lock, id.slot, false);
    Ok(())
}

/// Reclaim a slot, invalidating all outstanding `ThreadId`s for it.
fn reclaim_slot<Traits: KernelTraits>(mut lock: MaskTokenRefMut<'_, Traits>, slot: u16) {
    let task = task_cb::<Traits>(slot);
    debug_assert_eq!(*task.link.read(&*lock), Link::INIT);
    let generation = task.generation.get(&*lock);
    task.generation.replace(&mut *lock, generation.wrapping_add(1));
    task.detached.replace(&mut *lock, false);
    task.st.replace(&mut *lock, TaskSt::Vacant);
}

/// Terminate the calling thread: wake its joiners, release held mutexes,
/// and dispatch away, never to return.
fn exit_current_thread<Traits: KernelTraits>() -> ! {
    assert!(
        Traits::is_task_context(),
        "`exit_thread` called from an interrupt context"
    );

    // If CPU Lock is inactive, activate it
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::CriticalSection::<Traits>::assume_active()
    };

    let slot = running_slot::<Traits>(lock.borrow_mut()).unwrap();
    let task = task_cb::<Traits>(slot);

    // Release held mutexes, waking up their next waiters (if any)
    mutex::release_all_held_mutexes(lock.borrow_mut(), slot);
    debug_assert!(task.last_mutex_held.read(&*lock).is_none());

    // Wake up joiners; they observe the Terminated state and the first to
    // run reclaims the slot
    while let Some(joiner) = wait::wake_one(lock.borrow_mut(), &task.join_waiters) {
        let _ = joiner;
    }

    assert_eq!(*task.st.read(&*lock), TaskSt::Running);
    if task.detached.get(&*lock) {
        reclaim_slot(lock.borrow_mut(), slot);
    } else {
        task.st.replace(&mut *lock, TaskSt::Terminated);
    }

    // Erase `running_task`
    Traits::state().running_task.replace(&mut *lock, None);

    lock.transfer_to_port();

    // Safety: (1) All preexisting data on the thread's stack is dead; the
    // thread never runs again. (2) CPU Lock active
    unsafe { Traits::exit_and_dispatch(task) }
}

/// Map the internal state to the externally visible one.
fn public_state<Traits: KernelTraits>(
    lock: MaskTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) -> ThreadState {
    if task.detached.get(&*lock) && *task.st.read(&*lock) != TaskSt::Terminated {
        return ThreadState::Detached;
    }
    match *task.st.read(&*lock) {
        TaskSt::Vacant => unreachable!(),
        TaskSt::Created => ThreadState::Created,
        TaskSt::Ready => ThreadState::Runnable,
        TaskSt::Running => ThreadState::Running,
        TaskSt::Terminated => ThreadState::Terminated,
        TaskSt::Waiting => match wait::current_wait_object(lock, task) {
            Some(wait::WaitObject::Mutex(_)) => ThreadState::BlockedOnMutex,
            Some(wait::WaitObject::CondVar { .. }) => ThreadState::BlockedOnConditionVariable,
            Some(wait::WaitObject::Semaphore(_)) => ThreadState::BlockedOnSemaphore,
            Some(wait::WaitObject::Once(_)) => ThreadState::BlockedOnConditionVariable,
            Some(wait::WaitObject::Join(_)) => ThreadState::BlockedOnJoin,
            #[cfg(feature = "signals")]
            Some(wait::WaitObject::Signal(_)) => ThreadState::BlockedOnSignal,
            Some(wait::WaitObject::Sleep) => ThreadState::Sleeping,
            Some(wait::WaitObject::Suspended) => ThreadState::Suspended,
            None => unreachable!(),
        },
    }
}

/// Thread and scheduler services.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a thread in the Created state.
    ///
    /// Fails with `EMFILE` when no slot is free, `ENOSPC` when the stack is
    /// too small, and `EINVAL` for a zero priority.
    pub fn create_thread(opts: &ThreadOptions) -> Result<ThreadId> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        create_thread_inner::<Traits>(lock.borrow_mut(), opts, false)
    }

    /// Start a previously created thread, making it runnable.
    pub fn start_thread(id: ThreadId) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        start_thread_inner::<Traits>(lock.borrow_mut(), id)?;

        // If the new thread has a higher priority, perform a context switch
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wait for the specified thread to terminate, then reclaim it.
    ///
    /// Interruptible; returns `EINTR` when a signal is delivered while
    /// blocked, `EDEADLK` on self-join, and `EINVAL` for a detached target.
    pub fn join_thread(id: ThreadId) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        expect_task_context::<Traits>()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;

        if running_slot::<Traits>(lock.borrow_mut()) == Some(id.slot) {
            return Err(Errno::EDEADLK);
        }
        if task.detached.get(&*lock) {
            return Err(Errno::EINVAL);
        }

        if *task.st.read(&*lock) != TaskSt::Terminated {
            let r = wait::wait(
                lock.borrow_mut(),
                wait::WaitObject::Join(id.slot),
                true,
                None,
            );
            if let Err(e) = r {
                return wait::finish_wait(lock, Err(e));
            }
        }

        // The waker only completes the wait once the target terminated, but
        // another joiner may have reclaimed (and something may have reused)
        // the slot in the meantime
        if *task.st.read(&*lock) == TaskSt::Terminated
            && task.generation.get(&*lock) == id.generation
        {
            reclaim_slot(lock.borrow_mut(), id.slot);
        }
        Ok(())
    }

    /// Detach the specified thread: its slot is reclaimed automatically
    /// when it terminates (immediately, if it already has).
    #[cfg(feature = "thread-detach")]
    pub fn detach_thread(id: ThreadId) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;
        if task.detached.get(&*lock) {
            return Err(Errno::EINVAL);
        }
        if *task.st.read(&*lock) == TaskSt::Terminated {
            reclaim_slot(lock.borrow_mut(), id.slot);
        } else {
            task.detached.replace(&mut *lock, true);
        }
        Ok(())
    }

    /// Detach support is configured out; always fails with `ENOTSUP`.
    #[cfg(not(feature = "thread-detach"))]
    pub fn detach_thread(id: ThreadId) -> Result<()> {
        let _ = id;
        Err(Errno::ENOTSUP)
    }

    /// Terminate the calling thread.
    ///
    /// Held mutexes are released (with a normal handoff to their next
    /// waiters); joiners are woken. Panics when called from an interrupt
    /// context.
    pub fn exit_thread() -> ! {
        exit_current_thread::<Traits>()
    }

    /// Get the calling thread's identifier.
    pub fn current_thread() -> Result<ThreadId> {
        expect_task_context::<Traits>()?;
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let slot = running_slot::<Traits>(lock.borrow_mut()).unwrap();
        let generation = task_cb::<Traits>(slot).generation.get(&*lock);
        Ok(ThreadId { slot, generation })
    }

    /// Let an equal-priority peer run, if one is ready.
    ///
    /// The calling thread is rotated behind the threads of its effective
    /// priority.
    pub fn yield_now() -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        expect_task_context::<Traits>()?;

        let slot = running_slot::<Traits>(lock.borrow_mut()).unwrap();
        make_ready(lock.borrow_mut(), slot, false);
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get a thread's base priority.
    pub fn thread_priority(id: ThreadId) -> Result<u8> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;
        Ok(task.base_priority.get(&*lock))
    }

    /// Get a thread's effective priority (what the scheduler uses; may be
    /// elevated by a mutex locking protocol).
    pub fn thread_effective_priority(id: ThreadId) -> Result<u8> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;
        Ok(task.effective_priority.get(&*lock))
    }

    /// Get a thread's state.
    pub fn thread_state(id: ThreadId) -> Result<ThreadState> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;
        Ok(public_state(lock.borrow_mut(), task))
    }

    /// Change a thread's base priority.
    ///
    /// The effective priority is recalculated according to the locking
    /// protocols of held mutexes and the change is propagated along any
    /// priority-inheritance chain the thread participates in.
    ///
    /// When `always_behind` is set, the thread is placed at the tail of its
    /// new priority bucket even if the priority didn't change.
    pub fn set_thread_priority(id: ThreadId, priority: u8, always_behind: bool) -> Result<()> {
        if priority == 0 {
            return Err(Errno::EINVAL);
        }

        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;
        if *task.st.read(&*lock) == TaskSt::Terminated {
            return Err(Errno::EINVAL);
        }

        let old_effective = task.effective_priority.get(&*lock);
        task.base_priority.replace(&mut *lock, priority);

        // Recalculate the effective priority and follow the inheritance
        // chain
        mutex::reevaluate_priority_chain(lock.borrow_mut(), id.slot);

        if always_behind
            && task.effective_priority.get(&*lock) == old_effective
            && *task.st.read(&*lock) == TaskSt::Ready
        {
            // Forced rotation to the tail of the (unchanged) bucket
            let state = Traits::state();
            state
                .ready
                .remove(lock.borrow_mut(), id.slot, old_effective as usize);
            state.ready.push(lock.borrow_mut(), id.slot, false);
        }

        // The change may allow a Ready thread to preempt, or deprioritize
        // the caller below one
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Suspend the calling thread until [`Self::resume_thread`].
    ///
    /// Interruptible; returns `EINTR` when a signal is delivered while
    /// suspended.
    pub fn suspend() -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        expect_task_context::<Traits>()?;

        let r = wait::wait(lock.borrow_mut(), wait::WaitObject::Suspended, true, None);
        wait::finish_wait(lock, r)
    }

    /// Resume a thread suspended by [`Self::suspend`].
    ///
    /// Fails with `EINVAL` if the thread is not suspended.
    pub fn resume_thread(id: ThreadId) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;

        let suspended = *task.st.read(&*lock) == TaskSt::Waiting
            && matches!(
                wait::current_wait_object(lock.borrow_mut(), task),
                Some(wait::WaitObject::Suspended)
            );
        if !suspended {
            return Err(Errno::EINVAL);
        }

        wait::interrupt_thread(lock.borrow_mut(), id.slot, Ok(()));
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
