//! Mutexes.
use crate::{
    cfg,
    error::{Errno, Result},
    klock::{self, MaskCell, MaskTokenRefMut},
    task::{self, task_cb},
    time::{Duration, TimePoint},
    timeout,
    utils::{slot_list::ListHead, Init},
    wait, KernelTraits, PortThreading,
};

/// Behaviour on relock and on unlock by a non-owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// No ownership checks beyond the ones every type gets. Relocking by
    /// the owner deadlocks the caller (this implementation blocks, and
    /// documents it - POSIX leaves it undefined).
    Normal,
    /// Relocking fails with `EDEADLK`.
    ErrorChecking,
    /// Relocking increments a lock count; the mutex is released when the
    /// count returns to zero.
    Recursive,
}

/// The priority protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority adjustment.
    None,
    /// The owner inherits the highest effective priority among the
    /// waiters.
    PriorityInheritance,
    /// The owner runs at least at the mutex's priority ceiling.
    PriorityProtect,
}

/// *Mutex control block* - the state data of a mutex.
pub struct Mutex<Traits: PortThreading> {
    type_: MutexType,
    protocol: MutexProtocol,
    ceiling: u8,

    /// The thread that currently owns the lock.
    pub(crate) owner: MaskCell<Traits, Option<u16>>,

    /// Number of extra recursive locks (only ever non-zero for
    /// [`MutexType::Recursive`]).
    pub(crate) recursion_count: MaskCell<Traits, u16>,

    /// Threads waiting to acquire, ordered by effective priority.
    pub(crate) wait_queue: MaskCell<Traits, ListHead>,

    /// The next element in the singly-linked chain headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by
    /// the owner. The chain feeds the effective-priority calculation.
    pub(crate) prev_mutex_held: MaskCell<Traits, Option<&'static Mutex<Traits>>>,
}

// Safety: the mutable state is confined to `MaskCell`s
unsafe impl<Traits: PortThreading> Sync for Mutex<Traits> {}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Construct a mutex.
    ///
    /// `ceiling` is only meaningful for [`MutexProtocol::PriorityProtect`]
    /// and must then be at least 1; an invalid combination falls back to
    /// `Normal`/`None`.
    pub const fn new(type_: MutexType, protocol: MutexProtocol, ceiling: u8) -> Self {
        let (type_, protocol) = match protocol {
            MutexProtocol::PriorityProtect if ceiling == 0 => {
                (MutexType::Normal, MutexProtocol::None)
            }
            _ => (type_, protocol),
        };
        Self {
            type_,
            protocol,
            ceiling,
            owner: MaskCell::new(None),
            recursion_count: MaskCell::new(0),
            wait_queue: Init::INIT,
            prev_mutex_held: MaskCell::new(None),
        }
    }

    /// Acquire the mutex, blocking until it is available.
    ///
    /// Interruptible; returns `EINTR` when a signal is delivered while
    /// blocked. For `PriorityProtect`, fails with `EINVAL` when the
    /// caller's effective priority exceeds the ceiling.
    pub fn lock(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let r = lock_inner(self, lock.borrow_mut(), None, true);
        wait::finish_wait(lock, r)
    }

    /// Acquire the mutex without blocking; fails with `EBUSY` when it is
    /// held (recursive relock by the owner still succeeds).
    pub fn try_lock(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        try_lock_inner(self, lock.borrow_mut())
    }

    /// Acquire the mutex, giving up with `ETIMEDOUT` once at least
    /// `duration` full ticks have elapsed.
    pub fn try_lock_for(&'static self, duration: Duration) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let now = timeout::now_ticks::<Traits>(lock.borrow_mut());
        let deadline = now.saturating_add_signed(duration.as_ticks().saturating_add(1));
        let r = lock_inner(self, lock.borrow_mut(), Some(deadline), true);
        wait::finish_wait(lock, r)
    }

    /// Acquire the mutex, giving up with `ETIMEDOUT` once the tick clock
    /// reaches `deadline`.
    pub fn try_lock_until(&'static self, deadline: TimePoint) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let r = lock_inner(self, lock.borrow_mut(), Some(deadline.as_ticks()), true);
        wait::finish_wait(lock, r)
    }

    /// Release the mutex.
    ///
    /// Fails with `EPERM` if the caller is not the owner (checked for
    /// every type, including `Normal`, where POSIX leaves the case
    /// undefined). The highest-priority waiter, if any, receives the
    /// ownership directly.
    pub fn unlock(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;

        let cur = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();
        if self.owner.get(&*lock) != Some(cur) {
            return Err(Errno::EPERM);
        }

        let count = self.recursion_count.get(&*lock);
        if count > 0 {
            self.recursion_count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        release_and_hand_off(lock.borrow_mut(), self, cur);

        // Lowering our effective priority may allow a Ready thread (or the
        // new owner) to preempt
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The mutex's priority ceiling (meaningful for `PriorityProtect`).
    pub fn ceiling(&self) -> u8 {
        self.ceiling
    }

    pub(crate) fn protocol(&self) -> MutexProtocol {
        self.protocol
    }
}

// Locking
// ---------------------------------------------------------------------------

/// Check the error conditions of a lock attempt by `cur`.
///
/// Returns `Ok(true)` if the attempt was completed as a recursive relock.
fn precheck<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    m: &'static Mutex<Traits>,
    cur: u16,
) -> Result<bool> {
    if m.owner.get(&*lock) == Some(cur) {
        return match m.type_ {
            MutexType::Recursive => {
                let count = m.recursion_count.get(&*lock);
                if count == u16::MAX {
                    Err(Errno::EAGAIN)
                } else {
                    m.recursion_count.replace(&mut *lock, count + 1);
                    Ok(true)
                }
            }
            MutexType::ErrorChecking => Err(Errno::EDEADLK),
            // Relocking a `Normal` mutex deadlocks the caller: it joins
            // its own waiter list below
            MutexType::Normal => Ok(false),
        };
    }

    if m.protocol == MutexProtocol::PriorityProtect
        && task_cb::<Traits>(cur).effective_priority.get(&*lock) > m.ceiling
    {
        return Err(Errno::EINVAL);
    }

    Ok(false)
}

/// Give the ownership of the mutex to `slot` (a thread in the Running or
/// Waiting state): set the owner, push the mutex onto the thread's
/// owned-mutex chain, and apply the priority-protect ceiling.
pub(crate) fn lock_core<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    m: &'static Mutex<Traits>,
    slot: u16,
) {
    debug_assert!(m.owner.get(&*lock).is_none());
    debug_assert_eq!(m.recursion_count.get(&*lock), 0);

    m.owner.replace(&mut *lock, Some(slot));

    let task = task_cb::<Traits>(slot);
    let prev = task.last_mutex_held.replace(&mut *lock, Some(m));
    m.prev_mutex_held.replace(&mut *lock, prev);

    if m.protocol == MutexProtocol::PriorityProtect {
        let eff = task.effective_priority.get(&*lock);
        if m.ceiling > eff {
            task::set_effective_priority(lock, slot, m.ceiling);
        }
    }
}

pub(crate) fn lock_inner<Traits: KernelTraits>(
    m: &'static Mutex<Traits>,
    mut lock: MaskTokenRefMut<'_, Traits>,
    deadline: Option<u64>,
    interruptible: bool,
) -> Result<()> {
    let cur = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

    if precheck(lock.borrow_mut(), m, cur)? {
        return Ok(());
    }

    if m.owner.get(&*lock).is_none() {
        lock_core(lock, m, cur);
        return Ok(());
    }

    // Contended: queue up and propagate our priority along the ownership
    // chain before blocking
    wait::prepare_wait(
        lock.borrow_mut(),
        wait::WaitObject::Mutex(m),
        interruptible,
        deadline,
    )?;
    if m.protocol == MutexProtocol::PriorityInheritance {
        let owner = m.owner.get(&*lock).unwrap();
        reevaluate_priority_chain(lock.borrow_mut(), owner);
    }

    let r = wait::commit_wait(lock.borrow_mut());
    match r {
        Ok(()) => {
            // The previous owner handed the mutex to us
            debug_assert_eq!(m.owner.get(&*lock), Some(cur));
            Ok(())
        }
        Err(e) => {
            // The wait was rolled back (timeout or interruption); the
            // waiter list no longer contains us, so the owner's inherited
            // priority may drop
            if m.protocol == MutexProtocol::PriorityInheritance {
                if let Some(owner) = m.owner.get(&*lock) {
                    reevaluate_priority_chain(lock.borrow_mut(), owner);
                }
            }
            Err(e)
        }
    }
}

fn try_lock_inner<Traits: KernelTraits>(
    m: &'static Mutex<Traits>,
    mut lock: MaskTokenRefMut<'_, Traits>,
) -> Result<()> {
    let cur = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

    if m.owner.get(&*lock) == Some(cur) {
        return match m.type_ {
            MutexType::Recursive => {
                let count = m.recursion_count.get(&*lock);
                if count == u16::MAX {
                    Err(Errno::EAGAIN)
                } else {
                    m.recursion_count.replace(&mut *lock, count + 1);
                    Ok(())
                }
            }
            _ => Err(Errno::EBUSY),
        };
    }

    if m.protocol == MutexProtocol::PriorityProtect
        && task_cb::<Traits>(cur).effective_priority.get(&*lock) > m.ceiling
    {
        return Err(Errno::EINVAL);
    }

    if m.owner.get(&*lock).is_none() {
        lock_core(lock, m, cur);
        Ok(())
    } else {
        Err(Errno::EBUSY)
    }
}

// Unlocking
// ---------------------------------------------------------------------------

#[inline]
fn same_mutex<Traits: PortThreading>(
    a: Option<&'static Mutex<Traits>>,
    b: &'static Mutex<Traits>,
) -> bool {
    matches!(a, Some(a) if core::ptr::eq(a, b))
}

/// Remove `m` from `slot`'s owned-mutex chain. Unlike the push in
/// [`lock_core`], removal may happen from the middle - mutexes may be
/// unlocked in any order.
fn detach_from_owned_chain<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
    m: &'static Mutex<Traits>,
) {
    let task = task_cb::<Traits>(slot);

    if same_mutex(task.last_mutex_held.get(&*lock), m) {
        let new_head = m.prev_mutex_held.get(&*lock);
        task.last_mutex_held.replace(&mut *lock, new_head);
    } else {
        let mut cursor = task.last_mutex_held.get(&*lock);
        loop {
            let link = cursor.expect("mutex not on the owner's chain");
            let next = link.prev_mutex_held.get(&*lock);
            if same_mutex(next, m) {
                let new_next = m.prev_mutex_held.get(&*lock);
                link.prev_mutex_held.replace(&mut *lock, new_next);
                break;
            }
            cursor = next;
        }
    }

    m.prev_mutex_held.replace(&mut *lock, None);
}

/// Release `m` held by `cur` (recursion already at zero): detach it from
/// the owned chain, hand the ownership to the top waiter (if any), and
/// restore `cur`'s effective priority.
///
/// This function may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn release_and_hand_off<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    m: &'static Mutex<Traits>,
    cur: u16,
) {
    detach_from_owned_chain(lock.borrow_mut(), cur, m);

    if let Some(next) = m.wait_queue.read(&*lock).first {
        m.owner.replace(&mut *lock, None);
        lock_core(lock.borrow_mut(), m, next);

        // `complete_wait` unlinks `next` from our waiter list through its
        // wait object
        wait::complete_wait(lock.borrow_mut(), next, Ok(()));

        // The remaining waiters' priorities flow into the new owner
        if m.protocol == MutexProtocol::PriorityInheritance {
            reevaluate_priority_chain(lock.borrow_mut(), next);
        }
    } else {
        m.owner.replace(&mut *lock, None);
    }

    // Drop whatever priority `cur` had inherited through `m`
    reevaluate_priority_chain(lock, cur);
}

/// Release every mutex held by an exiting thread, handing each to its next
/// waiter.
///
/// This function may make threads Ready, but doesn't yield the processor.
/// The caller is about to dispatch away anyway.
pub(crate) fn release_all_held_mutexes<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) {
    let task = task_cb::<Traits>(slot);
    while let Some(m) = task.last_mutex_held.get(&*lock) {
        m.recursion_count.replace(&mut *lock, 0);
        release_and_hand_off(lock.borrow_mut(), m, slot);
    }
}

// Effective priority
// ---------------------------------------------------------------------------

/// Calculate a thread's effective priority from its base priority and the
/// locking protocols of the mutexes it holds:
///
/// `max(base, ceilings of held priority-protect mutexes, top-waiter
/// effective priorities of held priority-inheritance mutexes)`.
fn evaluate_task_effective_priority<Traits: KernelTraits>(
    lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) -> u8 {
    let task = task_cb::<Traits>(slot);
    let mut eff = task.base_priority.get(&*lock);

    let mut cursor = task.last_mutex_held.get(&*lock);
    while let Some(m) = cursor {
        match m.protocol {
            MutexProtocol::PriorityProtect => eff = eff.max(m.ceiling),
            MutexProtocol::PriorityInheritance => {
                if let Some(top) = m.wait_queue.read(&*lock).first {
                    eff = eff.max(task_cb::<Traits>(top).effective_priority.get(&*lock));
                }
            }
            MutexProtocol::None => {}
        }
        cursor = m.prev_mutex_held.get(&*lock);
    }

    eff
}

/// Reevaluate a thread's effective priority and propagate the change along
/// the priority-inheritance chain: if the thread is itself blocked on an
/// inheriting mutex, its new priority feeds that mutex's owner, and so on.
///
/// Chains can be arbitrarily long but contain no cycles (a cycle would be a
/// deadlock the originating thread is part of); the walk is nevertheless
/// bounded by the number of thread slots.
pub(crate) fn reevaluate_priority_chain<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) {
    let mut slot = slot;
    for _ in 0..cfg::THREAD_CAPACITY {
        let task = task_cb::<Traits>(slot);
        let new = evaluate_task_effective_priority(lock.borrow_mut(), slot);
        if new == task.effective_priority.get(&*lock) {
            break;
        }

        // Repositions the thread in the ready queue or its waiter list
        task::set_effective_priority(lock.borrow_mut(), slot, new);

        match wait::current_wait_object(lock.borrow_mut(), task) {
            Some(wait::WaitObject::Mutex(waited))
                if waited.protocol == MutexProtocol::PriorityInheritance =>
            {
                if let Some(owner) = waited.owner.get(&*lock) {
                    slot = owner;
                    continue;
                }
            }
            _ => {}
        }
        break;
    }
}
