//! Per-thread signals.
//!
//! Each thread owns a pending-signal bitset, a bounded FIFO of queued
//! `(signal, value)` records, and an action table. A signal targeted at a
//! thread wakes it if it is waiting for that signal, and otherwise unwinds
//! any interruptible blocking call with `EINTR`; handlers run in the
//! receiving thread's context before the interrupted call returns.
use arrayvec::ArrayVec;

use crate::{
    cfg,
    error::{Errno, Result},
    klock::{self, MaskCell, MaskTokenRefMut},
    task::{self, get_task, task_cb, ThreadId},
    time::{Duration, TimePoint},
    timeout,
    utils::Init,
    wait, KernelTraits, PortThreading, System,
};

/// A set of signal numbers, represented as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u32);

impl SignalSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// A set holding every valid signal number.
    pub const ALL: Self = Self(((1u64 << cfg::SIGNAL_COUNT) - 1) as u32);

    /// Construct a set containing a single signal.
    pub const fn single(signal: u8) -> Self {
        Self(1 << signal)
    }

    /// Add a signal to the set.
    pub fn add(&mut self, signal: u8) {
        self.0 |= 1 << signal;
    }

    /// Remove a signal from the set.
    pub fn remove(&mut self, signal: u8) {
        self.0 &= !(1 << signal);
    }

    #[inline]
    pub fn contains(self, signal: u8) -> bool {
        self.0 & (1 << signal) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The lowest signal number in the set.
    fn lowest(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    /// The raw bitmask.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl core::ops::BitOr for SignalSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How a signal was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCode {
    /// Set as a bare pending bit by `generate_signal`; carries no value.
    Generated,
    /// Queued with a value by `queue_signal`.
    Queued,
}

/// Describes one delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub signal: u8,
    pub code: SignalCode,
    /// The accompanying value (zero for generated signals).
    pub value: usize,
}

/// The disposition of one signal number on one thread.
#[derive(Clone, Copy)]
pub enum SignalAction {
    /// No handler; the signal stays pending until waited for.
    Ignore,
    /// Run the handler in the receiving thread's context before an
    /// interrupted blocking call returns to user code.
    Handler(fn(SignalInfo)),
}

/// The signal state of a thread.
pub(crate) struct SignalState<Traits: PortThreading> {
    /// Signals generated but not yet consumed; carries no values.
    pub(crate) pending: MaskCell<Traits, SignalSet>,

    /// Queued `(signal, value)` records, oldest first.
    pub(crate) queue: MaskCell<Traits, ArrayVec<SignalInfo, { cfg::SIGNAL_QUEUE_DEPTH }>>,

    /// Per-signal dispositions.
    pub(crate) actions: MaskCell<Traits, [SignalAction; cfg::SIGNAL_COUNT]>,
}

impl<Traits: PortThreading> Init for SignalState<Traits> {
    const INIT: Self = Self {
        pending: MaskCell::new(SignalSet::EMPTY),
        queue: Init::INIT,
        actions: MaskCell::new([SignalAction::Ignore; cfg::SIGNAL_COUNT]),
    };
}

/// Reset a slot's signal state during thread creation.
pub(crate) fn reset_signal_state<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) {
    let sig = &task_cb::<Traits>(slot).sig;
    sig.pending.replace(&mut *lock, SignalSet::EMPTY);
    sig.queue.write(&mut *lock).clear();
    sig.actions
        .replace(&mut *lock, [SignalAction::Ignore; cfg::SIGNAL_COUNT]);
}

/// Return `true` iff the thread has any undelivered signal. Used to fail
/// interruptible waits with `EINTR` before they block.
pub(crate) fn is_signal_pending<Traits: KernelTraits>(
    lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) -> bool {
    let sig = &task_cb::<Traits>(slot).sig;
    !sig.pending.get(&*lock).is_empty() || !sig.queue.read(&*lock).is_empty()
}

fn check_signal_number(signal: u8) -> Result<()> {
    if (signal as usize) < cfg::SIGNAL_COUNT {
        Ok(())
    } else {
        Err(Errno::EINVAL)
    }
}

/// React to a signal that just became pending on `slot`: wake the thread if
/// it waits for this signal, or unwind its interruptible wait with `EINTR`.
///
/// This function may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn deliver<Traits: KernelTraits>(mut lock: MaskTokenRefMut<'_, Traits>, slot: u16, signal: u8) {
    let task = task_cb::<Traits>(slot);

    match wait::current_wait_object(lock.borrow_mut(), task) {
        Some(wait::WaitObject::Signal(set)) if set.contains(signal) => {
            // The waiter consumes the signal after it wakes
            wait::complete_wait(lock, slot, Ok(()));
        }
        Some(_) => {
            if task.wait.interruptible.get(&*lock) {
                wait::complete_wait(lock, slot, Err(Errno::EINTR));
            }
        }
        None => {}
    }
}

/// Take the oldest queued record (preferred) or the lowest pending bit
/// matching `set`.
fn take_matching<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
    set: SignalSet,
) -> Option<SignalInfo> {
    let sig = &task_cb::<Traits>(slot).sig;

    let queue_pos = sig
        .queue
        .read(&*lock)
        .iter()
        .position(|info| set.contains(info.signal));
    if let Some(i) = queue_pos {
        return Some(sig.queue.write(&mut *lock).remove(i));
    }

    let mut pending = sig.pending.get(&*lock);
    let hit = SignalSet(pending.bits() & set.bits()).lowest()?;
    pending.remove(hit);
    sig.pending.replace(&mut *lock, pending);
    Some(SignalInfo {
        signal: hit,
        code: SignalCode::Generated,
        value: 0,
    })
}

/// Take the oldest signal whose action is a handler, for post-`EINTR`
/// delivery.
fn take_handled<Traits: KernelTraits>(
    mut lock: MaskTokenRefMut<'_, Traits>,
    slot: u16,
) -> Option<(fn(SignalInfo), SignalInfo)> {
    let sig = &task_cb::<Traits>(slot).sig;
    let actions = sig.actions.get(&*lock);

    let handler_of = |signal: u8| match actions[signal as usize] {
        SignalAction::Handler(h) => Some(h),
        SignalAction::Ignore => None,
    };

    let queue_pos = sig
        .queue
        .read(&*lock)
        .iter()
        .position(|info| handler_of(info.signal).is_some());
    if let Some(i) = queue_pos {
        let info = sig.queue.write(&mut *lock).remove(i);
        return Some((handler_of(info.signal).unwrap(), info));
    }

    let mut pending = sig.pending.get(&*lock);
    let mut candidates = pending;
    while let Some(signal) = candidates.lowest() {
        candidates.remove(signal);
        if let Some(h) = handler_of(signal) {
            pending.remove(signal);
            sig.pending.replace(&mut *lock, pending);
            return Some((
                h,
                SignalInfo {
                    signal,
                    code: SignalCode::Generated,
                    value: 0,
                },
            ));
        }
    }
    None
}

/// Run the calling thread's handlers for every deliverable pending signal.
/// Called without CPU Lock, in the thread's own context, right before an
/// `EINTR`-unwound call returns to user code.
pub(crate) fn deliver_pending_handlers<Traits: KernelTraits>() {
    loop {
        let mut lock = match klock::CriticalSection::<Traits>::enter() {
            Ok(lock) => lock,
            Err(_) => return,
        };
        let Some(slot) = task::running_slot::<Traits>(lock.borrow_mut()) else {
            return;
        };
        let Some((handler, info)) = take_handled(lock.borrow_mut(), slot) else {
            return;
        };
        drop(lock);

        handler(info);
    }
}

/// Signal services.
impl<Traits: KernelTraits> System<Traits> {
    /// Make `signal` pending on the target thread without a value.
    ///
    /// Wakes the target if it waits for `signal`; unwinds its
    /// interruptible blocking call with `EINTR` otherwise. Callable from an
    /// interrupt handler.
    pub fn generate_signal(id: ThreadId, signal: u8) -> Result<()> {
        check_signal_number(signal)?;
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;

        let mut pending = task.sig.pending.get(&*lock);
        pending.add(signal);
        task.sig.pending.replace(&mut *lock, pending);

        deliver(lock.borrow_mut(), id.slot, signal);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Append a `(signal, value)` record to the target thread's signal
    /// queue.
    ///
    /// Fails with `EAGAIN` when the queue is full. Delivery behaves like
    /// [`Self::generate_signal`]. Callable from an interrupt handler.
    pub fn queue_signal(id: ThreadId, signal: u8, value: usize) -> Result<()> {
        check_signal_number(signal)?;
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        let task = get_task::<Traits>(lock.borrow_mut(), id)?;

        if task.sig.queue.read(&*lock).is_full() {
            return Err(Errno::EAGAIN);
        }
        task.sig.queue.write(&mut *lock).push(SignalInfo {
            signal,
            code: SignalCode::Queued,
            value,
        });

        deliver(lock.borrow_mut(), id.slot, signal);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wait for any signal in `set`, consuming and returning the first one
    /// delivered (queued records before bare pending bits).
    ///
    /// Returns `EINTR` when a signal *outside* `set` unwinds the wait.
    pub fn wait_signal(set: SignalSet) -> Result<SignalInfo> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let slot = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

        loop {
            if let Some(info) = take_matching(lock.borrow_mut(), slot, set) {
                return Ok(info);
            }
            let r = wait::wait(lock.borrow_mut(), wait::WaitObject::Signal(set), true, None);
            if let Err(e) = r {
                wait::finish_wait(lock, Err(e))?;
                unreachable!();
            }
        }
    }

    /// Consume a pending signal in `set` without blocking; fails with
    /// `EAGAIN` when none is pending.
    pub fn try_wait_signal(set: SignalSet) -> Result<SignalInfo> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let slot = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();
        take_matching(lock.borrow_mut(), slot, set).ok_or(Errno::EAGAIN)
    }

    /// Like [`Self::wait_signal`], giving up with `ETIMEDOUT` once at
    /// least `duration` full ticks have elapsed.
    pub fn wait_signal_for(set: SignalSet, duration: Duration) -> Result<SignalInfo> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let now = timeout::now_ticks::<Traits>(lock.borrow_mut());
        let deadline = now.saturating_add_signed(duration.as_ticks().saturating_add(1));
        wait_signal_deadline::<Traits>(lock, set, deadline)
    }

    /// Like [`Self::wait_signal`], giving up with `ETIMEDOUT` once the
    /// tick clock reaches `deadline`.
    pub fn wait_signal_until(set: SignalSet, deadline: TimePoint) -> Result<SignalInfo> {
        let lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        wait_signal_deadline::<Traits>(lock, set, deadline.as_ticks())
    }

    /// The set of signals currently pending on the calling thread
    /// (generated bits and queued records combined).
    pub fn pending_signal_set() -> Result<SignalSet> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let slot = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();
        let sig = &task_cb::<Traits>(slot).sig;

        let mut set = sig.pending.get(&*lock);
        for info in sig.queue.read(&*lock) {
            set.add(info.signal);
        }
        Ok(set)
    }

    /// Set the calling thread's disposition for `signal`, returning the
    /// previous one.
    pub fn set_signal_action(signal: u8, action: SignalAction) -> Result<SignalAction> {
        check_signal_number(signal)?;
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;
        let slot = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

        let actions = task_cb::<Traits>(slot).sig.actions.write(&mut *lock);
        let old = actions[signal as usize];
        actions[signal as usize] = action;
        Ok(old)
    }
}

fn wait_signal_deadline<Traits: KernelTraits>(
    mut lock: crate::klock::CriticalSection<Traits>,
    set: SignalSet,
    deadline: u64,
) -> Result<SignalInfo> {
    let slot = task::running_slot::<Traits>(lock.borrow_mut()).unwrap();

    loop {
        if let Some(info) = take_matching(lock.borrow_mut(), slot, set) {
            return Ok(info);
        }
        let r = wait::wait(
            lock.borrow_mut(),
            wait::WaitObject::Signal(set),
            true,
            Some(deadline),
        );
        if let Err(e) = r {
            wait::finish_wait(lock, Err(e))?;
            unreachable!();
        }
    }
}
