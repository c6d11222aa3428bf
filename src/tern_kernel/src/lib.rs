//! A preemptive, fixed-priority RTOS kernel for deeply-embedded targets.
//!
//! The kernel provides threads with strict priority scheduling (FIFO or
//! round-robin per thread), a monotonic tick clock, software timers, and the
//! classic POSIX-like synchronization primitives: mutexes (with priority
//! inheritance and priority protection), counting semaphores, condition
//! variables, per-thread signals, and one-shot initialization.
//!
//! The crate contains no architecture-specific code. A *port* supplies the
//! context-switch and interrupt-masking machinery by implementing
//! [`PortThreading`] and calling into [`PortToKernel`] from its startup hook
//! and tick interrupt handler.
//!
//! # Contexts
//!
//! Kernel services distinguish a *task context* (running on a thread's
//! stack) from an *interrupt context*. Blocking operations are only legal in
//! a task context; interrupt handlers may use the documented non-blocking
//! subset (`post`, `notify_*`, `queue_signal`, timer start/stop, tick
//! handler internals).
#![cfg_attr(not(test), no_std)]

pub mod cfg;
pub mod error;
mod klock;
pub mod time;
mod utils;

pub mod condvar;
pub mod mutex;
pub mod once;
pub mod semaphore;
#[cfg(feature = "signals")]
pub mod signal;
pub mod task;
pub mod timer;

mod timeout;
mod wait;

pub use crate::{
    condvar::ConditionVariable,
    error::{Errno, Result},
    mutex::{Mutex, MutexProtocol, MutexType},
    once::OnceFlag,
    semaphore::Semaphore,
    task::{SchedulingPolicy, ThreadId, ThreadOptions, ThreadState},
    time::{Duration, TickClock, TimePoint},
    timer::Timer,
    utils::Init,
};
#[cfg(feature = "signals")]
pub use crate::signal::{SignalAction, SignalCode, SignalInfo, SignalSet};

use crate::klock::MaskCell;

/// Implemented by a port to provide the low-level threading and
/// interrupt-masking primitives.
///
/// # Safety
///
/// Implementing this trait incorrectly (e.g., `leave_cpu_lock` not actually
/// restoring the interrupt mask) breaks the kernel's memory safety.
pub unsafe trait PortThreading: Sized + 'static {
    /// Port-specific per-thread state embedded in each [`task::TaskCb`].
    type PortTaskState: Send + Sync + Init + 'static;

    /// Try to enter a CPU Lock state. Returns `false` if CPU Lock is
    /// already active in the current execution context.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Enter a CPU Lock state, waiting for it to become available if
    /// another execution context holds it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. CPU Lock must be inactive in
    /// the current execution context.
    unsafe fn enter_cpu_lock();

    /// Leave a CPU Lock state, restoring the previous interrupt masking
    /// state.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. CPU Lock must be active.
    unsafe fn leave_cpu_lock();

    /// Return `true` iff CPU Lock is active in the current execution
    /// context.
    fn is_cpu_lock_active() -> bool;

    /// Request a context switch. The kernel calls this after making a
    /// scheduling decision necessary; the port performs the switch (e.g.
    /// by pending a PendSV-like software interrupt) and eventually calls
    /// [`PortToKernel::choose_running_task`].
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive.
    unsafe fn yield_cpu();

    /// Prepare the port-side execution state of a thread that is about to
    /// be started. Called with CPU Lock active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn initialize_task_state(task: &'static task::TaskCb<Self>);

    /// Discard the calling thread's execution state and switch to the next
    /// scheduled thread. Called with CPU Lock active; the port releases it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, from the exiting thread.
    unsafe fn exit_and_dispatch(task: &'static task::TaskCb<Self>) -> !;

    /// Start scheduling, dispatching the first thread chosen by
    /// [`PortToKernel::choose_running_task`]. Called once at the end of
    /// [`PortToKernel::boot`] with CPU Lock active; the port releases it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, exactly once.
    unsafe fn dispatch_first_task() -> !;

    /// Wait for an event. The idle thread calls this in a loop with CPU
    /// Lock inactive; a typical hardware port executes `wfi` here.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel's idle thread.
    unsafe fn idle();

    /// Return `true` iff the current context is a task context.
    fn is_task_context() -> bool;

    /// Return `true` iff the current context is an interrupt context.
    fn is_interrupt_context() -> bool;
}

/// Associates a port with its kernel state singleton.
///
/// # Safety
///
/// `state` must return the same `KernelState` instance every time, and that
/// instance must not be shared with another port.
pub unsafe trait KernelTraits: PortThreading {
    /// Get the kernel state singleton for this port.
    fn state() -> &'static KernelState<Self>;
}

/// The entry points the port calls into.
///
/// # Safety
///
/// These are only meant to be called by a port, from the documented
/// contexts.
pub unsafe trait PortToKernel: PortThreading {
    /// Boot the kernel: construct the idle thread and the main thread, make
    /// the first scheduling decision, and transfer control to the scheduler
    /// through [`PortThreading::dispatch_first_task`].
    ///
    /// # Safety
    ///
    /// Must be called exactly once, from the port's startup hook, with CPU
    /// Lock inactive.
    unsafe fn boot(opts: BootOptions) -> !;

    /// The tick interrupt entry. Advances the tick counter, fires due
    /// software timers, wakes expired timed waits, and performs round-robin
    /// accounting.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per tick, from an interrupt context,
    /// with CPU Lock inactive.
    unsafe fn timer_tick();

    /// Make a scheduling decision and return the thread that should run
    /// next (`None` only before the first threads are started).
    ///
    /// # Safety
    ///
    /// Must be called by the port's dispatcher with CPU Lock inactive.
    unsafe fn choose_running_task() -> Option<&'static task::TaskCb<Self>>;
}

unsafe impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(opts: BootOptions) -> ! {
        task::boot::<Traits>(opts)
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }

    unsafe fn choose_running_task() -> Option<&'static task::TaskCb<Traits>> {
        let mut lock = klock::CriticalSection::<Traits>::enter().unwrap();
        task::choose_next_running_task(lock.borrow_mut());
        let slot = Traits::state().running_task.get(&*lock);
        slot.map(task::task_cb::<Traits>)
    }
}

/// Parameters for [`PortToKernel::boot`], describing the main thread.
#[derive(Debug, Clone, Copy)]
pub struct BootOptions {
    /// The main thread's entry point.
    pub main_entry: fn(usize),
    /// The parameter passed to `main_entry`.
    pub main_param: usize,
    /// The main thread's base priority. Must not be zero (reserved for the
    /// idle thread).
    pub main_priority: u8,
    /// The main thread's stack size.
    pub main_stack_size: usize,
    /// The main thread's scheduling policy.
    pub main_policy: SchedulingPolicy,
}

impl BootOptions {
    /// Construct a `BootOptions` with the default stack size and FIFO
    /// scheduling.
    pub const fn new(main_entry: fn(usize), main_priority: u8) -> Self {
        Self {
            main_entry,
            main_param: 0,
            main_priority,
            main_stack_size: cfg::DEFAULT_STACK_SIZE,
            main_policy: SchedulingPolicy::Fifo,
        }
    }
}

/// The kernel's global state. Exactly one instance exists per port,
/// reachable through [`KernelTraits::state`].
pub struct KernelState<Traits: PortThreading> {
    /// The thread control block arena. A `ThreadId` is a slot index into
    /// this array plus the slot's generation at creation time.
    pub(crate) tasks: [task::TaskCb<Traits>; cfg::THREAD_CAPACITY],

    /// The ready queue: per-priority lists of Ready threads plus an
    /// occupancy bitmap.
    pub(crate) ready: task::readyqueue::ReadyQueue<Traits>,

    /// The currently running thread's slot, if any.
    pub(crate) running_task: MaskCell<Traits, Option<u16>>,

    /// Kernel ticks elapsed since boot. Advanced only by the tick
    /// interrupt; read anywhere.
    pub(crate) tick_count: MaskCell<Traits, u64>,

    /// Outstanding timeouts (timed waits and software timers), as a min-heap
    /// keyed by `(deadline, registration sequence)`.
    pub(crate) timeout_heap: MaskCell<Traits, timeout::TimeoutHeap<Traits>>,

    /// Monotonic counter breaking deadline ties in registration order.
    pub(crate) timeout_seq: MaskCell<Traits, u64>,
}

// Safety: every field is either immutable or a `MaskCell`, whose access
// requires the singleton interrupt-mask token
unsafe impl<Traits: PortThreading> Sync for KernelState<Traits> {}

impl<Traits: PortThreading> KernelState<Traits> {
    /// Construct an empty kernel state. The port places this in a `static`.
    pub const fn new() -> Self {
        Self {
            tasks: Init::INIT,
            ready: Init::INIT,
            running_task: MaskCell::new(None),
            tick_count: MaskCell::new(0),
            timeout_heap: Init::INIT,
            timeout_seq: MaskCell::new(0),
        }
    }
}

impl<Traits: PortThreading> Default for KernelState<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// The system API facade: kernel services, parameterized by the port.
///
/// Synchronization objects ([`Mutex`], [`Semaphore`], [`ConditionVariable`],
/// [`Timer`], [`OnceFlag`]) expose their operations as inherent methods
/// instead; this type carries the thread, clock, and signal services.
pub struct System<Traits>(core::marker::PhantomData<Traits>);
