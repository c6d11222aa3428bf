//! Simulation environment for running the tern kernel on a hosted machine.
//!
//! Every kernel thread is backed by an OS worker thread, but the port
//! enforces the single-core execution model: at most one worker runs user
//! code at any moment, and the others are parked. A dedicated timer thread
//! plays the tick interrupt; it executes the tick handler under the kernel
//! critical section and, when the handler requests a reschedule, flags a
//! pending preemption that the running worker delivers at its next kernel
//! entry/exit boundary. This satisfies the kernel's context-switch contract
//! (a switch must occur before returning to user code from a kernel entry)
//! without asynchronously suspending OS threads; a thread that spins
//! forever without a single kernel call is not preemptible in this
//! simulation.
//!
//! There is no safe way to restart a simulated system within one process:
//! [`State::port_boot`] can run once per instantiated port.
use std::{
    any::Any,
    cell::Cell,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use once_cell::sync::OnceCell;
use slab::Slab;
use spin::Mutex as SpinMutex;
use tern_kernel::{task::TaskCb, BootOptions, Init, PortToKernel, System};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate tern_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// Implemented on a port trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    tern_kernel::KernelTraits + tern_kernel::PortToKernel
{
    fn port_state() -> &'static State;
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The timer thread, which backs the tick interrupt context.
    Interrupt,
    /// The backing thread for a kernel thread.
    Task,
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };
    /// The worker registry key of the current task worker.
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
    /// Set while port code is itself dispatching; suppresses the
    /// boundary-delivery of pending preemptions so that a scheduling
    /// decision in flight is never invalidated by a nested one.
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// The payload type used to unwind a worker thread out of existence.
struct ExitThread;

/// Terminate the calling worker thread.
fn exit_thread() -> ! {
    resume_unwind(Box::new(ExitThread))
}

/// Run a worker body, absorbing the [`ExitThread`] unwind. A genuine panic
/// is stashed for [`State::port_boot`] to re-raise and shuts the simulation
/// down so the test harness fails loudly instead of hanging.
fn run_worker<Traits: PortInstance>(f: impl FnOnce()) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => {}
        Err(payload) if payload.is::<ExitThread>() => {}
        Err(payload) => {
            let port = Traits::port_state().port();
            *port.panic_payload.lock().unwrap() = Some(payload);
            port.request_shutdown();
        }
    }
}

/// Parking state of one worker.
#[derive(Default)]
struct ParkState {
    /// The worker may run.
    go: bool,
    /// The simulation is over; the worker must exit.
    terminate: bool,
}

struct ParkSlot {
    state: Mutex<ParkState>,
    condvar: Condvar,
}

impl ParkSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(ParkState::default()),
            condvar: Condvar::new(),
        }
    }
}

struct Worker {
    park: Arc<ParkSlot>,
    join: Option<thread::JoinHandle<()>>,
}

/// Port-global scheduling state.
struct Sched {
    /// Which OS thread currently holds the kernel's CPU Lock.
    cpu_lock_owner: Option<thread::ThreadId>,

    /// Set by `yield_cpu` from the interrupt context; delivered by the
    /// running worker at its next kernel boundary.
    preempt_pending: bool,

    terminating: bool,

    workers: Slab<Worker>,
}

struct PortState {
    sched: SpinMutex<Sched>,
    shutdown_flag: Mutex<bool>,
    shutdown_condvar: Condvar,
    panic_payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PortState {
    fn new() -> Self {
        Self {
            sched: SpinMutex::new(Sched {
                cpu_lock_owner: None,
                preempt_pending: false,
                terminating: false,
                workers: Slab::new(),
            }),
            shutdown_flag: Mutex::new(false),
            shutdown_condvar: Condvar::new(),
            panic_payload: Mutex::new(None),
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_flag.lock().unwrap()
    }

    fn request_shutdown(&self) {
        *self.shutdown_flag.lock().unwrap() = true;
        self.shutdown_condvar.notify_all();
    }
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation
/// of the corresponding trait methods of [`tern_kernel::PortThreading`].
#[doc(hidden)]
pub struct State {
    port: OnceCell<PortState>,
}

/// The port-side per-thread state, embedded in each kernel [`TaskCb`].
#[derive(Debug)]
pub struct TaskState {
    /// The thread's state in the port task state machine.
    ///
    /// Accessed with CPU Lock or the port scheduler lock held, so a spin
    /// mutex is plenty; runtime performance is not a concern here.
    tsm: SpinMutex<Tsm>,
}

/// Port task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No worker; `initialize_task_state` hasn't run since creation.
    Uninit,
    /// Ready to get a worker on first dispatch.
    Dormant,
    /// Backed by the worker with the given registry key.
    Running(usize),
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Init for TaskState {
    const INIT: Self = Self::new();
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            port: OnceCell::new(),
        }
    }

    fn port(&self) -> &PortState {
        self.port.get().expect("the port has not been booted")
    }

    /// Boot the simulated system and block until [`shutdown`] is called
    /// from inside it. Worker threads are joined before returning; a panic
    /// that occurred on any of them is re-raised here.
    pub fn port_boot<Traits: PortInstance>(
        &'static self,
        opts: BootOptions,
        tick_period: Duration,
    ) {
        let _ = env_logger::Builder::from_default_env().try_init();

        assert!(
            self.port.set(PortState::new()).is_ok(),
            "the simulated system cannot be restarted"
        );

        // The boot context runs the kernel's startup hook and evaporates
        // after the first dispatch
        log::trace!("spawning the boot thread");
        let boot_thread = thread::Builder::new()
            .name("boot".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
                run_worker::<Traits>(|| {
                    // Safety: We are the port, calling this exactly once
                    unsafe { <Traits as PortToKernel>::boot(opts) };
                });
            })
            .unwrap();

        // The timer thread backs the tick interrupt context
        log::trace!("starting the timer thread, period = {tick_period:?}");
        let timer_thread = thread::Builder::new()
            .name("tick".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
                // `run_worker` surfaces a panic inside a tick handler as a
                // test failure instead of a hang
                run_worker::<Traits>(|| loop {
                    thread::sleep(tick_period);
                    if Traits::port_state().port().shutdown_requested() {
                        break;
                    }
                    // Safety: interrupt context, CPU Lock inactive, once
                    // per tick
                    unsafe { <Traits as PortToKernel>::timer_tick() };
                });
            })
            .unwrap();

        // Wait for a shutdown request
        {
            let port = self.port();
            let mut flag = port.shutdown_flag.lock().unwrap();
            while !*flag {
                flag = port.shutdown_condvar.wait(flag).unwrap();
            }
        }
        log::trace!("shutting down");

        // Tear the workers down and collect them
        let handles: Vec<_> = {
            let mut sched = self.port().sched.lock();
            sched.terminating = true;
            for (_, worker) in sched.workers.iter() {
                let mut state = worker.park.state.lock().unwrap();
                state.terminate = true;
                worker.park.condvar.notify_all();
            }
            sched
                .workers
                .iter_mut()
                .filter_map(|(_, worker)| worker.join.take())
                .collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        let _ = boot_thread.join();
        let _ = timer_thread.join();

        // Propagate any panic that occurred on a worker thread
        if let Some(payload) = self.port().panic_payload.lock().unwrap().take() {
            resume_unwind(payload);
        }
    }

    pub fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        let me = thread::current().id();
        loop {
            let mut sched = self.port().sched.lock();
            match sched.cpu_lock_owner {
                None => {
                    sched.cpu_lock_owner = Some(me);
                    return true;
                }
                Some(owner) if owner == me => return false,
                // Held by another execution context; wait for it
                Some(_) => {}
            }
            drop(sched);
            thread::yield_now();
        }
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        assert!(
            self.try_enter_cpu_lock::<Traits>(),
            "CPU Lock is not reentrant"
        );
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance<PortTaskState = TaskState>>(&'static self) {
        let is_task = THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task;
        let (deliver, terminate) = {
            let mut sched = self.port().sched.lock();
            assert_eq!(sched.cpu_lock_owner, Some(thread::current().id()));
            sched.cpu_lock_owner = None;

            // Preemption requested by the interrupt context is delivered
            // here, the running worker's kernel boundary
            let deliver = sched.preempt_pending
                && is_task
                && !IN_DISPATCH.with(|flag| flag.get());
            if deliver {
                sched.preempt_pending = false;
            }
            (deliver, sched.terminating && is_task)
        };

        if terminate {
            // The simulation is being torn down; don't let a worker spin on
            exit_thread();
        }
        if deliver {
            self.dispatch::<Traits>();
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        self.port().sched.lock().cpu_lock_owner == Some(thread::current().id())
    }

    pub unsafe fn yield_cpu<Traits: PortInstance<PortTaskState = TaskState>>(&'static self) {
        match THREAD_ROLE.with(|role| role.get()) {
            ThreadRole::Task => self.dispatch::<Traits>(),
            ThreadRole::Interrupt => {
                self.port().sched.lock().preempt_pending = true;
            }
            role => panic!("`yield_cpu` called from an unexpected context: {role:?}"),
        }
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance<PortTaskState = TaskState>>(
        &self,
        task: &'static TaskCb<Traits>,
    ) {
        log::trace!("initialize_task_state {task:p}");
        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Uninit => *tsm = Tsm::Dormant,
            Tsm::Dormant => {}
            Tsm::Running(_) => panic!("restarting a live thread is not supported"),
        }
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance<PortTaskState = TaskState>>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch {task:p}");
        debug_assert_eq!(THREAD_ROLE.with(|role| role.get()), ThreadRole::Task);

        // Dissociate this worker from the kernel thread; the slot may be
        // recycled for a future thread with a fresh worker
        *task.port_task_state.tsm.lock() = Tsm::Uninit;

        // Release CPU Lock, which the kernel left active
        {
            let mut sched = self.port().sched.lock();
            assert_eq!(sched.cpu_lock_owner, Some(thread::current().id()));
            sched.cpu_lock_owner = None;
        }

        // Hand the processor over
        IN_DISPATCH.with(|flag| flag.set(true));
        // Safety: CPU Lock inactive
        if let Some(next) = unsafe { Traits::choose_running_task() } {
            let key = self.worker_for::<Traits>(next);
            self.wake_worker(key);
        }

        exit_thread()
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance<PortTaskState = TaskState>>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        debug_assert_eq!(THREAD_ROLE.with(|role| role.get()), ThreadRole::Boot);

        // Release CPU Lock, which the kernel left active
        {
            let mut sched = self.port().sched.lock();
            assert_eq!(sched.cpu_lock_owner, Some(thread::current().id()));
            sched.cpu_lock_owner = None;
        }

        // Safety: CPU Lock inactive
        let first = unsafe { Traits::choose_running_task() };
        let key = self.worker_for::<Traits>(first.expect("no thread to dispatch at boot"));
        self.wake_worker(key);

        // The boot context is never returned to
        exit_thread()
    }

    pub unsafe fn idle<Traits: PortInstance<PortTaskState = TaskState>>(&'static self) {
        // Keep the simulation responsive without burning a core
        thread::sleep(Duration::from_micros(100));

        let deliver = {
            let mut sched = self.port().sched.lock();
            if sched.terminating {
                drop(sched);
                exit_thread();
            }
            let deliver = sched.preempt_pending;
            if deliver {
                sched.preempt_pending = false;
            }
            deliver
        };
        if deliver {
            self.dispatch::<Traits>();
        }
    }

    /// Ask the kernel for a scheduling decision and transfer OS-level
    /// control accordingly: wake the elected worker and park the calling
    /// one until it is elected again.
    fn dispatch<Traits: PortInstance<PortTaskState = TaskState>>(&'static self) {
        let my_key = CURRENT_WORKER.with(|worker| worker.get());

        let target_key = {
            IN_DISPATCH.with(|flag| flag.set(true));
            // Safety: CPU Lock inactive (we are between kernel entries)
            let next = unsafe { Traits::choose_running_task() };
            let target_key = next.map(|task| self.worker_for::<Traits>(task));
            IN_DISPATCH.with(|flag| flag.set(false));
            target_key
        };

        if target_key == my_key {
            return;
        }

        if let Some(key) = target_key {
            self.wake_worker(key);
        }
        self.park_worker(my_key.expect("dispatch outside a task worker"));
    }

    /// The worker backing the given kernel thread, spawning one if the
    /// thread has none yet.
    fn worker_for<Traits: PortInstance<PortTaskState = TaskState>>(&'static self, task: &'static TaskCb<Traits>) -> usize {
        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Running(key) => key,
            Tsm::Dormant => {
                let key = self.spawn_worker::<Traits>(task);
                log::trace!("spawned worker {key} for task {task:p}");
                *tsm = Tsm::Running(key);
                key
            }
            Tsm::Uninit => unreachable!("dispatching a thread with no port state"),
        }
    }

    fn spawn_worker<Traits: PortInstance>(&'static self, task: &'static TaskCb<Traits>) -> usize {
        let park = Arc::new(ParkSlot::new());
        let key = {
            let mut sched = self.port().sched.lock();
            sched.workers.insert(Worker {
                park: park.clone(),
                join: None,
            })
        };

        let handle = thread::Builder::new()
            .name(format!("task-{key}"))
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
                CURRENT_WORKER.with(|worker| worker.set(Some(key)));

                run_worker::<Traits>(|| {
                    let state = Traits::port_state();

                    // Wait until this thread is scheduled for the first
                    // time
                    state.park_worker(key);

                    // Safety: The kernel asked us to run this thread, so
                    // it has been created
                    let (entry, param) = unsafe { task.entry_raw() };
                    log::debug!("task {task:p} is now running");
                    entry(param);

                    // Returning from the entry function terminates the
                    // thread
                    System::<Traits>::exit_thread();
                });
            })
            .unwrap();

        self.port().sched.lock().workers[key].join = Some(handle);
        key
    }

    fn wake_worker(&self, key: usize) {
        let park = self.port().sched.lock().workers[key].park.clone();
        let mut state = park.state.lock().unwrap();
        state.go = true;
        park.condvar.notify_all();
    }

    /// Park the calling worker until it is woken by [`Self::wake_worker`]
    /// (or the simulation shuts down).
    fn park_worker(&self, key: usize) {
        let park = self.port().sched.lock().workers[key].park.clone();
        let mut state = park.state.lock().unwrap();
        loop {
            if state.terminate {
                drop(state);
                exit_thread();
            }
            if state.go {
                state.go = false;
                return;
            }
            state = park.condvar.wait(state).unwrap();
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Return `true` iff the calling thread backs a task context.
pub fn is_task_context() -> bool {
    THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task
}

/// Return `true` iff the calling thread backs an interrupt context.
pub fn is_interrupt_context() -> bool {
    THREAD_ROLE.with(|role| role.get()) == ThreadRole::Interrupt
}

/// Initiate graceful shutdown from inside the simulated system and
/// terminate the calling thread.
///
/// [`State::port_boot`] returns once every worker has wound down.
pub fn shutdown<Traits: PortInstance>() -> ! {
    log::trace!("shutdown requested");
    Traits::port_state().port().request_shutdown();
    exit_thread()
}

/// Instantiate the port and wire it to a kernel instance.
///
/// ```ignore
/// tern_port_std::use_port!(unsafe struct SystemTraits);
///
/// SystemTraits::run(BootOptions::new(main_thread, 10), Duration::from_millis(1));
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::tern_kernel::{task::TaskCb, KernelState, KernelTraits, PortThreading};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();
            static KERNEL_STATE: KernelState<$SystemTraits> = KernelState::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl KernelTraits for $SystemTraits {
                #[inline]
                fn state() -> &'static KernelState<$SystemTraits> {
                    &KERNEL_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;

                unsafe fn try_enter_cpu_lock() -> bool {
                    PORT_STATE.try_enter_cpu_lock::<Self>()
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn idle() {
                    unsafe { PORT_STATE.idle::<Self>() }
                }

                fn is_task_context() -> bool {
                    $crate::is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    $crate::is_interrupt_context()
                }
            }
        }

        impl $SystemTraits {
            /// Boot the simulated kernel and block until
            /// `tern_port_std::shutdown` is called from inside it.
            $vis fn run(
                opts: $crate::tern_kernel::BootOptions,
                tick_period: ::std::time::Duration,
            ) {
                port_std_impl::PORT_STATE.port_boot::<Self>(opts, tick_period);
            }
        }
    };
}
