//! One-shot initialization.
use crate::{
    error::Result,
    klock::{self, MaskCell},
    task,
    utils::{slot_list::ListHead, Init},
    wait, KernelTraits, PortThreading,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnceState {
    Incomplete,
    /// A caller is currently running the initializer; later callers block
    /// on the waiter list.
    InProgress,
    Done,
}

/// A once-flag for [`Self::call_once`]: across any set of concurrent
/// callers, the initializer runs exactly once, and no caller returns until
/// that invocation has completed.
pub struct OnceFlag<Traits: PortThreading> {
    state: MaskCell<Traits, OnceState>,
    pub(crate) wait_queue: MaskCell<Traits, ListHead>,
}

// Safety: the mutable state is confined to `MaskCell`s
unsafe impl<Traits: PortThreading> Sync for OnceFlag<Traits> {}

impl<Traits: KernelTraits> OnceFlag<Traits> {
    /// Construct a flag in the uninitialized state.
    pub const fn new() -> Self {
        Self {
            state: MaskCell::new(OnceState::Incomplete),
            wait_queue: Init::INIT,
        }
    }

    /// Run `f` exactly once across all callers using this flag.
    ///
    /// `f` may be any one-shot callable, so initializer arguments are
    /// passed by capturing them in a closure; a caller that loses the race
    /// never invokes (and simply drops) its own `f`. The winning caller
    /// runs `f` outside the critical section - it may block and use every
    /// kernel service. Concurrent callers block until the invocation
    /// completes; all callers observe its effects.
    pub fn call_once<F: FnOnce()>(&'static self, f: F) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        task::expect_task_context::<Traits>()?;

        loop {
            match self.state.get(&*lock) {
                OnceState::Done => return Ok(()),
                OnceState::InProgress => {
                    // Uninterruptible: `call_once` must not return before
                    // the initializer has run
                    wait::wait(lock.borrow_mut(), wait::WaitObject::Once(self), false, None)?;
                }
                OnceState::Incomplete => break,
            }
        }

        self.state.replace(&mut *lock, OnceState::InProgress);
        drop(lock);

        f();

        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        self.state.replace(&mut *lock, OnceState::Done);
        while wait::wake_one(lock.borrow_mut(), &self.wait_queue).is_some() {}
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

impl<Traits: KernelTraits> Default for OnceFlag<Traits> {
    fn default() -> Self {
        Self::new()
    }
}
