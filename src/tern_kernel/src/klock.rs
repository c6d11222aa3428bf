//! Interrupt-masked critical sections.
//!
//! Kernel state is only touched while interrupts are masked above the
//! kernel-critical level, and this module makes that rule checkable at
//! compile time. Every mutable piece of kernel state lives in a
//! [`MaskCell`]; reading or writing one demands the [`MaskToken`]
//! singleton, and the only way to reach the token is a live
//! [`CriticalSection`]. Entering a section masks interrupts through the
//! port; letting it go out of scope restores the previous masking state,
//! whatever the exit path.
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{error::Errno, utils::Init, PortThreading};

pub(super) struct MaskTag<Traits>(Traits);

/// The singleton token witnessing "interrupts are masked". Borrowed out of
/// a [`CriticalSection`].
pub(super) type MaskToken<Traits> = tokenlock::UnsyncSingletonToken<MaskTag<Traits>>;

/// The keyhole a [`MaskCell`] is constructed with; only [`MaskToken`] fits
/// it.
pub(super) type MaskKeyhole<Traits> = tokenlock::SingletonTokenId<MaskTag<Traits>>;

/// Reborrowed form of the token, used in function parameters (it is
/// zero-sized, unlike `&mut CriticalSection`). It is not automatically
/// reborrowed across calls the way `&mut _` is; callers pass
/// `lock.borrow_mut()` explicitly.
pub(super) type MaskTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, MaskTag<Traits>>;

/// A piece of kernel state, accessible only under a [`CriticalSection`].
pub(super) struct MaskCell<Traits, T: ?Sized>(UnsyncTokenLock<T, MaskKeyhole<Traits>>);

impl<Traits, T> MaskCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(MaskKeyhole::new(), x))
    }
}

impl<Traits, T: Init> Init for MaskCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> ops::Deref for MaskCell<Traits, T> {
    type Target = UnsyncTokenLock<T, MaskKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for MaskCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// An interrupt-masked critical section.
///
/// Every mutating kernel operation runs inside one: queue surgery, state
/// transitions, priority changes. While a section is live no context switch
/// occurs, so the holder must not perform unbounded work.
pub(super) struct CriticalSection<Traits: PortThreading> {
    token: MaskToken<Traits>,
}

impl<Traits: PortThreading> CriticalSection<Traits> {
    /// Mask interrupts and open a section.
    ///
    /// Fails with `EPERM` when the calling context already has one open:
    /// kernel services must not be reentered from within a critical
    /// section.
    pub(super) fn enter() -> Result<Self, Errno> {
        // Safety: masking requests may only come from the kernel, which is
        // who we are
        if unsafe { Traits::try_enter_cpu_lock() } {
            // Safety: the masking took effect just now, so no section (and
            // hence no token) was live before this point
            Ok(unsafe { Self::assume_active() })
        } else {
            Err(Errno::EPERM)
        }
    }

    /// Open a section over masking that is already in effect (boot, or a
    /// thread re-entering the kernel after a context switch).
    ///
    /// # Safety
    ///
    /// Interrupts must really be masked, and no other `CriticalSection`
    /// may exist; two sections would alias the singleton token.
    pub(super) unsafe fn assume_active() -> Self {
        debug_assert!(Traits::is_cpu_lock_active());

        Self {
            // Safety: uniqueness is the caller's obligation
            token: unsafe { MaskToken::new_unchecked() },
        }
    }

    /// Reborrow the token for passing down a call chain.
    pub(super) fn borrow_mut(&mut self) -> MaskTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }

    /// Consume the section while leaving interrupts masked.
    ///
    /// Used across `dispatch_first_task` and `exit_and_dispatch`: the port
    /// takes over the masking state and releases it on the far side of the
    /// context switch.
    pub(super) fn transfer_to_port(self) {
        core::mem::forget(self);
    }
}

impl<Traits: PortThreading> Drop for CriticalSection<Traits> {
    fn drop(&mut self) {
        // Safety: this section opened (or adopted) the masking, so it is
        // ours to undo
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CriticalSection<Traits> {
    type Target = MaskToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CriticalSection<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
