//! Error codes
use core::fmt;

/// A kernel error code.
///
/// The kernel reports every recoverable failure through one of these codes,
/// following the POSIX `errno` convention; the numeric values match the
/// common Linux assignments. Fatal conditions (queue corruption, invariant
/// violations) panic instead and never surface here.
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// The caller lacks the required ownership or calling context.
    EPERM = 1,
    /// A blocking call was unwound by signal delivery.
    EINTR = 4,
    /// The resource is temporarily unavailable (would-block `try*`
    /// operations, recursion or signal-queue exhaustion).
    EAGAIN = 11,
    /// The object is busy (`try_lock` on a held mutex).
    EBUSY = 16,
    /// Invalid argument, handle, or object state.
    EINVAL = 22,
    /// No thread control block slot is available.
    EMFILE = 24,
    /// Insufficient stack space.
    ENOSPC = 28,
    /// Acquiring the mutex would deadlock the caller.
    EDEADLK = 35,
    /// The software-timer capacity is exhausted.
    ENOBUFS = 105,
    /// The operation is not supported by the current configuration.
    ENOTSUP = 95,
    /// A counter would exceed its maximum value.
    EOVERFLOW = 75,
    /// The deadline of a timed operation expired.
    ETIMEDOUT = 110,
}

impl Errno {
    /// Get the raw POSIX error number.
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shorthand for `core::result::Result<T, Errno>`.
pub type Result<T = ()> = core::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_follow_errno_convention() {
        assert_eq!(Errno::EPERM.as_raw(), 1);
        assert_eq!(Errno::EINTR.as_raw(), 4);
        assert_eq!(Errno::EAGAIN.as_raw(), 11);
        assert_eq!(Errno::EBUSY.as_raw(), 16);
        assert_eq!(Errno::EINVAL.as_raw(), 22);
        assert_eq!(Errno::ETIMEDOUT.as_raw(), 110);
    }
}
