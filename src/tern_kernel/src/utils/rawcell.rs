use core::cell::UnsafeCell;

use super::Init;

/// An untracked mutable cell for control-block attributes that are written
/// once during object creation and only read afterwards.
///
/// Unlike `MaskCell`, accesses are not guarded by a token; the safety
/// contract below stands in for the missing tracking.
pub(crate) struct RawCell<T>(UnsafeCell<T>);

// Safety: all accesses go through the `unsafe` methods below, whose contract
// requires the caller to provide the necessary synchronization
unsafe impl<T: Send> Sync for RawCell<T> {}

impl<T> RawCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Read the contents.
    ///
    /// # Safety
    ///
    /// The caller must ensure no concurrent call to [`Self::set`] is in
    /// progress.
    #[inline]
    pub(crate) unsafe fn get(&self) -> T
    where
        T: Copy,
    {
        // Safety: Upheld by the caller
        unsafe { *self.0.get() }
    }

    /// Replace the contents.
    ///
    /// # Safety
    ///
    /// The caller must ensure no concurrent access of any kind is in
    /// progress.
    #[inline]
    pub(crate) unsafe fn set(&self, value: T) {
        // Safety: Upheld by the caller
        unsafe { *self.0.get() = value };
    }
}

impl<T: Init> Init for RawCell<T> {
    const INIT: Self = Self(Init::INIT);
}
