//! Task ready queue implementation (internal use only).
use crate::{
    cfg,
    klock::{MaskCell, MaskTokenRefMut},
    utils::{
        slot_list::{ListAccessor, ListHead},
        Init, PrioBitmap,
    },
    KernelTraits, PortThreading,
};

use super::task_cb;

/// The ready queue: one FIFO list of Ready threads per priority level, plus
/// an occupancy bitmap for constant-time-ish "highest ready priority"
/// queries.
///
/// Invariant: `queues[i].first.is_some() == bitmap.get(i)`.
pub(crate) struct ReadyQueue<Traits: PortThreading> {
    bitmap: MaskCell<Traits, PrioBitmap>,
    queues: [MaskCell<Traits, ListHead>; cfg::PRIORITY_LEVELS],
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    const INIT: Self = Self {
        bitmap: Init::INIT,
        queues: Init::INIT,
    };
}

/// Get a `ListAccessor` for one priority bucket.
macro_rules! bucket {
    ($self:expr, $pri:expr, $lock:expr) => {
        ListAccessor::new(&$self.queues[$pri], |i| &task_cb::<Traits>(i).link, $lock)
    };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// The highest priority that has a Ready thread.
    #[inline]
    pub(crate) fn highest_ready_priority(
        &self,
        lock: MaskTokenRefMut<'_, Traits>,
    ) -> Option<usize> {
        self.bitmap.read(&*lock).find_highest_set()
    }

    /// Return a flag indicating whether a Ready thread exists whose
    /// effective priority is strictly higher than `priority`
    /// (`None` = any Ready thread qualifies).
    #[inline]
    pub(crate) fn has_ready_task_above(
        &self,
        lock: MaskTokenRefMut<'_, Traits>,
        priority: Option<u8>,
    ) -> bool {
        match self.bitmap.read(&*lock).find_highest_set() {
            None => false,
            Some(highest) => match priority {
                None => true,
                Some(p) => highest > p as usize,
            },
        }
    }

    /// Return a flag indicating whether a Ready thread exists exactly at
    /// `priority`.
    #[inline]
    pub(crate) fn has_ready_task_at(
        &self,
        lock: MaskTokenRefMut<'_, Traits>,
        priority: u8,
    ) -> bool {
        self.bitmap.read(&*lock).get(priority as usize)
    }

    /// Insert `slot` into the bucket for its current effective priority.
    ///
    /// `front` places the thread ahead of its equal-priority peers (used
    /// when a Running thread is preempted); otherwise it is placed behind
    /// them.
    pub(crate) fn push(&self, mut lock: MaskTokenRefMut<'_, Traits>, slot: u16, front: bool) {
        let pri = task_cb::<Traits>(slot).effective_priority.get(&*lock) as usize;

        let mut accessor = bucket!(self, pri, lock.borrow_mut());
        if front {
            accessor.push_front(slot);
        } else {
            accessor.push_back(slot);
        }

        let mut bitmap = self.bitmap.get(&*lock);
        bitmap.set(pri);
        self.bitmap.replace(&mut *lock, bitmap);
    }

    /// Unlink and return the first thread of the bucket for `pri`.
    pub(crate) fn pop_front_at(
        &self,
        mut lock: MaskTokenRefMut<'_, Traits>,
        pri: usize,
    ) -> Option<u16> {
        let mut accessor = bucket!(self, pri, lock.borrow_mut());
        let slot = accessor.pop_front();
        let empty = accessor.is_empty();

        if empty {
            let mut bitmap = self.bitmap.get(&*lock);
            bitmap.clear(pri);
            self.bitmap.replace(&mut *lock, bitmap);
        }
        slot
    }

    /// Unlink `slot` from the bucket for `pri` (the effective priority it
    /// was inserted with).
    pub(crate) fn remove(&self, mut lock: MaskTokenRefMut<'_, Traits>, slot: u16, pri: usize) {
        let mut accessor = bucket!(self, pri, lock.borrow_mut());
        accessor.remove(slot);
        let empty = accessor.is_empty();

        if empty {
            let mut bitmap = self.bitmap.get(&*lock);
            bitmap.clear(pri);
            self.bitmap.replace(&mut *lock, bitmap);
        }
    }
}
