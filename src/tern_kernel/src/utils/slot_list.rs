//! Doubly-linked lists of thread arena slots.
//!
//! Every kernel queue (the ready queue's priority buckets and all waiter
//! lists) is a doubly-linked list threaded through the per-thread
//! [`Link`] nodes stored in the TCB arena. A thread is on at most one queue
//! at a time, so a single node per thread suffices. Heads and links are
//! plain `Copy` values inside `MaskCell`s; an accessor borrows the CPU
//! Lock token for the duration of a sequence of operations.
use crate::{
    klock::{MaskCell, MaskTokenRefMut},
    utils::Init,
    PortThreading,
};

/// Head of a slot list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ListHead {
    pub(crate) first: Option<u16>,
    pub(crate) last: Option<u16>,
}

impl Init for ListHead {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

/// A thread's list node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) prev: Option<u16>,
    pub(crate) next: Option<u16>,
}

impl Init for Link {
    const INIT: Self = Self {
        prev: None,
        next: None,
    };
}

/// Accesses one slot list: the head cell, a function resolving a slot to its
/// link cell, and the interrupt-mask token authorizing the accesses.
pub(crate) struct ListAccessor<'a, 'b, Traits: PortThreading, F> {
    head: &'a MaskCell<Traits, ListHead>,
    link_of: F,
    lock: MaskTokenRefMut<'b, Traits>,
}

impl<'a, 'b, Traits, F> ListAccessor<'a, 'b, Traits, F>
where
    Traits: PortThreading,
    F: Fn(u16) -> &'a MaskCell<Traits, Link>,
{
    #[inline]
    pub(crate) fn new(
        head: &'a MaskCell<Traits, ListHead>,
        link_of: F,
        lock: MaskTokenRefMut<'b, Traits>,
    ) -> Self {
        Self {
            head,
            link_of,
            lock,
        }
    }

    /// Borrow the interrupt-mask token held by the accessor, for reading cells
    /// other than the list's own.
    #[inline]
    pub(crate) fn cell_key(&self) -> &MaskTokenRefMut<'b, Traits> {
        &self.lock
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.read(&*self.lock).first.is_none()
    }

    #[inline]
    pub(crate) fn front(&self) -> Option<u16> {
        self.head.read(&*self.lock).first
    }

    #[inline]
    pub(crate) fn back(&self) -> Option<u16> {
        self.head.read(&*self.lock).last
    }

    #[inline]
    pub(crate) fn prev(&self, i: u16) -> Option<u16> {
        (self.link_of)(i).read(&*self.lock).prev
    }

    /// Append `i` to the back of the list. `i` must not be linked.
    pub(crate) fn push_back(&mut self, i: u16) {
        debug_assert_eq!(*(self.link_of)(i).read(&*self.lock), Link::INIT);

        let mut head = self.head.get(&*self.lock);
        match head.last {
            None => {
                head.first = Some(i);
                head.last = Some(i);
            }
            Some(tail) => {
                let mut tail_link = (self.link_of)(tail).get(&*self.lock);
                tail_link.next = Some(i);
                (self.link_of)(tail).replace(&mut *self.lock, tail_link);

                (self.link_of)(i).replace(
                    &mut *self.lock,
                    Link {
                        prev: Some(tail),
                        next: None,
                    },
                );
                head.last = Some(i);
            }
        }
        self.head.replace(&mut *self.lock, head);
    }

    /// Prepend `i` to the front of the list. `i` must not be linked.
    pub(crate) fn push_front(&mut self, i: u16) {
        let first = self.front();
        self.insert_before(i, first);
    }

    /// Insert `i` before `at` (`None` = append to the back). `i` must not
    /// be linked; `at` must be linked.
    pub(crate) fn insert_before(&mut self, i: u16, at: Option<u16>) {
        let Some(at) = at else {
            self.push_back(i);
            return;
        };

        debug_assert_eq!(*(self.link_of)(i).read(&*self.lock), Link::INIT);

        let at_prev = (self.link_of)(at).get(&*self.lock).prev;

        (self.link_of)(i).replace(
            &mut *self.lock,
            Link {
                prev: at_prev,
                next: Some(at),
            },
        );

        let mut at_link = (self.link_of)(at).get(&*self.lock);
        at_link.prev = Some(i);
        (self.link_of)(at).replace(&mut *self.lock, at_link);

        match at_prev {
            Some(p) => {
                let mut p_link = (self.link_of)(p).get(&*self.lock);
                p_link.next = Some(i);
                (self.link_of)(p).replace(&mut *self.lock, p_link);
            }
            None => {
                let mut head = self.head.get(&*self.lock);
                head.first = Some(i);
                self.head.replace(&mut *self.lock, head);
            }
        }
    }

    /// Unlink `i` from the list. `i` must be linked in this list.
    pub(crate) fn remove(&mut self, i: u16) {
        let link = (self.link_of)(i).get(&*self.lock);
        let mut head = self.head.get(&*self.lock);

        match link.prev {
            Some(p) => {
                let mut p_link = (self.link_of)(p).get(&*self.lock);
                p_link.next = link.next;
                (self.link_of)(p).replace(&mut *self.lock, p_link);
            }
            None => {
                debug_assert_eq!(head.first, Some(i));
                head.first = link.next;
            }
        }
        match link.next {
            Some(n) => {
                let mut n_link = (self.link_of)(n).get(&*self.lock);
                n_link.prev = link.prev;
                (self.link_of)(n).replace(&mut *self.lock, n_link);
            }
            None => {
                debug_assert_eq!(head.last, Some(i));
                head.last = link.prev;
            }
        }

        self.head.replace(&mut *self.lock, head);
        (self.link_of)(i).replace(&mut *self.lock, Link::INIT);
    }

    /// Unlink and return the first element.
    pub(crate) fn pop_front(&mut self) -> Option<u16> {
        let first = self.front()?;
        self.remove(first);
        Some(first)
    }
}
