//! Software timers.
use crate::{
    error::{Errno, Result},
    klock::{self, CriticalSection, MaskCell},
    time::Duration,
    timeout, KernelTraits, PortThreading,
};

/// *Timer control block* - a software timer driven by the kernel tick.
///
/// The handler runs in the tick interrupt context with CPU Lock released;
/// it must not block and must not perform unbounded work. It may use the
/// interrupt-safe subset of kernel services (`post`, `notify_*`,
/// `queue_signal`, timer start/stop).
pub struct Timer<Traits: PortThreading> {
    handler: fn(usize),
    param: usize,

    /// `true` iff the timer is armed.
    pub(crate) active: MaskCell<Traits, bool>,

    /// The period in ticks; `0` for a one-shot timer.
    pub(crate) period: MaskCell<Traits, u64>,
}

// Safety: the mutable state is confined to `MaskCell`s
unsafe impl<Traits: PortThreading> Sync for Timer<Traits> {}

impl<Traits: KernelTraits> Timer<Traits> {
    /// Construct a stopped timer that will call `handler(param)` on each
    /// expiry.
    pub const fn new(handler: fn(usize), param: usize) -> Self {
        Self {
            handler,
            param,
            active: MaskCell::new(false),
            period: MaskCell::new(0),
        }
    }

    /// Arm the timer to expire once `delay` has elapsed and, if `period` is
    /// given, every `period` thereafter. An armed timer is restarted.
    ///
    /// Fails with `EINVAL` for a negative delay or a non-positive period,
    /// and `ENOBUFS` when the timer capacity is exhausted. Callable from an
    /// interrupt handler.
    pub fn start(&'static self, delay: Duration, period: Option<Duration>) -> Result<()> {
        if delay.is_negative() {
            return Err(Errno::EINVAL);
        }
        let period_ticks = match period {
            None => 0,
            Some(p) if p.as_ticks() <= 0 => return Err(Errno::EINVAL),
            Some(p) => p.as_ticks() as u64,
        };

        let mut lock = klock::CriticalSection::<Traits>::enter()?;

        timeout::cancel_timer_timeout(lock.borrow_mut(), self);

        let at = timeout::now_ticks::<Traits>(lock.borrow_mut()) + delay.as_ticks() as u64;
        timeout::insert_timer_timeout(lock.borrow_mut(), self, at)?;

        self.period.replace(&mut *lock, period_ticks);
        self.active.replace(&mut *lock, true);
        Ok(())
    }

    /// Disarm the timer. A handler already entered keeps running, but no
    /// further expiries occur. Callable from an interrupt handler.
    pub fn stop(&'static self) -> Result<()> {
        let mut lock = klock::CriticalSection::<Traits>::enter()?;
        timeout::cancel_timer_timeout(lock.borrow_mut(), self);
        self.active.replace(&mut *lock, false);
        Ok(())
    }

    /// Return `true` iff the timer is armed.
    pub fn is_active(&'static self) -> Result<bool> {
        let lock = klock::CriticalSection::<Traits>::enter()?;
        Ok(self.active.get(&*lock))
    }
}

/// Run an expired timer: re-arm a periodic timer, then invoke the handler
/// with CPU Lock released.
///
/// `fired_at` is the deadline that just expired; `now` is the current tick.
/// A periodic timer that missed ticks either burst-fires (the re-armed
/// deadline may still be due, so [`timeout::handle_tick`]'s loop fires it
/// again in the same tick) or coalesces to the next future deadline,
/// according to [`crate::cfg::TIMER_COALESCE_MISSED`].
pub(crate) fn fire_timer<Traits: KernelTraits>(
    t: &'static Timer<Traits>,
    mut lock: CriticalSection<Traits>,
    fired_at: u64,
    now: u64,
) -> CriticalSection<Traits> {
    debug_assert!(t.active.get(&*lock));

    let period = t.period.get(&*lock);
    if period > 0 {
        let mut next = fired_at + period;
        if crate::cfg::TIMER_COALESCE_MISSED && next <= now {
            let missed = (now - fired_at) / period;
            next = fired_at + (missed + 1) * period;
        }
        // Capacity can't run out: the expired entry was just removed
        timeout::insert_timer_timeout(lock.borrow_mut(), t, next).unwrap();
    } else {
        t.active.replace(&mut *lock, false);
    }

    // Release CPU Lock before calling the application-provided callback
    // function
    let (handler, param) = (t.handler, t.param);
    drop(lock);

    handler(param);

    // Re-acquire CPU Lock
    klock::CriticalSection::enter().unwrap()
}
