//! Mutex types, priority protocols, and timed acquisition.
mod common;

/// A recursive mutex counts its relocks and releases on the last unlock.
mod recursive {
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Errno, Mutex, MutexProtocol, MutexType};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static M: Mutex<SystemTraits> =
        Mutex::new(MutexType::Recursive, MutexProtocol::None, 0);

    fn main_thread(_: usize) {
        M.lock().unwrap();
        M.lock().unwrap();
        M.try_lock().unwrap();

        M.unlock().unwrap();
        M.unlock().unwrap();
        M.unlock().unwrap();

        // Fully released: a fourth unlock is a non-owner unlock
        assert_eq!(M.unlock(), Err(Errno::EPERM));

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn relock_counting() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// An error-checking mutex rejects relock and non-owner unlock.
mod error_checking {
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Errno, Mutex, MutexProtocol, MutexType, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static M: Mutex<SystemTraits> =
        Mutex::new(MutexType::ErrorChecking, MutexProtocol::None, 0);

    fn non_owner(_: usize) {
        assert_eq!(M.unlock(), Err(Errno::EPERM));
    }

    fn main_thread(_: usize) {
        M.lock().unwrap();
        assert_eq!(M.lock(), Err(Errno::EDEADLK));

        // Another thread can't release our lock
        let t = Sys::create_thread(&ThreadOptions::new(non_owner, 0, 9)).unwrap();
        Sys::start_thread(t).unwrap();
        Sys::join_thread(t).unwrap();

        M.unlock().unwrap();
        assert_eq!(M.unlock(), Err(Errno::EPERM));

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn relock_and_ownership_checks() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// Try-lock and timed lock against a held mutex.
mod timed_acquisition {
    use std::time::Duration as StdDuration;
    use tern_kernel::{
        BootOptions, Duration, Errno, Mutex, MutexProtocol, MutexType, System, ThreadOptions,
        TimePoint,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static M: Mutex<SystemTraits> = Mutex::new(MutexType::Normal, MutexProtocol::None, 0);

    fn holder(_: usize) {
        M.lock().unwrap();
        Sys::sleep_for(Duration::from_ticks(10)).unwrap();
        M.unlock().unwrap();
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(holder, 0, 9)).unwrap();
        // The holder outranks us: it acquires and goes to sleep during
        // `start_thread`
        Sys::start_thread(t).unwrap();

        assert_eq!(M.try_lock(), Err(Errno::EBUSY));

        // A deadline in the past expires without blocking
        assert_eq!(M.try_lock_until(TimePoint::ORIGIN), Err(Errno::ETIMEDOUT));

        let before = Sys::now().unwrap();
        assert_eq!(M.try_lock_for(Duration::from_ticks(3)), Err(Errno::ETIMEDOUT));
        let elapsed = (Sys::now().unwrap() - before).as_ticks();
        assert!(elapsed >= 3, "gave up after only {elapsed} ticks");

        // Rollback left the waiter list coherent: the holder's unlock
        // finds nobody and the mutex becomes free
        M.try_lock_for(Duration::from_ticks(20)).unwrap();
        M.unlock().unwrap();

        Sys::join_thread(t).unwrap();
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn try_lock_and_deadlines() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// Priority protection raises the owner to the ceiling and rejects
/// over-ceiling callers.
mod priority_protect {
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Errno, Mutex, MutexProtocol, MutexType, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static M: Mutex<SystemTraits> =
        Mutex::new(MutexType::Normal, MutexProtocol::PriorityProtect, 7);

    fn over_ceiling(_: usize) {
        // Effective priority 9 exceeds the ceiling of 7
        assert_eq!(M.lock(), Err(Errno::EINVAL));
        assert_eq!(M.try_lock(), Err(Errno::EINVAL));
    }

    fn main_thread(_: usize) {
        let me = Sys::current_thread().unwrap();

        M.lock().unwrap();
        assert_eq!(Sys::thread_priority(me), Ok(5));
        assert_eq!(Sys::thread_effective_priority(me), Ok(7));

        M.unlock().unwrap();
        assert_eq!(Sys::thread_effective_priority(me), Ok(5));

        let t = Sys::create_thread(&ThreadOptions::new(over_ceiling, 0, 9)).unwrap();
        Sys::start_thread(t).unwrap();
        Sys::join_thread(t).unwrap();

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn ceiling_raise_and_validation() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// An invalid type/protocol combination falls back to a plain mutex.
mod construction_fallback {
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Mutex, MutexProtocol, MutexType, System};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    // Priority protection requires a ceiling of at least 1
    static M: Mutex<SystemTraits> =
        Mutex::new(MutexType::Recursive, MutexProtocol::PriorityProtect, 0);

    fn main_thread(_: usize) {
        let me = Sys::current_thread().unwrap();

        // No ceiling raise happens, and the mutex is not recursive
        M.lock().unwrap();
        assert_eq!(Sys::thread_effective_priority(me), Ok(5));
        M.unlock().unwrap();

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn invalid_combination_defaults_to_plain() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// Scenario: priority inheritance resolves a three-thread inversion.
///
/// Low-priority L holds an inheriting mutex; medium M spins; high H blocks
/// on the mutex. L must inherit H's priority, outrun M, and release; H then
/// finishes ahead of M.
mod priority_inheritance {
    use super::common::SequenceAsserter;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;
    use tern_kernel::{
        BootOptions, Duration, Mutex, MutexProtocol, MutexType, System, ThreadOptions,
        ThreadState,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static M: Mutex<SystemTraits> =
        Mutex::new(MutexType::Normal, MutexProtocol::PriorityInheritance, 0);
    static SEQ: SequenceAsserter = SequenceAsserter::new();
    static RELEASE: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn low(_: usize) {
        M.lock().unwrap();
        SEQ.point(0);
        while !RELEASE.load(Ordering::SeqCst) {
            // Busy-wait with a kernel call in the loop so higher-priority
            // wakeups can preempt this simulated thread
            let _ = Sys::now().unwrap();
        }
        M.unlock().unwrap();
        SEQ.point(5);
    }

    fn medium(_: usize) {
        while !DONE.load(Ordering::SeqCst) {
            let _ = Sys::now().unwrap();
        }
        SEQ.point(4);
    }

    fn high(_: usize) {
        SEQ.point(1);
        M.lock().unwrap();
        SEQ.point(2);
        M.unlock().unwrap();
        DONE.store(true, Ordering::SeqCst);
        SEQ.point(3);
    }

    fn main_thread(_: usize) {
        let l = Sys::create_thread(&ThreadOptions::new(low, 0, 1)).unwrap();
        Sys::start_thread(l).unwrap();
        // Let L acquire the mutex
        Sys::sleep_for(Duration::from_ticks(2)).unwrap();

        let m = Sys::create_thread(&ThreadOptions::new(medium, 0, 5)).unwrap();
        let h = Sys::create_thread(&ThreadOptions::new(high, 0, 9)).unwrap();
        Sys::start_thread(m).unwrap();
        Sys::start_thread(h).unwrap();
        // Let H reach the contended lock
        Sys::sleep_for(Duration::from_ticks(2)).unwrap();

        // H is blocked, and L runs at H's priority - not at M's mercy
        assert_eq!(Sys::thread_state(h), Ok(ThreadState::BlockedOnMutex));
        assert_eq!(Sys::thread_effective_priority(l), Ok(9));
        assert_eq!(Sys::thread_state(m), Ok(ThreadState::Runnable));

        RELEASE.store(true, Ordering::SeqCst);
        Sys::join_thread(h).unwrap();
        Sys::join_thread(m).unwrap();
        Sys::join_thread(l).unwrap();

        SEQ.assert_sequence(6);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn inversion_is_resolved() {
        SystemTraits::run(BootOptions::new(main_thread, 10), StdDuration::from_millis(1));
    }
}
