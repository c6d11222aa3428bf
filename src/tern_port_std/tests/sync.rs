//! Semaphores, condition variables, and call-once.
mod common;

/// Counting semaphore basics: bounds, would-block polling, and the
/// value/waiter invariant.
mod semaphore_basics {
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Errno, Semaphore};

    tern_port_std::use_port!(unsafe struct SystemTraits);

    static SEM: Semaphore<SystemTraits> = Semaphore::new(2, 3);

    fn main_thread(_: usize) {
        assert_eq!(SEM.max_value(), 3);
        assert_eq!(SEM.value(), Ok(2));

        SEM.wait().unwrap();
        SEM.wait().unwrap();
        assert_eq!(SEM.value(), Ok(0));
        assert_eq!(SEM.try_wait(), Err(Errno::EAGAIN));

        SEM.post().unwrap();
        SEM.post().unwrap();
        SEM.post().unwrap();
        assert_eq!(SEM.value(), Ok(3));
        assert_eq!(SEM.post(), Err(Errno::EOVERFLOW));

        // An uncontended wait right after a post leaves the value where it
        // started
        SEM.wait().unwrap();
        assert_eq!(SEM.value(), Ok(2));

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn value_bounds_and_polling() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// A post with a waiter present hands the token over directly; the value
/// never moves.
mod semaphore_handoff {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Semaphore, System, ThreadOptions, ThreadState};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static SEM: Semaphore<SystemTraits> = Semaphore::new(0, 1);
    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn waiter(_: usize) {
        SEQ.point(0);
        SEM.wait().unwrap();
        SEQ.point(2);
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(waiter, 0, 9)).unwrap();
        Sys::start_thread(t).unwrap();
        assert_eq!(Sys::thread_state(t), Ok(ThreadState::BlockedOnSemaphore));

        SEQ.point(1);
        SEM.post().unwrap();
        Sys::join_thread(t).unwrap();

        // The token went straight to the waiter
        assert_eq!(SEM.value(), Ok(0));
        SEQ.assert_sequence(3);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn post_hands_token_to_waiter() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// Scenario: `notify_all` moves both waiters onto the mutex's waiter list;
/// the mutex handoff then serializes them in priority order.
mod condvar_requeue {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{
        BootOptions, ConditionVariable, Duration, Mutex, MutexProtocol, MutexType, System,
        ThreadOptions, ThreadState,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static M: Mutex<SystemTraits> = Mutex::new(MutexType::Normal, MutexProtocol::None, 0);
    static CV: ConditionVariable<SystemTraits> = ConditionVariable::new();
    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn waiter(point: usize) {
        M.lock().unwrap();
        CV.wait(&M).unwrap();
        SEQ.point(point);
        M.unlock().unwrap();
    }

    fn main_thread(_: usize) {
        // Priority 7 gets sequence point 0; priority 3 comes second
        let t3 = Sys::create_thread(&ThreadOptions::new(waiter, 1, 3)).unwrap();
        let t7 = Sys::create_thread(&ThreadOptions::new(waiter, 0, 7)).unwrap();

        Sys::start_thread(t3).unwrap();
        Sys::sleep_for(Duration::from_ticks(2)).unwrap();
        Sys::start_thread(t7).unwrap();
        Sys::sleep_for(Duration::from_ticks(2)).unwrap();

        assert_eq!(Sys::thread_state(t3), Ok(ThreadState::BlockedOnConditionVariable));
        assert_eq!(Sys::thread_state(t7), Ok(ThreadState::BlockedOnConditionVariable));

        M.lock().unwrap();
        CV.notify_all().unwrap();

        // Both went from the condition variable to the mutex's waiter list
        assert_eq!(Sys::thread_state(t3), Ok(ThreadState::BlockedOnMutex));
        assert_eq!(Sys::thread_state(t7), Ok(ThreadState::BlockedOnMutex));

        M.unlock().unwrap();
        Sys::join_thread(t7).unwrap();
        Sys::join_thread(t3).unwrap();

        SEQ.assert_sequence(2);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn notify_all_requeues_in_priority_order() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// A timed condition variable wait re-acquires the mutex even on timeout.
mod condvar_timeout {
    use std::time::Duration as StdDuration;
    use tern_kernel::{
        BootOptions, ConditionVariable, Duration, Errno, Mutex, MutexProtocol, MutexType,
        System,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static M: Mutex<SystemTraits> = Mutex::new(MutexType::Recursive, MutexProtocol::None, 0);
    static CV: ConditionVariable<SystemTraits> = ConditionVariable::new();

    fn main_thread(_: usize) {
        // Nobody owns the mutex: waiting is a caller error
        assert_eq!(CV.wait(&M), Err(Errno::EPERM));

        // Recursion survives the wait: lock twice, wait (which releases
        // fully), and unlock twice afterwards
        M.lock().unwrap();
        M.lock().unwrap();

        let before = Sys::now().unwrap();
        assert_eq!(CV.wait_for(&M, Duration::from_ticks(3)), Err(Errno::ETIMEDOUT));
        let elapsed = (Sys::now().unwrap() - before).as_ticks();
        assert!(elapsed >= 3, "woke after only {elapsed} ticks");

        // Still owned, with the recursion count restored
        M.unlock().unwrap();
        M.unlock().unwrap();
        assert_eq!(M.unlock(), Err(Errno::EPERM));

        // Notifying with no waiters is a no-op
        CV.notify_one().unwrap();
        CV.notify_all().unwrap();

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn timeout_reacquires_mutex() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// `call_once` runs the initializer exactly once; concurrent callers block
/// until it completes even when it sleeps.
mod call_once {
    use super::common::SequenceAsserter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Duration, OnceFlag, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static FLAG: OnceFlag<SystemTraits> = OnceFlag::new();
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    static SEQ: SequenceAsserter = SequenceAsserter::new();

    /// The initializer takes its working state as arguments; callers pass
    /// them by capture.
    fn initializer(seq: &SequenceAsserter, calls: &AtomicUsize) {
        calls.fetch_add(1, Ordering::SeqCst);
        seq.point(1);
        // The initializer itself may block
        Sys::sleep_for(Duration::from_ticks(3)).unwrap();
        seq.point(2);
    }

    fn racer(_: usize) {
        SEQ.point(0);
        FLAG.call_once(|| initializer(&SEQ, &CALLS)).unwrap();
        // Must not observe a half-done initializer
        SEQ.point(3);
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(racer, 0, 9)).unwrap();
        // The racer outranks us and enters the initializer during
        // `start_thread`, then sleeps inside it
        Sys::start_thread(t).unwrap();

        // We arrive second and must block until the racer's invocation
        // completes
        FLAG.call_once(|| initializer(&SEQ, &CALLS)).unwrap();
        SEQ.point(4);

        Sys::join_thread(t).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        // A later call is a no-op
        FLAG.call_once(|| initializer(&SEQ, &CALLS)).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        SEQ.assert_sequence(5);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn initializer_runs_exactly_once() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}
