//! Per-thread signal delivery, queued values, handlers, and `EINTR`
//! interruption.
mod common;

/// Scenario: a queued signal unwinds a semaphore wait with `EINTR` without
/// disturbing the semaphore.
mod semaphore_interruption {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{
        BootOptions, Errno, Semaphore, SignalCode, SignalSet, System, ThreadOptions,
        ThreadState,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static SEM: Semaphore<SystemTraits> = Semaphore::new(0, 4);
    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn waiter(_: usize) {
        SEQ.point(0);
        assert_eq!(SEM.wait(), Err(Errno::EINTR));
        SEQ.point(2);

        // The interrupting signal is still retrievable, value intact
        let info = Sys::try_wait_signal(SignalSet::ALL).unwrap();
        assert_eq!(info.signal, 5);
        assert_eq!(info.code, SignalCode::Queued);
        assert_eq!(info.value, 77);
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(waiter, 0, 9)).unwrap();
        Sys::start_thread(t).unwrap();
        assert_eq!(Sys::thread_state(t), Ok(ThreadState::BlockedOnSemaphore));

        SEQ.point(1);
        Sys::queue_signal(t, 5, 77).unwrap();
        Sys::join_thread(t).unwrap();

        // The wait was fully rolled back
        assert_eq!(SEM.value(), Ok(0));
        SEM.post().unwrap();
        assert_eq!(SEM.value(), Ok(1));

        SEQ.assert_sequence(3);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn wait_unwinds_with_eintr() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// `wait_signal` consumes a matching signal, queued records first and in
/// FIFO order.
mod wait_and_queue_order {
    use std::time::Duration as StdDuration;
    use tern_kernel::{
        BootOptions, Errno, SignalCode, SignalSet, System, ThreadOptions, ThreadState,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    fn receiver(_: usize) {
        // Delivered while blocked in `wait_signal`
        let info = Sys::wait_signal(SignalSet::single(3)).unwrap();
        assert_eq!(info.signal, 3);
        assert_eq!(info.code, SignalCode::Generated);
        assert_eq!(info.value, 0);

        // Queued records of one signal come back oldest-first, before the
        // bare pending bit
        let one = Sys::wait_signal(SignalSet::single(4)).unwrap();
        let two = Sys::wait_signal(SignalSet::single(4)).unwrap();
        let three = Sys::wait_signal(SignalSet::single(4)).unwrap();
        assert_eq!((one.code, one.value), (SignalCode::Queued, 10));
        assert_eq!((two.code, two.value), (SignalCode::Queued, 20));
        assert_eq!((three.code, three.value), (SignalCode::Generated, 0));

        assert_eq!(Sys::try_wait_signal(SignalSet::ALL), Err(Errno::EAGAIN));
        assert!(Sys::pending_signal_set().unwrap().is_empty());
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(receiver, 0, 4)).unwrap();
        Sys::start_thread(t).unwrap();

        // Let the receiver block in `wait_signal`
        Sys::sleep_for(tern_kernel::Duration::from_ticks(2)).unwrap();
        assert_eq!(Sys::thread_state(t), Ok(ThreadState::BlockedOnSignal));
        Sys::generate_signal(t, 3).unwrap();

        // Pile up deliveries while the receiver is still below our
        // priority
        Sys::queue_signal(t, 4, 10).unwrap();
        Sys::queue_signal(t, 4, 20).unwrap();
        Sys::generate_signal(t, 4).unwrap();

        // Signal numbers are validated
        assert_eq!(Sys::generate_signal(t, 200), Err(Errno::EINVAL));

        Sys::join_thread(t).unwrap();
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn matching_and_fifo_order() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// A handler runs in the interrupted thread's context before the unwound
/// call returns.
mod handler_delivery {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{
        BootOptions, Duration, Errno, SignalAction, SignalInfo, System, ThreadOptions,
    };

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn on_signal(info: SignalInfo) {
        assert_eq!(info.signal, 6);
        assert_eq!(info.value, 42);
        SEQ.point(1);
    }

    fn sleeper(_: usize) {
        Sys::set_signal_action(6, SignalAction::Handler(on_signal)).unwrap();
        SEQ.point(0);
        // The handler must run before this call reports `EINTR`
        assert_eq!(Sys::sleep_for(Duration::from_ticks(100)), Err(Errno::EINTR));
        SEQ.point(2);
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(sleeper, 0, 9)).unwrap();
        Sys::start_thread(t).unwrap();

        Sys::queue_signal(t, 6, 42).unwrap();
        Sys::join_thread(t).unwrap();

        SEQ.assert_sequence(3);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn handler_runs_before_eintr_return() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// Timed signal waits report `ETIMEDOUT` after the full duration.
mod timed_signal_wait {
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Duration, Errno, SignalSet, System};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    fn main_thread(_: usize) {
        let before = Sys::now().unwrap();
        assert_eq!(
            Sys::wait_signal_for(SignalSet::single(1), Duration::from_ticks(3)),
            Err(Errno::ETIMEDOUT)
        );
        let elapsed = (Sys::now().unwrap() - before).as_ticks();
        assert!(elapsed >= 3, "gave up after only {elapsed} ticks");

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn wait_signal_for_times_out() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}
