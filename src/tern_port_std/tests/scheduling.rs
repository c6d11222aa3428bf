//! Thread and scheduler behaviour, driven end-to-end through the simulator
//! port.
mod common;

/// Eight threads of descending priority run strictly in priority order.
mod priority_order {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn worker(i: usize) {
        SEQ.point(i);
    }

    fn main_thread(_: usize) {
        let priorities = [10u8, 9, 8, 7, 6, 5, 4, 3];
        let mut ids = Vec::new();
        for (i, &priority) in priorities.iter().enumerate() {
            let id = Sys::create_thread(&ThreadOptions::new(worker, i, priority)).unwrap();
            ids.push(id);
            // Each started thread outranks us and runs to completion
            // before `start_thread` returns
            Sys::start_thread(id).unwrap();
        }
        for id in ids {
            Sys::join_thread(id).unwrap();
        }
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn runs_in_priority_order() {
        SystemTraits::run(BootOptions::new(main_thread, 2), StdDuration::from_millis(1));
        SEQ.assert_sequence(8);
    }
}

/// Two equal-priority FIFO threads don't time-slice: the first runs to
/// completion.
mod fifo_pair {
    use super::common::{busy_ticks, EventLog};
    use std::time::Duration as StdDuration;
    use tern_kernel::{cfg, BootOptions, Duration, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static LOG: EventLog<8> = EventLog::new();

    fn worker(id: usize) {
        // Two bursts of 1.5 quanta each; a FIFO thread is never rotated,
        // so both bursts run back to back
        for _ in 0..2 {
            LOG.record(id);
            busy_ticks::<SystemTraits>(cfg::ROUND_ROBIN_QUANTUM as i64 * 3 / 2);
        }
    }

    fn main_thread(_: usize) {
        let a = Sys::create_thread(&ThreadOptions::new(worker, 0, 5)).unwrap();
        let b = Sys::create_thread(&ThreadOptions::new(worker, 1, 5)).unwrap();
        Sys::start_thread(a).unwrap();
        Sys::start_thread(b).unwrap();

        Sys::sleep_for(Duration::from_ticks(40)).unwrap();
        Sys::join_thread(a).unwrap();
        Sys::join_thread(b).unwrap();

        assert_eq!(LOG.snapshot(), [0, 0, 1, 1]);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn fifo_threads_run_to_completion() {
        SystemTraits::run(BootOptions::new(main_thread, 20), StdDuration::from_millis(1));
    }
}

/// Two equal-priority round-robin threads alternate on quantum expiry.
mod round_robin_pair {
    use super::common::{busy_ticks, EventLog};
    use std::time::Duration as StdDuration;
    use tern_kernel::{cfg, BootOptions, Duration, SchedulingPolicy, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static LOG: EventLog<8> = EventLog::new();

    fn worker(id: usize) {
        for _ in 0..2 {
            LOG.record(id);
            busy_ticks::<SystemTraits>(cfg::ROUND_ROBIN_QUANTUM as i64 * 3 / 2);
        }
    }

    fn main_thread(_: usize) {
        let mut opts = ThreadOptions::new(worker, 0, 5);
        opts.policy = SchedulingPolicy::RoundRobin;
        let a = Sys::create_thread(&opts).unwrap();
        opts.param = 1;
        let b = Sys::create_thread(&opts).unwrap();
        Sys::start_thread(a).unwrap();
        Sys::start_thread(b).unwrap();

        Sys::sleep_for(Duration::from_ticks(40)).unwrap();
        Sys::join_thread(a).unwrap();
        Sys::join_thread(b).unwrap();

        assert_eq!(LOG.snapshot(), [0, 1, 0, 1]);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn round_robin_threads_alternate() {
        SystemTraits::run(BootOptions::new(main_thread, 20), StdDuration::from_millis(1));
    }
}

/// `yield_now` rotates the caller behind its equal-priority peers.
mod yield_rotation {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Duration, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn worker(base: usize) {
        SEQ.point(base);
        Sys::yield_now().unwrap();
        SEQ.point(base + 2);
    }

    fn main_thread(_: usize) {
        let a = Sys::create_thread(&ThreadOptions::new(worker, 0, 5)).unwrap();
        let b = Sys::create_thread(&ThreadOptions::new(worker, 1, 5)).unwrap();
        Sys::start_thread(a).unwrap();
        Sys::start_thread(b).unwrap();

        Sys::sleep_for(Duration::from_ticks(5)).unwrap();
        Sys::join_thread(a).unwrap();
        Sys::join_thread(b).unwrap();

        SEQ.assert_sequence(4);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn yield_alternates_equal_priority_threads() {
        SystemTraits::run(BootOptions::new(main_thread, 20), StdDuration::from_millis(1));
    }
}

/// Join, self-join, stale identifiers, and detach.
mod thread_ops {
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Duration, Errno, System, ThreadOptions, ThreadState};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    fn short_lived(_: usize) {}

    fn napper(_: usize) {
        Sys::sleep_for(Duration::from_ticks(3)).unwrap();
    }

    fn main_thread(_: usize) {
        // Self-join deadlocks and is rejected
        let me = Sys::current_thread().unwrap();
        assert_eq!(Sys::join_thread(me), Err(Errno::EDEADLK));

        // Joining an already-terminated thread reclaims it immediately;
        // the identifier goes stale afterwards. The worker outranks us and
        // terminates during `start_thread`.
        let t = Sys::create_thread(&ThreadOptions::new(short_lived, 0, 11)).unwrap();
        Sys::start_thread(t).unwrap();
        assert_eq!(Sys::thread_state(t), Ok(ThreadState::Terminated));
        Sys::join_thread(t).unwrap();
        assert_eq!(Sys::join_thread(t), Err(Errno::EINVAL));
        assert_eq!(Sys::thread_state(t), Err(Errno::EINVAL));

        // A detached thread reclaims itself on termination
        let t = Sys::create_thread(&ThreadOptions::new(napper, 0, 11)).unwrap();
        Sys::start_thread(t).unwrap();
        Sys::detach_thread(t).unwrap();
        assert_eq!(Sys::join_thread(t), Err(Errno::EINVAL));
        assert_eq!(Sys::thread_state(t), Ok(ThreadState::Detached));
        Sys::sleep_for(Duration::from_ticks(6)).unwrap();
        assert_eq!(Sys::thread_state(t), Err(Errno::EINVAL));

        // Creation parameter validation
        let mut opts = ThreadOptions::new(short_lived, 0, 0);
        assert_eq!(Sys::create_thread(&opts), Err(Errno::EINVAL));
        opts.priority = 5;
        opts.stack_size = 16;
        assert_eq!(Sys::create_thread(&opts), Err(Errno::ENOSPC));

        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn join_detach_and_validation() {
        SystemTraits::run(BootOptions::new(main_thread, 10), StdDuration::from_millis(1));
    }
}

/// The TCB arena is bounded; exhaustion reports `EMFILE`.
mod arena_exhaustion {
    use std::time::Duration as StdDuration;
    use tern_kernel::{cfg, BootOptions, Errno, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    fn never_run(_: usize) {}

    fn main_thread(_: usize) {
        // The idle thread and this one occupy two slots
        let opts = ThreadOptions::new(never_run, 0, 3);
        for _ in 0..cfg::THREAD_CAPACITY - 2 {
            Sys::create_thread(&opts).unwrap();
        }
        assert_eq!(Sys::create_thread(&opts), Err(Errno::EMFILE));
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn thread_creation_reports_emfile() {
        SystemTraits::run(BootOptions::new(main_thread, 10), StdDuration::from_millis(1));
    }
}

/// Suspension parks a thread until another one resumes it.
mod suspend_resume {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, Errno, System, ThreadOptions, ThreadState};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn worker(_: usize) {
        SEQ.point(0);
        Sys::suspend().unwrap();
        SEQ.point(2);
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(worker, 0, 7)).unwrap();
        // The worker outranks us: it runs and suspends during `start_thread`
        Sys::start_thread(t).unwrap();
        assert_eq!(Sys::thread_state(t), Ok(ThreadState::Suspended));
        assert_eq!(Sys::resume_thread(Sys::current_thread().unwrap()), Err(Errno::EINVAL));

        SEQ.point(1);
        Sys::resume_thread(t).unwrap();
        Sys::join_thread(t).unwrap();

        SEQ.assert_sequence(3);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn suspend_until_resumed() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}

/// Raising a thread's base priority takes effect immediately.
mod priority_change {
    use super::common::SequenceAsserter;
    use std::time::Duration as StdDuration;
    use tern_kernel::{BootOptions, System, ThreadOptions};

    tern_port_std::use_port!(unsafe struct SystemTraits);
    type Sys = System<SystemTraits>;

    static SEQ: SequenceAsserter = SequenceAsserter::new();

    fn worker(_: usize) {
        SEQ.point(1);
    }

    fn main_thread(_: usize) {
        let t = Sys::create_thread(&ThreadOptions::new(worker, 0, 3)).unwrap();
        Sys::start_thread(t).unwrap();

        // Still below us
        assert_eq!(Sys::thread_priority(t), Ok(3));
        assert_eq!(Sys::thread_effective_priority(t), Ok(3));
        SEQ.point(0);

        // Raising it above us hands over the processor at once
        Sys::set_thread_priority(t, 8, false).unwrap();
        Sys::join_thread(t).unwrap();
        SEQ.point(2);

        SEQ.assert_sequence(3);
        tern_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn priority_raise_preempts() {
        SystemTraits::run(BootOptions::new(main_thread, 5), StdDuration::from_millis(1));
    }
}
