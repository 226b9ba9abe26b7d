use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tether_rt::{ErrorCode, FsPoll, HostError, Loop, NativeStat, RunMode, SimLoop, SimOp, Timer};

fn setup() -> (SimLoop, Loop) {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = SimLoop::new();
    let lp = Loop::new(sim.clone());
    (sim, lp)
}

fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
    let count = Rc::new(Cell::new(0));
    (Rc::clone(&count), count)
}

#[test]
fn test_one_shot_timer_fires_once_and_closes_itself() {
    let (sim, lp) = setup();
    let (fired, seen) = counter();
    let timer = Timer::start(&lp, 10, 0, move |_| {
        seen.set(seen.get() + 1);
        Ok(())
    })
    .unwrap();
    assert_eq!(timer.repeat(), Ok(0));

    assert_eq!(lp.run(RunMode::Default), Ok(true));
    assert_eq!(fired.get(), 0);

    sim.advance(10);
    assert_eq!(lp.run(RunMode::Default), Ok(false));
    assert_eq!(fired.get(), 1);
    assert!(timer.is_closed());

    let stats = lp.stats();
    assert_eq!(stats.roots.live, 0);
    assert_eq!(stats.raw.outstanding(), 0);
    assert_eq!(stats.live_handles, 0);
}

#[test]
fn test_repeating_timer_stays_active_until_closed() {
    let (sim, lp) = setup();
    let (fired, seen) = counter();
    let timer = Timer::start(&lp, 5, 5, move |_| {
        seen.set(seen.get() + 1);
        Ok(())
    })
    .unwrap();

    for expected in 1..=3 {
        sim.advance(5);
        assert_eq!(lp.run(RunMode::Once), Ok(true));
        assert_eq!(fired.get(), expected);
    }
    assert_eq!(timer.repeat(), Ok(5));
    assert_eq!(lp.stats().roots.live, 2);

    timer.close();
    assert_eq!(timer.repeat(), Err(ErrorCode::EBADF));
    sim.advance(5);
    assert_eq!(lp.run(RunMode::Default), Ok(false));
    assert_eq!(fired.get(), 3);
    assert_eq!(lp.stats().roots.live, 0);
}

#[test]
fn test_timer_can_close_itself_from_callback() {
    let (sim, lp) = setup();
    let (fired, seen) = counter();
    let timer = Timer::start(&lp, 1, 1, move |timer: &Timer| {
        seen.set(seen.get() + 1);
        if seen.get() == 2 {
            timer.close();
        }
        Ok(())
    })
    .unwrap();

    for _ in 0..4 {
        sim.advance(1);
        lp.run(RunMode::Once).unwrap();
    }
    assert_eq!(fired.get(), 2);
    assert!(timer.is_closed());
}

#[test]
fn test_negative_durations_are_rejected() {
    let (sim, lp) = setup();
    assert_eq!(
        Timer::start(&lp, -1, 0, |_| Ok(())).unwrap_err(),
        ErrorCode::EINVAL
    );
    assert_eq!(
        Timer::start(&lp, 0, -5, |_| Ok(())).unwrap_err(),
        ErrorCode::EINVAL
    );
    assert!(sim.calls().is_empty());
}

#[test]
fn test_timer_start_failure_releases_everything() {
    let (sim, lp) = setup();
    sim.fail_next(SimOp::TimerStart, ErrorCode::EINVAL.native());
    assert_eq!(
        Timer::start(&lp, 1, 0, |_| Ok(())).unwrap_err(),
        ErrorCode::EINVAL
    );
    lp.run(RunMode::NoWait).unwrap();
    let stats = lp.stats();
    assert_eq!(stats.roots.live, 0);
    assert_eq!(stats.roots.registered_total, 0);
    assert_eq!(stats.raw.outstanding(), 0);
}

#[test]
fn test_failing_repeating_timer_is_closed() {
    let (sim, lp) = setup();
    let reported = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reported);
    lp.set_exception_hook(move |err| sink.borrow_mut().push(err.clone()));
    let (fired, seen) = counter();

    let timer = Timer::start(&lp, 1, 1, move |_| {
        seen.set(seen.get() + 1);
        Err(HostError::raised("tick failed"))
    })
    .unwrap();

    sim.advance(1);
    lp.run(RunMode::Once).unwrap();
    sim.advance(1);
    lp.run(RunMode::Once).unwrap();

    assert_eq!(fired.get(), 1);
    assert!(timer.is_closed());
    assert_eq!(*reported.borrow(), vec![HostError::raised("tick failed")]);
}

#[test]
fn test_timer_closing_a_poller_drops_its_pending_events() {
    let (sim, lp) = setup();
    let (polled, seen) = counter();
    let poll = FsPoll::start(&lp, "/var/log/app.log", 50, move |_, _| {
        seen.set(seen.get() + 1);
        Ok(())
    })
    .unwrap();

    let target = poll.clone();
    let _timer = Timer::start(&lp, 0, 0, move |_| {
        target.close();
        Ok(())
    })
    .unwrap();

    sim.emit_fs_poll(
        "/var/log/app.log",
        NativeStat::default(),
        NativeStat::default(),
    );
    // Timers run before pending I/O in an iteration.
    lp.run(RunMode::Default).unwrap();

    assert_eq!(polled.get(), 0);
    assert!(poll.is_closed());
    assert_eq!(lp.stats().roots.live, 0);
}

#[test]
fn test_nested_run_is_refused() {
    let (sim, lp) = setup();
    let nested = Rc::new(RefCell::new(None));
    let result = Rc::clone(&nested);
    let inner_loop = lp.clone();
    Timer::start(&lp, 0, 0, move |_| {
        *result.borrow_mut() = Some(inner_loop.run(RunMode::NoWait));
        Ok(())
    })
    .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(sim.pending_closes(), 0);
    assert_eq!(*nested.borrow(), Some(Err(ErrorCode::EBUSY)));
}
