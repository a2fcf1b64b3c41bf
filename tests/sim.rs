mod common;

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use evreactor::sim::SimBackend;
use evreactor::{
    CallbackError, Config, Direction, Event, Flag, Key, Reactor, TimerId, TimerKind,
};
use nix::sys::signal::Signal;

fn sim_reactor() -> Reactor<SimBackend> {
    common::init_tracing();
    Reactor::with_backend(SimBackend::new())
}

#[test]
fn persistent_read_watch_fires_on_every_readiness() {
    let mut reactor = sim_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    reactor
        .add(
            7,
            Flag::Read,
            move |_, event, tag: &mut &'static str| {
                log.borrow_mut().push((event, *tag));
                Ok(())
            },
            "conn",
        )
        .unwrap();

    for _ in 0..2 {
        assert!(reactor.backend_mut().make_ready(7, Direction::Read));
        reactor.run_once().unwrap();
    }

    assert_eq!(
        *seen.borrow(),
        vec![(Event::Readable(7), "conn"), (Event::Readable(7), "conn")]
    );
    assert!(reactor.is_watching(7, Direction::Read));
}

#[test]
fn repeating_timer_fires_every_interval() {
    let mut reactor = sim_reactor();
    let ticks = Rc::new(Cell::new(0));
    let id = reactor
        .add(
            0.5,
            Flag::Timer,
            |_, _, ticks: &mut Rc<Cell<u32>>| {
                ticks.set(ticks.get() + 1);
                Ok(())
            },
            Rc::clone(&ticks),
        )
        .unwrap()
        .timer_id()
        .unwrap();

    while reactor.backend().now() < Duration::from_secs(2) {
        reactor.run_once().unwrap();
    }

    assert_eq!(ticks.get(), 4);
    assert!(reactor.contains_timer(id));
    assert_eq!(reactor.backend().armed_timeouts(), 1);
}

#[test]
fn repeating_timer_removed_after_firing_stays_silent() {
    let mut reactor = sim_reactor();
    let ticks = Rc::new(Cell::new(0));
    let counter = Rc::clone(&ticks);
    let id = reactor
        .add_timer(
            Duration::from_millis(500),
            TimerKind::Repeating,
            move |_, _, _| {
                counter.set(counter.get() + 1);
                Ok(())
            },
            (),
        )
        .unwrap();

    reactor.run_once().unwrap();
    assert_eq!(ticks.get(), 1);
    assert_eq!(reactor.backend().armed_timeouts(), 1);

    reactor.del(id, Flag::Timer);
    for _ in 0..3 {
        reactor
            .run_once_with_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(ticks.get(), 1);
        assert_eq!(reactor.backend().armed_timeouts(), 0);
    }
    assert_eq!(reactor.backend().now(), Duration::from_millis(3500));
    assert_eq!(reactor.backend().live_handles(), 0);
}

#[test]
fn repeating_timer_can_remove_itself() {
    let mut reactor = sim_reactor();
    let ticks = Rc::new(Cell::new(0));
    reactor
        .add(
            0.5,
            Flag::Timer,
            |reactor, event, ticks: &mut Rc<Cell<u32>>| {
                ticks.set(ticks.get() + 1);
                if ticks.get() == 2 {
                    if let Some(id) = event.timer_id() {
                        reactor.remove_timer(id);
                    }
                }
                Ok(())
            },
            Rc::clone(&ticks),
        )
        .unwrap();

    reactor.run_once().unwrap();
    reactor.run_once().unwrap();
    assert_eq!(ticks.get(), 2);

    for _ in 0..4 {
        reactor
            .run_once_with_timeout(Some(Duration::from_secs(1)))
            .unwrap();
    }
    assert_eq!(ticks.get(), 2);
    assert_eq!(reactor.timer_count(), 0);
    assert_eq!(reactor.backend().armed_timeouts(), 0);
    assert_eq!(reactor.backend().cancellations(), 1);
}

#[test]
fn one_shot_timer_removing_itself_is_released_once() {
    let mut reactor = sim_reactor();
    let fired = Rc::new(Cell::new(0));
    let counter = Rc::clone(&fired);
    reactor
        .add(
            1.0,
            Flag::TimerOnce,
            move |reactor, event, _| {
                counter.set(counter.get() + 1);
                if let Some(id) = event.timer_id() {
                    reactor.del(id, Flag::TimerOnce);
                }
                Ok(())
            },
            (),
        )
        .unwrap();

    reactor.run_once().unwrap();
    reactor
        .run_once_with_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    assert_eq!(fired.get(), 1);
    assert_eq!(reactor.timer_count(), 0);
    assert_eq!(reactor.backend().cancellations(), 1);
    assert_eq!(reactor.backend().live_handles(), 0);
}

#[test]
fn one_shot_timer_fires_once_then_is_gone() {
    let mut reactor = sim_reactor();
    let fired = Rc::new(Cell::new(0));
    let counter = Rc::clone(&fired);
    let id = reactor
        .add(
            1.0,
            Flag::TimerOnce,
            move |_, event, _| {
                assert!(matches!(event, Event::Timer(_)));
                counter.set(counter.get() + 1);
                Ok(())
            },
            (),
        )
        .unwrap()
        .timer_id()
        .unwrap();

    reactor.run_once().unwrap();
    assert_eq!(fired.get(), 1);
    assert_eq!(reactor.backend().now(), Duration::from_secs(1));
    assert!(!reactor.contains_timer(id));
    let released = reactor.backend().cancellations();

    reactor.del(id, Flag::TimerOnce);
    assert_eq!(reactor.backend().cancellations(), released);

    reactor
        .run_once_with_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(fired.get(), 1);
    assert_eq!(reactor.backend().live_handles(), 0);
}

#[test]
fn deleting_unknown_registrations_is_a_no_op() {
    let mut reactor = sim_reactor();
    reactor
        .add_io_watch(3, Direction::Write, |_, _| Ok(()))
        .unwrap();

    reactor.del(999_999, Flag::TimerOnce);
    reactor.del(TimerId::from_raw(42), Flag::Timer);
    reactor.del(-1, Flag::Timer);
    reactor.del(3, Flag::Read);
    reactor.del(Signal::SIGHUP, Flag::Signal);
    reactor.del(Key::Seconds(1.5), Flag::Write);

    assert_eq!(reactor.backend().cancellations(), 0);
    assert!(reactor.is_watching(3, Direction::Write));
}

#[test]
fn signal_watch_receives_raised_signal() {
    let mut reactor = sim_reactor();
    let got = Rc::new(Cell::new(None));
    let slot = Rc::clone(&got);
    reactor
        .add(
            Signal::SIGTERM,
            Flag::Signal,
            move |reactor, event, _| {
                slot.set(event.signal());
                reactor.stop();
                Ok(())
            },
            (),
        )
        .unwrap();

    assert!(reactor.backend_mut().raise(Signal::SIGTERM));
    reactor.run_forever().unwrap();
    assert_eq!(got.get(), Some(Signal::SIGTERM));
}

#[test]
fn timer_can_stop_the_loop() {
    let mut reactor = sim_reactor();
    let ticks = Rc::new(Cell::new(0));
    let counter = Rc::clone(&ticks);
    reactor
        .add_timer(
            Duration::from_millis(500),
            TimerKind::Repeating,
            move |_, _, _| {
                counter.set(counter.get() + 1);
                Ok(())
            },
            (),
        )
        .unwrap();
    reactor
        .add_timer(
            Duration::from_secs(2),
            TimerKind::OneShot,
            |reactor, _, _| {
                reactor.stop();
                Ok(())
            },
            (),
        )
        .unwrap();

    reactor.run_forever().unwrap();

    assert_eq!(ticks.get(), 4);
    assert_eq!(reactor.backend().now(), Duration::from_secs(2));
    assert_eq!(reactor.timer_count(), 1);
}

#[test]
fn clear_all_timers_from_a_callback() {
    let mut reactor = sim_reactor();
    for secs in [1.0, 2.0, 3.0] {
        reactor
            .add(secs, Flag::Timer, |_, _, _| Ok(()), ())
            .unwrap();
    }
    reactor
        .add(
            0.25,
            Flag::TimerOnce,
            |reactor, _, _| {
                reactor.clear_all_timers();
                Ok(())
            },
            (),
        )
        .unwrap();
    reactor
        .add_io_watch(4, Direction::Read, |_, _| Ok(()))
        .unwrap();

    reactor.run_once().unwrap();

    assert_eq!(reactor.timer_count(), 0);
    assert_eq!(reactor.backend().armed_timeouts(), 0);
    assert_eq!(reactor.io_watch_count(), 1);
}

#[test]
fn overwriting_a_watch_keeps_only_the_new_callback() {
    let mut reactor = sim_reactor();
    let which = Rc::new(Cell::new(""));
    let first = Rc::clone(&which);
    let second = Rc::clone(&which);
    reactor
        .add_io_watch(9, Direction::Read, move |_, _| {
            first.set("first");
            Ok(())
        })
        .unwrap();
    reactor
        .add_io_watch(9, Direction::Read, move |_, _| {
            second.set("second");
            Ok(())
        })
        .unwrap();

    assert_eq!(reactor.io_watch_count(), 1);
    assert_eq!(reactor.backend().cancellations(), 1);
    reactor.backend_mut().make_ready(9, Direction::Read);
    reactor.run_once().unwrap();
    assert_eq!(which.get(), "second");
}

#[test]
fn close_releases_every_handle() {
    let mut reactor = sim_reactor();
    reactor.add(1, Flag::Read, |_, _, _| Ok(()), ()).unwrap();
    reactor.add(1, Flag::Write, |_, _, _| Ok(()), ()).unwrap();
    reactor
        .add(Signal::SIGUSR2, Flag::Signal, |_, _, _| Ok(()), ())
        .unwrap();
    reactor.add(0.1, Flag::Timer, |_, _, _| Ok(()), ()).unwrap();
    assert_eq!(reactor.watched_fd_count(), 1);
    assert_eq!(reactor.backend().live_handles(), 4);

    reactor.close().unwrap();
}

static FAILING_FIRES: AtomicUsize = AtomicUsize::new(0);

fn abort_loop(error: &CallbackError) -> ! {
    panic!("fatal: {error}")
}

#[test]
fn failing_timer_escalates_after_its_first_run() {
    common::init_tracing();
    let mut reactor = Reactor::with_config(SimBackend::new(), Config::new().on_fatal(abort_loop));
    reactor
        .add(
            0.5,
            Flag::Timer,
            |_, _, _| {
                FAILING_FIRES.fetch_add(1, Ordering::SeqCst);
                Err(CallbackError::msg("boom"))
            },
            (),
        )
        .unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| reactor.run_forever()));

    let payload = result.unwrap_err();
    let message = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .unwrap_or_default();
    assert_eq!(message, "fatal: boom");
    assert_eq!(FAILING_FIRES.load(Ordering::SeqCst), 1);
}
