use evio::{ErrorCode, EventLoop};

mod util;

use util::{init, Counter};

#[test]
fn timer_repeat_then_stop() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let fires = Counter::new();
    let closes = Counter::new();

    let timer = lp.timer_init();
    let f = fires.clone();
    let c = closes.clone();
    lp.timer_start(
        timer,
        move |lp| {
            f.inc();
            if f.get() == 3 {
                lp.timer_stop(timer).unwrap();
                let c = c.clone();
                lp.close(timer, move |_| c.inc()).unwrap();
            }
        },
        50,
        20,
    )
    .unwrap();

    lp.run().unwrap();

    assert_eq!(fires.get(), 3);
    assert_eq!(closes.get(), 1);
}

#[test]
fn start_stop_is_idempotent_on_loop_state() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let timer = lp.timer_init();
    assert!(!lp.is_active(timer));

    lp.timer_start(timer, |_| (), 1_000_000, 0).unwrap();
    assert!(lp.is_active(timer));

    lp.timer_stop(timer).unwrap();
    assert!(!lp.is_active(timer));

    // Stopping again is a no-op.
    lp.timer_stop(timer).unwrap();

    lp.close(timer, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn again_requires_a_started_timer() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let timer = lp.timer_init();
    let err = lp.timer_again(timer).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Invalid);

    lp.close(timer, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn again_reschedules_with_repeat() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let fires = Counter::new();

    let timer = lp.timer_init();
    let f = fires.clone();
    lp.timer_start(
        timer,
        move |lp| {
            f.inc();
            if f.get() == 1 {
                // Stop, then re-arm from the repeat interval; the timer
                // must come back and fire again.
                lp.timer_stop(timer).unwrap();
                assert!(!lp.is_active(timer));
                lp.timer_again(timer).unwrap();
                assert!(lp.is_active(timer));
            } else {
                lp.timer_stop(timer).unwrap();
                lp.close(timer, |_| ()).unwrap();
            }
        },
        10,
        20,
    )
    .unwrap();
    assert_eq!(lp.timer_get_repeat(timer).unwrap(), 20);

    lp.run().unwrap();
    assert_eq!(fires.get(), 2);
}

#[test]
fn again_with_zero_repeat_leaves_timer_stopped() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let timer = lp.timer_init();
    lp.timer_start(timer, |_| (), 1_000_000, 0).unwrap();
    lp.timer_stop(timer).unwrap();

    lp.timer_again(timer).unwrap();
    assert!(!lp.is_active(timer));

    lp.close(timer, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn equal_due_timers_fire_in_start_order() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

    let first = lp.timer_init();
    let second = lp.timer_init();

    let o = order.clone();
    lp.timer_start(
        first,
        move |lp| {
            o.borrow_mut().push("first");
            lp.close(first, |_| ()).unwrap();
        },
        20,
        0,
    )
    .unwrap();

    let o = order.clone();
    lp.timer_start(
        second,
        move |lp| {
            o.borrow_mut().push("second");
            lp.close(second, |_| ()).unwrap();
        },
        20,
        0,
    )
    .unwrap();

    lp.run().unwrap();
    assert_eq!(*order.borrow(), vec!["first", "second"]);
}

#[test]
fn release_lets_the_loop_exit() {
    init();
    let mut lp = EventLoop::new().unwrap();

    // An open (even active) handle normally keeps the loop alive;
    // dropping the reference lets `run` return immediately.
    let timer = lp.timer_init();
    lp.timer_start(timer, |_| panic!("must not fire"), 1_000_000, 0)
        .unwrap();
    lp.release();

    lp.run().unwrap();
}
