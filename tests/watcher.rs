use evio::EventLoop;

mod util;

use util::{init, Counter};

#[test]
fn idle_runs_until_stopped() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let runs = Counter::new();
    let closes = Counter::new();

    let idle = lp.idle_init();
    let r = runs.clone();
    let c = closes.clone();
    lp.idle_start(idle, move |lp| {
        r.inc();
        if r.get() == 5 {
            lp.idle_stop(idle).unwrap();
            let c = c.clone();
            lp.close(idle, move |_| c.inc()).unwrap();
        }
    })
    .unwrap();

    lp.run().unwrap();

    assert_eq!(runs.get(), 5);
    assert_eq!(closes.get(), 1);
}

#[test]
fn prepare_runs_before_check() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

    let prepare = lp.prepare_init();
    let check = lp.check_init();
    let timer = lp.timer_init();

    let o = order.clone();
    lp.prepare_start(prepare, move |_| o.borrow_mut().push("prepare"))
        .unwrap();
    let o = order.clone();
    lp.check_start(check, move |_| o.borrow_mut().push("check"))
        .unwrap();

    lp.timer_start(
        timer,
        move |lp| {
            lp.close(prepare, |_| ()).unwrap();
            lp.close(check, |_| ()).unwrap();
            lp.close(timer, |_| ()).unwrap();
        },
        30,
        0,
    )
    .unwrap();

    lp.run().unwrap();

    let order = order.borrow();
    assert!(!order.is_empty());
    let first_prepare = order.iter().position(|t| *t == "prepare").unwrap();
    let first_check = order.iter().position(|t| *t == "check");
    // The prepare pass precedes the poll; check follows it.
    if let Some(first_check) = first_check {
        assert!(first_prepare < first_check);
    }
}

#[test]
fn stop_during_iteration_is_safe() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let a_runs = Counter::new();
    let b_runs = Counter::new();

    let a = lp.idle_init();
    let b = lp.idle_init();

    let r = a_runs.clone();
    lp.idle_start(a, move |lp| {
        r.inc();
        // Stopping `b` from `a`'s callback must keep this pass sound and
        // must suppress `b` in the same pass.
        lp.idle_stop(b).unwrap();
        lp.idle_stop(a).unwrap();
        lp.close(a, |_| ()).unwrap();
        lp.close(b, |_| ()).unwrap();
    })
    .unwrap();

    let r = b_runs.clone();
    lp.idle_start(b, move |_| r.inc()).unwrap();

    lp.run().unwrap();

    assert_eq!(a_runs.get(), 1);
    assert_eq!(b_runs.get(), 0);
}

#[test]
fn start_is_idempotent() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let runs = Counter::new();

    let idle = lp.idle_init();
    let r = runs.clone();
    lp.idle_start(idle, move |lp| {
        r.inc();
        lp.idle_stop(idle).unwrap();
        lp.close(idle, |_| ()).unwrap();
    })
    .unwrap();
    // The second start is ignored; the first callback stays bound.
    lp.idle_start(idle, |_| panic!("replacement callback must not run"))
        .unwrap();

    lp.run().unwrap();
    assert_eq!(runs.get(), 1);
}

#[test]
fn stopped_watcher_keeps_loop_ref() {
    init();
    let mut lp = EventLoop::new().unwrap();

    // A stopped-but-open watcher still holds a loop reference; only the
    // close releases it.
    let prepare = lp.prepare_init();
    lp.prepare_start(prepare, |_| ()).unwrap();
    lp.prepare_stop(prepare).unwrap();
    assert!(!lp.is_active(prepare));

    let closes = Counter::new();
    let c = closes.clone();
    lp.close(prepare, move |_| c.inc()).unwrap();
    lp.run().unwrap();
    assert_eq!(closes.get(), 1);
}
