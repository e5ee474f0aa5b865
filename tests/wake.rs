use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use evio::{AsyncId, AsyncWaker, EventLoop};

mod util;

use util::{assert_send, assert_sync, init, Counter};

#[test]
fn is_send_and_sync() {
    assert_send::<AsyncWaker>();
    assert_sync::<AsyncWaker>();
}

#[test]
fn wake_from_same_thread() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let count = Counter::new();
    // The callback wants its own handle's id, which only exists after
    // `async_init` returns.
    let id_cell: Rc<Cell<Option<AsyncId>>> = Default::default();

    let c = count.clone();
    let cell = id_cell.clone();
    let waker = lp.async_init(move |lp| {
        c.inc();
        lp.close(cell.get().unwrap(), |_| ()).unwrap();
    });
    id_cell.set(Some(waker.id()));

    waker.send().expect("unable to wake");
    lp.run().unwrap();

    assert_eq!(count.get(), 1);
}

#[test]
fn wake_coalesces_many_sends() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let count = Counter::new();
    let done = Arc::new(AtomicBool::new(false));

    let c = count.clone();
    let waker = lp.async_init(move |_| c.inc());
    let id = waker.id();

    let sender_done = Arc::clone(&done);
    let handle = thread::spawn(move || {
        for _ in 0..1000 {
            waker.send().expect("unable to wake");
        }
        sender_done.store(true, Ordering::Release);
    });

    // Close only after the sender has finished AND the callback count has
    // been stable for a full tick: a wake-up still in flight at close time
    // would otherwise lose the callback owed to the final send.
    let timer = lp.timer_init();
    let c = count.clone();
    let prev = Rc::new(Cell::new(usize::MAX));
    lp.timer_start(
        timer,
        move |lp| {
            if !done.load(Ordering::Acquire) {
                return;
            }
            if c.get() >= 1 && c.get() == prev.get() {
                lp.close(id, |_| ()).unwrap();
                lp.timer_stop(timer).unwrap();
                lp.close(timer, |_| ()).unwrap();
            } else {
                prev.set(c.get());
            }
        },
        10,
        10,
    )
    .unwrap();

    lp.run().unwrap();
    handle.join().unwrap();

    // 1000 sends coalesce into anywhere from one to a thousand
    // callbacks, and at least one follows the last send.
    assert!(count.get() >= 1);
    assert!(count.get() <= 1000);
}
