use std::net::SocketAddr;

use evio::{ErrorCode, EventLoop, TcpId};

mod util;

use util::{init, Counter};

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn tcp_echo() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let sv_read = Counter::new();
    let sv_write = Counter::new();
    let cl_read = Counter::new();
    let cl_write = Counter::new();
    let closes = Counter::new();

    let server = lp.tcp_init();
    lp.tcp_bind(server, localhost()).unwrap();

    let conn_sv_read = sv_read.clone();
    let conn_sv_write = sv_write.clone();
    let conn_closes = closes.clone();
    lp.tcp_listen(server, 128, move |lp, status| {
        status.unwrap();

        let conn = lp.tcp_init();
        lp.tcp_accept(server, conn).unwrap();

        // One client in this test; the listener's job is done.
        let c = conn_closes.clone();
        lp.close(server, move |_| c.inc()).unwrap();

        let sv_read = conn_sv_read.clone();
        let sv_write = conn_sv_write.clone();
        let closes = conn_closes.clone();
        lp.tcp_read_start(
            conn,
            |_, size| vec![0; size],
            move |lp, res, buf| {
                let n = res.expect("server read failed");
                if n == 0 {
                    return;
                }
                sv_read.inc();

                // Echo the payload back, then start closing; the write
                // completion must still be delivered first.
                let sv_write = sv_write.clone();
                lp.tcp_write(conn, &[&buf[..n]], move |_, status| {
                    status.expect("server write failed");
                    sv_write.inc();
                })
                .unwrap();

                let closes = closes.clone();
                lp.close(conn, move |_| closes.inc()).unwrap();
            },
        )
        .unwrap();
    })
    .unwrap();

    let addr = lp.tcp_getsockname(server).unwrap();

    let client = lp.tcp_init();
    let conn_cl_read = cl_read.clone();
    let conn_cl_write = cl_write.clone();
    let conn_closes = closes.clone();
    lp.tcp_connect(client, addr, move |lp, status| {
        status.expect("connect failed");

        let cl_write = conn_cl_write.clone();
        lp.tcp_write(client, &[b"PING"], move |_, status| {
            status.expect("client write failed");
            cl_write.inc();
        })
        .unwrap();

        let cl_read = conn_cl_read.clone();
        let closes = conn_closes.clone();
        lp.tcp_read_start(
            client,
            |_, size| vec![0; size],
            move |lp, res, buf| {
                let n = res.expect("client read failed");
                if n == 0 {
                    return;
                }
                assert_eq!(&buf[..n], b"PING");
                cl_read.inc();

                let closes = closes.clone();
                lp.close(client, move |_| closes.inc()).unwrap();
            },
        )
        .unwrap();
    })
    .unwrap();

    lp.run().unwrap();

    assert_eq!(sv_read.get(), 1);
    assert_eq!(sv_write.get(), 1);
    assert_eq!(cl_read.get(), 1);
    assert_eq!(cl_write.get(), 1);
    assert_eq!(closes.get(), 3);
}

#[test]
fn bind_in_use_is_deferred_until_listen() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let first = lp.tcp_init();
    lp.tcp_bind(first, localhost()).unwrap();
    lp.tcp_listen(first, 16, |_, _| ()).unwrap();
    let addr = lp.tcp_getsockname(first).unwrap();

    // The second bind collides, but the error is stored, not reported.
    let second = lp.tcp_init();
    lp.tcp_bind(second, addr).unwrap();

    let err = lp.tcp_listen(second, 16, |_, _| ()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::AddrInUse);

    let closes = Counter::new();
    let c = closes.clone();
    lp.close(first, move |_| c.inc()).unwrap();
    let c = closes.clone();
    lp.close(second, move |_| c.inc()).unwrap();
    lp.run().unwrap();
    assert_eq!(closes.get(), 2);
}

#[test]
fn bind_twice_fails() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let tcp = lp.tcp_init();
    lp.tcp_bind(tcp, localhost()).unwrap();
    let err = lp.tcp_bind(tcp, localhost()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Already);

    lp.close(tcp, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn write_requires_connection() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let tcp = lp.tcp_init();
    let err = lp.tcp_write(tcp, &[b"nope"], |_, _| ()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Invalid);

    let err = lp
        .tcp_read_start(tcp, |_, size| vec![0; size], |_, _, _| ())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Invalid);

    lp.close(tcp, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn shutdown_waits_for_writes() {
    init();
    let mut lp = EventLoop::new().unwrap();

    // Callback order collected as a trace of tags.
    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

    let server = lp.tcp_init();
    lp.tcp_bind(server, localhost()).unwrap();

    let sv_order = order.clone();
    lp.tcp_listen(server, 16, move |lp, status| {
        status.unwrap();
        let conn = lp.tcp_init();
        lp.tcp_accept(server, conn).unwrap();
        lp.close(server, |_| ()).unwrap();

        let order = sv_order.clone();
        lp.tcp_read_start(
            conn,
            |_, size| vec![0; size],
            move |lp, res, _buf| match res {
                Ok(_) => {}
                Err(err) if err.is_eof() => {
                    order.borrow_mut().push("server-eof");
                    lp.close(conn, |_| ()).unwrap();
                }
                Err(err) => panic!("unexpected server read error: {}", err),
            },
        )
        .unwrap();
    })
    .unwrap();
    let addr = lp.tcp_getsockname(server).unwrap();

    let client = lp.tcp_init();
    let cl_order = order.clone();
    lp.tcp_connect(client, addr, move |lp, status| {
        status.unwrap();

        let order = cl_order.clone();
        lp.tcp_write(client, &[b"BYE"], move |_, status| {
            status.unwrap();
            order.borrow_mut().push("write");
        })
        .unwrap();

        let order = cl_order.clone();
        lp.tcp_shutdown(client, move |lp, status| {
            status.unwrap();
            order.borrow_mut().push("shutdown");
            lp.close(client, |_| ()).unwrap();
        })
        .unwrap();
    })
    .unwrap();

    lp.run().unwrap();

    let order = order.borrow();
    let write = order.iter().position(|t| *t == "write").unwrap();
    let shutdown = order.iter().position(|t| *t == "shutdown").unwrap();
    assert!(write < shutdown, "write completion must precede shutdown");
    assert!(order.contains(&"server-eof"));
}

#[test]
fn close_aborts_queued_writes() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    // The accepted connection is created inside the listen callback; the
    // cleanup timer below needs its id.
    let conn_cell: std::rc::Rc<std::cell::Cell<Option<TcpId>>> = Default::default();
    let client_done = std::rc::Rc::new(std::cell::Cell::new(false));

    let server = lp.tcp_init();
    lp.tcp_bind(server, localhost()).unwrap();

    let cell = conn_cell.clone();
    lp.tcp_listen(server, 16, move |lp, status| {
        status.unwrap();
        let conn = lp.tcp_init();
        lp.tcp_accept(server, conn).unwrap();
        // Never read from `conn`, so the peer's buffers fill up.
        cell.set(Some(conn));
        lp.close(server, |_| ()).unwrap();
    })
    .unwrap();
    let addr = lp.tcp_getsockname(server).unwrap();

    let client = lp.tcp_init();
    let cl_order = order.clone();
    let cl_done = client_done.clone();
    lp.tcp_connect(client, addr, move |lp, status| {
        status.unwrap();

        // Far more than the socket buffers hold, so part of it queues.
        let payload = vec![0x5a_u8; 32 * 1024 * 1024];
        let order = cl_order.clone();
        lp.tcp_write(client, &[&payload], move |_, status| {
            let err = status.unwrap_err();
            assert_eq!(err.code(), ErrorCode::ConnAborted);
            order.borrow_mut().push("write-aborted");
        })
        .unwrap();

        let order = cl_order.clone();
        let done = cl_done.clone();
        lp.close(client, move |_| {
            order.borrow_mut().push("close");
            done.set(true);
        })
        .unwrap();
    })
    .unwrap();

    // Both sides run callback chains of their own; poll until the client
    // side has finished, then tear the server side down.
    let cleanup = lp.timer_init();
    lp.timer_start(
        cleanup,
        move |lp| {
            if client_done.get() {
                if let Some(conn) = conn_cell.get() {
                    lp.close(conn, |_| ()).unwrap();
                    lp.timer_stop(cleanup).unwrap();
                    lp.close(cleanup, |_| ()).unwrap();
                }
            }
        },
        10,
        10,
    )
    .unwrap();

    lp.run().unwrap();

    // The aborted write is reported before the close callback.
    assert_eq!(*order.borrow(), vec!["write-aborted", "close"]);
}
