use std::net::SocketAddr;

use evio::{ErrorCode, EventLoop, UdpFlags};

mod util;

use util::{init, Counter};

fn any_v4() -> SocketAddr {
    "0.0.0.0:0".parse().unwrap()
}

fn any_v6() -> SocketAddr {
    "[::]:0".parse().unwrap()
}

#[test]
fn udp_send_and_recv() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let sv_recv = Counter::new();
    let sv_send = Counter::new();
    let cl_recv = Counter::new();
    let cl_send = Counter::new();
    let closes = Counter::new();

    let server = lp.udp_init();
    lp.udp_bind(server, any_v4(), UdpFlags::empty()).unwrap();
    let server_addr = lp.udp_getsockname(server).unwrap();

    let client = lp.udp_init();
    lp.udp_bind(client, any_v4(), UdpFlags::empty()).unwrap();

    let recv = sv_recv.clone();
    let send = sv_send.clone();
    let cls = closes.clone();
    lp.udp_recv_start(
        server,
        |_, size| vec![0; size],
        move |lp, res, buf, addr| {
            let n = res.expect("server recv failed");
            if n == 0 {
                assert!(addr.is_none());
                return;
            }
            assert_eq!(&buf[..n], b"PING");
            recv.inc();

            lp.udp_recv_stop(server).unwrap();

            let send = send.clone();
            let cls = cls.clone();
            lp.udp_send(server, b"PONG", addr.unwrap(), move |lp, status| {
                status.expect("server send failed");
                send.inc();
                let cls = cls.clone();
                lp.close(server, move |_| cls.inc()).unwrap();
            })
            .unwrap();
        },
    )
    .unwrap();

    let recv = cl_recv.clone();
    let cls = closes.clone();
    lp.udp_recv_start(
        client,
        |_, size| vec![0; size],
        move |lp, res, buf, addr| {
            let n = res.expect("client recv failed");
            if n == 0 {
                assert!(addr.is_none());
                return;
            }
            assert_eq!(&buf[..n], b"PONG");
            recv.inc();
            let cls = cls.clone();
            lp.close(client, move |_| cls.inc()).unwrap();
        },
    )
    .unwrap();

    let target: SocketAddr = format!("127.0.0.1:{}", server_addr.port()).parse().unwrap();
    let send = cl_send.clone();
    lp.udp_send(client, b"PING", target, move |_, status| {
        status.expect("client send failed");
        send.inc();
    })
    .unwrap();

    lp.run().unwrap();

    assert_eq!(sv_recv.get(), 1);
    assert_eq!(sv_send.get(), 1);
    assert_eq!(cl_recv.get(), 1);
    assert_eq!(cl_send.get(), 1);
    assert_eq!(closes.get(), 2);
}

/// Runs the dual-stack scenario: an IPv6 wildcard server bound with
/// `flags`, an IPv4 client sending one datagram at it, and a timer that
/// closes everything after half a second. Returns `None` if the host has
/// no IPv6 support, otherwise `(recv_count, send_count, close_count)`.
fn dual_stack_scenario(flags: UdpFlags) -> Option<(usize, usize, usize)> {
    init();
    let mut lp = EventLoop::new().unwrap();

    let recvs = Counter::new();
    let sends = Counter::new();
    let closes = Counter::new();

    let server = lp.udp_init();
    match lp.udp_bind(server, any_v6(), flags) {
        Ok(()) => {}
        Err(err) if err.code() == ErrorCode::AfNoSupport => return None,
        Err(err) => panic!("unexpected bind error: {}", err),
    }
    let port = lp.udp_getsockname(server).unwrap().port();

    let recv = recvs.clone();
    lp.udp_recv_start(
        server,
        |_, size| vec![0; size],
        move |_, res, buf, _addr| {
            let n = res.expect("server recv failed");
            if n == 0 {
                return;
            }
            assert_eq!(&buf[..n], b"PING");
            recv.inc();
        },
    )
    .unwrap();

    let client = lp.udp_init();
    lp.udp_bind(client, any_v4(), UdpFlags::empty()).unwrap();

    let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let send = sends.clone();
    lp.udp_send(client, b"PING", target, move |_, status| {
        // The send itself succeeds locally either way.
        status.expect("send failed");
        send.inc();
    })
    .unwrap();

    let timer = lp.timer_init();
    let cls = closes.clone();
    lp.timer_start(
        timer,
        move |lp| {
            let c = cls.clone();
            lp.close(server, move |_| c.inc()).unwrap();
            let c = cls.clone();
            lp.close(client, move |_| c.inc()).unwrap();
            let c = cls.clone();
            lp.close(timer, move |_| c.inc()).unwrap();
        },
        500,
        0,
    )
    .unwrap();

    lp.run().unwrap();
    Some((recvs.get(), sends.get(), closes.get()))
}

#[test]
fn udp_dual_stack() {
    let Some((recvs, sends, closes)) = dual_stack_scenario(UdpFlags::empty()) else {
        return;
    };
    // IPv4 traffic arrives on the IPv6 wildcard socket as a mapped
    // address.
    assert_eq!(recvs, 1);
    assert_eq!(sends, 1);
    assert_eq!(closes, 3);
}

#[test]
fn udp_ipv6_only() {
    let Some((recvs, sends, closes)) = dual_stack_scenario(UdpFlags::IPV6ONLY) else {
        return;
    };
    // The datagram is dropped, not the send.
    assert_eq!(recvs, 0);
    assert_eq!(sends, 1);
    assert_eq!(closes, 3);
}

#[test]
fn ipv6_only_on_v4_socket_fails() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let udp = lp.udp_init();
    let err = lp.udp_bind(udp, any_v4(), UdpFlags::IPV6ONLY).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Invalid);

    lp.close(udp, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn bind_twice_fails() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let udp = lp.udp_init();
    lp.udp_bind(udp, any_v4(), UdpFlags::empty()).unwrap();
    let err = lp.udp_bind(udp, any_v4(), UdpFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Invalid);

    lp.close(udp, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn getsockname_reports_bound_port() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let udp = lp.udp_init();
    lp.udp_bind(udp, any_v4(), UdpFlags::empty()).unwrap();
    let addr = lp.udp_getsockname(udp).unwrap();
    assert_ne!(addr.port(), 0);

    lp.close(udp, |_| ()).unwrap();
    lp.run().unwrap();
}

#[test]
fn zero_length_recv_buffer_is_tolerated() {
    init();
    let mut lp = EventLoop::new().unwrap();

    let unused = Counter::new();

    let server = lp.udp_init();
    lp.udp_bind(server, any_v4(), UdpFlags::empty()).unwrap();
    let port = lp.udp_getsockname(server).unwrap().port();

    let c = unused.clone();
    lp.udp_recv_start(
        server,
        |_, _| Vec::new(),
        move |lp, res, buf, addr| {
            assert_eq!(res.unwrap(), 0);
            assert!(buf.is_empty());
            assert!(addr.is_none());
            c.inc();
            lp.close(server, |_| ()).unwrap();
        },
    )
    .unwrap();

    let client = lp.udp_init();
    lp.udp_send(
        client,
        b"PING",
        format!("127.0.0.1:{}", port).parse().unwrap(),
        move |lp, status| {
            status.unwrap();
            lp.close(client, |_| ()).unwrap();
        },
    )
    .unwrap();

    lp.run().unwrap();
    assert_eq!(unused.get(), 1);
}
