use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;

use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::event_loop::EventLoop;
use crate::handle::{AllocCb, Flags, Handle, HandleKind, RecvCb, RequestId, UdpId};
use crate::interest::Interest;
use crate::request::{Request, RequestKind};
use crate::sys::{socket, Socket};
use crate::token::Token;

/// Buffer size suggested to the alloc callback per datagram.
const RECV_CHUNK: usize = 64 * 1024;

/// Flags recognised by [`EventLoop::udp_bind`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UdpFlags(u32);

impl UdpFlags {
    /// Disable dual-stack: a socket bound to an IPv6 wildcard address
    /// will not receive IPv4-mapped traffic. Rejected on IPv4 binds.
    pub const IPV6ONLY: UdpFlags = UdpFlags(1);

    pub const fn empty() -> UdpFlags {
        UdpFlags(0)
    }

    pub const fn contains(self, other: UdpFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    const fn unrecognised(self) -> bool {
        (self.0 & !Self::IPV6ONLY.0) != 0
    }
}

/// Argument of [`EventLoop::udp_set_membership`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Membership {
    Join,
    Leave,
}

pub(crate) struct UdpState {
    pub(crate) socket: Option<Socket>,
    pub(crate) registered: Option<Interest>,
    pub(crate) alloc_cb: Option<AllocCb>,
    pub(crate) recv_cb: Option<RecvCb>,
    /// Datagrams the kernel would not take yet, oldest first.
    pub(crate) send_queue: VecDeque<Token>,
}

impl UdpState {
    fn new() -> UdpState {
        UdpState {
            socket: None,
            registered: None,
            alloc_cb: None,
            recv_cb: None,
            send_queue: VecDeque::new(),
        }
    }
}

fn udp_state(handle: &mut Handle) -> &mut UdpState {
    match &mut handle.kind {
        HandleKind::Udp(state) => state,
        _ => unreachable!("handle is not a UDP handle"),
    }
}

impl EventLoop {
    pub fn udp_init(&mut self) -> UdpId {
        UdpId(self.init_handle(HandleKind::Udp(UdpState::new())))
    }

    /// Creates the socket and binds it. Binding `::` without
    /// [`UdpFlags::IPV6ONLY`] receives IPv4-mapped traffic as well.
    pub fn udp_bind(&mut self, id: UdpId, addr: SocketAddr, flags: UdpFlags) -> Result<()> {
        if flags.unrecognised() {
            return Err(Error::new(ErrorCode::Invalid));
        }
        // IPv6-only mode makes no sense on a non-IPv6 socket.
        if flags.contains(UdpFlags::IPV6ONLY) && addr.is_ipv4() {
            return Err(Error::new(ErrorCode::Invalid));
        }

        let handle = self.udp_handle(id.0)?;
        let state = udp_state(handle);
        if state.socket.is_some() {
            return Err(Error::new(ErrorCode::Invalid));
        }

        let socket = Socket::for_addr(addr, libc::SOCK_DGRAM)?;
        if addr.is_ipv6() {
            // Set explicitly both ways; the OS default is a sysctl.
            socket.set_only_v6(flags.contains(UdpFlags::IPV6ONLY))?;
        }
        socket.bind(addr)?;
        state.socket = Some(socket);

        self.handles.get_mut(id.0 .0).unwrap().flags.insert(Flags::BOUND);
        Ok(())
    }

    /// The locally bound address.
    pub fn udp_getsockname(&self, id: UdpId) -> Result<SocketAddr> {
        match self.handles.get(id.0 .0).map(|h| &h.kind) {
            Some(HandleKind::Udp(state)) => match state.socket.as_ref() {
                Some(socket) => socket.local_addr().map_err(Error::from),
                None => Err(Error::new(ErrorCode::Invalid)),
            },
            _ => Err(Error::new(ErrorCode::Invalid)),
        }
    }

    /// Joins or leaves a multicast group. Selecting the interface by
    /// address is IPv4-only; IPv6 membership uses the default interface.
    pub fn udp_set_membership(
        &mut self,
        id: UdpId,
        multicast_addr: IpAddr,
        interface_addr: Option<IpAddr>,
        membership: Membership,
    ) -> Result<()> {
        let handle = self.udp_handle(id.0)?;
        let state = udp_state(handle);
        let socket = match state.socket.as_ref() {
            Some(socket) => socket,
            None => return Err(Error::new(ErrorCode::Invalid)),
        };
        let join = membership == Membership::Join;

        match (multicast_addr, interface_addr) {
            (IpAddr::V4(multi), None) => {
                socket.set_membership_v4(multi, Ipv4Addr::UNSPECIFIED, join)?
            }
            (IpAddr::V4(multi), Some(IpAddr::V4(interface))) => {
                socket.set_membership_v4(multi, interface, join)?
            }
            (IpAddr::V6(multi), None) => socket.set_membership_v6(multi, 0, join)?,
            _ => return Err(Error::new(ErrorCode::Invalid)),
        }
        Ok(())
    }

    /// Starts delivering incoming datagrams. The receive callback gets
    /// `(Ok(nread), buf, Some(source))` per datagram and
    /// `(Ok(0), buf, None)` when a buffer comes back unused.
    pub fn udp_recv_start<A, F>(&mut self, id: UdpId, alloc_cb: A, recv_cb: F) -> Result<()>
    where
        A: FnMut(&mut EventLoop, usize) -> Vec<u8> + 'static,
        F: FnMut(&mut EventLoop, Result<usize>, Vec<u8>, Option<SocketAddr>) + 'static,
    {
        let handle = self.udp_handle(id.0)?;
        if handle.flags.contains(Flags::READING) {
            return Err(Error::new(ErrorCode::Already));
        }
        let state = udp_state(handle);
        if state.socket.is_none() {
            return Err(Error::new(ErrorCode::Invalid));
        }
        state.alloc_cb = Some(Box::new(alloc_cb));
        state.recv_cb = Some(Box::new(recv_cb));
        handle.flags.insert(Flags::READING);

        self.udp_sync_interest(id.0)
    }

    /// Stops delivering datagrams.
    pub fn udp_recv_stop(&mut self, id: UdpId) -> Result<()> {
        let handle = self.udp_handle(id.0)?;
        handle.flags.remove(Flags::READING);
        let state = udp_state(handle);
        state.alloc_cb = None;
        state.recv_cb = None;
        self.udp_sync_interest(id.0)
    }

    /// Sends one datagram. The handle is bound to the wildcard address
    /// first if it was never bound. Datagrams the kernel will not take yet
    /// are queued and sent on writability, in submission order.
    pub fn udp_send<F>(
        &mut self,
        id: UdpId,
        data: &[u8],
        addr: SocketAddr,
        cb: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(&mut EventLoop, Result<()>) + 'static,
    {
        let handle = self.udp_handle(id.0)?;
        let state = udp_state(handle);

        let mut bound_now = false;
        if state.socket.is_none() {
            let wildcard: SocketAddr = if addr.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = Socket::for_addr(wildcard, libc::SOCK_DGRAM)?;
            socket.bind(wildcard)?;
            state.socket = Some(socket);
            bound_now = true;
        }
        let fd = state.socket.as_ref().unwrap().as_raw_fd();

        let mut accepted = false;
        if state.send_queue.is_empty() {
            loop {
                match socket::sendto(fd, data, addr) {
                    Ok(_) => {
                        accepted = true;
                        break;
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let req_token = Token(self.requests.insert(Request::new(RequestKind::Send {
            handle: id.0,
            data: if accepted { Vec::new() } else { data.to_vec() },
            addr,
            cb: Some(Box::new(cb)),
            error: None,
        })));

        let handle = self.handles.get_mut(id.0 .0).unwrap();
        if bound_now {
            handle.flags.insert(Flags::BOUND);
        }
        handle.reqs_pending += 1;

        if accepted {
            trace!("datagram sent immediately; token={} bytes={}", id.0 .0, data.len());
            self.pending_push(req_token);
        } else {
            udp_state(handle).send_queue.push_back(req_token);
            self.udp_sync_interest(id.0)?;
        }
        Ok(RequestId(req_token))
    }

    /*
     *
     * ===== Loop-internal =====
     *
     */

    fn udp_handle(&mut self, token: Token) -> Result<&mut Handle> {
        let ok = match self.handles.get(token.0) {
            Some(handle) => {
                matches!(handle.kind, HandleKind::Udp(_)) && !handle.flags.contains(Flags::CLOSING)
            }
            None => false,
        };
        if ok {
            Ok(self.handles.get_mut(token.0).unwrap())
        } else {
            Err(Error::new(ErrorCode::Invalid))
        }
    }

    pub(crate) fn udp_io_event(&mut self, token: Token, readable: bool, writable: bool) {
        if writable {
            self.udp_drain_sends(token);
        }
        if readable {
            self.udp_drain_recv(token);
        }
        let _ = self.udp_sync_interest(token);
    }

    fn udp_drain_sends(&mut self, token: Token) {
        loop {
            let (fd, req_token) = match self.handles.get_mut(token.0) {
                Some(handle) if !handle.flags.contains(Flags::CLOSING) => {
                    let state = udp_state(handle);
                    let fd = match state.socket.as_ref() {
                        Some(socket) => socket.as_raw_fd(),
                        None => return,
                    };
                    match state.send_queue.front() {
                        Some(req) => (fd, *req),
                        None => return,
                    }
                }
                _ => return,
            };

            let res = {
                let req = self.requests.get_mut(req_token.0).expect("queued send vanished");
                match &req.kind {
                    RequestKind::Send { data, addr, .. } => socket::sendto(fd, data, *addr),
                    _ => unreachable!("non-send request on send queue"),
                }
            };

            match res {
                Ok(_) => {
                    self.udp_pop_send(token);
                    self.pending_push(req_token);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if let Some(req) = self.requests.get_mut(req_token.0) {
                        req.set_error(err.into());
                    }
                    self.udp_pop_send(token);
                    self.pending_push(req_token);
                }
            }
        }
    }

    fn udp_pop_send(&mut self, token: Token) {
        if let Some(handle) = self.handles.get_mut(token.0) {
            udp_state(handle).send_queue.pop_front();
        }
    }

    /// Receives datagrams into alloc-callback buffers until the kernel
    /// runs dry.
    fn udp_drain_recv(&mut self, token: Token) {
        let (fd, mut alloc_cb, mut recv_cb) = match self.handles.get_mut(token.0) {
            Some(handle) => {
                let state = udp_state(handle);
                let fd = match state.socket.as_ref() {
                    Some(socket) => socket.as_raw_fd(),
                    None => return,
                };
                match (state.alloc_cb.take(), state.recv_cb.take()) {
                    (Some(alloc_cb), Some(recv_cb)) => (fd, alloc_cb, recv_cb),
                    _ => return,
                }
            }
            None => return,
        };

        loop {
            let keep_reading = |lp: &EventLoop| match lp.handles.get(token.0) {
                Some(handle) => {
                    handle.flags.contains(Flags::READING) && !handle.flags.contains(Flags::CLOSING)
                }
                None => false,
            };
            if !keep_reading(self) {
                break;
            }

            let mut buf = alloc_cb(self, RECV_CHUNK);
            if buf.is_empty() {
                recv_cb(self, Ok(0), buf, None);
                break;
            }
            if !keep_reading(self) {
                break;
            }

            let res = loop {
                match socket::recvfrom(fd, &mut buf) {
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    res => break res,
                }
            };

            match res {
                Ok((n, addr)) => {
                    trace!("datagram received; token={} bytes={} from={}", token.0, n, addr);
                    buf.truncate(n);
                    recv_cb(self, Ok(n), buf, Some(addr));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    // Nothing (left) to read; hand the buffer back unused.
                    recv_cb(self, Ok(0), buf, None);
                    break;
                }
                Err(err) => {
                    recv_cb(self, Err(err.into()), buf, None);
                    break;
                }
            }
        }

        if let Some(handle) = self.handles.get_mut(token.0) {
            if handle.flags.contains(Flags::READING) {
                let state = udp_state(handle);
                if state.recv_cb.is_none() {
                    state.recv_cb = Some(recv_cb);
                    state.alloc_cb = Some(alloc_cb);
                }
            }
        }
    }

    pub(crate) fn udp_sync_interest(&mut self, token: Token) -> Result<()> {
        let (fd, registered, want) = {
            let handle = match self.handles.get_mut(token.0) {
                Some(handle) => handle,
                None => return Ok(()),
            };
            let flags = handle.flags;
            let state = udp_state(handle);
            let fd = match state.socket.as_ref() {
                Some(socket) => socket.as_raw_fd(),
                None => return Ok(()),
            };

            let mut want: Option<Interest> = None;
            if !flags.contains(Flags::CLOSING) {
                if flags.contains(Flags::READING) {
                    want = Some(Interest::READABLE);
                }
                if !state.send_queue.is_empty() {
                    want = Some(match want {
                        Some(interest) => interest | Interest::WRITABLE,
                        None => Interest::WRITABLE,
                    });
                }
            }
            (fd, state.registered, want)
        };

        if registered == want {
            return Ok(());
        }
        match (registered, want) {
            (None, Some(interest)) => self.selector.register(fd, token, interest)?,
            (Some(_), Some(interest)) => self.selector.reregister(fd, token, interest)?,
            (Some(_), None) => self.selector.deregister(fd)?,
            (None, None) => {}
        }

        if let Some(handle) = self.handles.get_mut(token.0) {
            udp_state(handle).registered = want;
        }
        Ok(())
    }

    /// Dispatch of a returned send request.
    pub(crate) fn udp_return(&mut self, kind: RequestKind) {
        match kind {
            RequestKind::Send { handle, cb, error, .. } => {
                let status = match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                if let Some(cb) = cb {
                    cb(self, status);
                }
                self.request_returned(handle);
            }
            _ => unreachable!("request kind is not returned through the UDP path"),
        }
    }

    pub(crate) fn udp_close_teardown(&mut self, token: Token) {
        let (socket, aborted) = {
            let handle = match self.handles.get_mut(token.0) {
                Some(handle) => handle,
                None => return,
            };
            handle.flags.remove(Flags::READING);

            let state = udp_state(handle);
            state.alloc_cb = None;
            state.recv_cb = None;
            state.registered = None;
            let aborted: Vec<Token> = state.send_queue.drain(..).collect();
            (state.socket.take(), aborted)
        };

        if let Some(socket) = socket {
            let _ = self.selector.deregister(socket.as_raw_fd());
        }

        for req_token in aborted {
            if let Some(req) = self.requests.get_mut(req_token.0) {
                req.set_error(Error::new(ErrorCode::ConnAborted));
            }
            self.pending_push(req_token);
        }

        if let Some(handle) = self.handles.get(token.0) {
            if handle.reqs_pending == 0 {
                self.want_endgame(token);
            }
        }
    }

    pub(crate) fn udp_endgame(&mut self, token: Token) {
        let close_ready = match self.handles.get(token.0) {
            Some(handle) => handle.flags.contains(Flags::CLOSING) && handle.reqs_pending == 0,
            None => return,
        };
        if close_ready {
            self.finish_close(token);
        }
    }
}
