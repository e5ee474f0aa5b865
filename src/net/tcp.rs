use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::event_loop::EventLoop;
use crate::handle::{
    AllocCb, ConnectionCb, Flags, Handle, HandleKind, ReadCb, RequestId, TcpId,
};
use crate::interest::Interest;
use crate::request::{Request, RequestKind};
use crate::sys::{socket, Socket};
use crate::token::Token;

/// Buffer size suggested to the alloc callback per read.
const READ_CHUNK: usize = 64 * 1024;

pub(crate) struct TcpState {
    pub(crate) socket: Option<Socket>,
    /// Interest set currently registered with the selector.
    pub(crate) registered: Option<Interest>,
    /// Bind failure stored for reporting at the next listen/connect.
    pub(crate) bind_error: Option<Error>,
    pub(crate) connect_req: Option<Token>,
    /// Accepted socket waiting to be claimed by `tcp_accept`. While one
    /// is waiting, read interest on the listener stays off.
    pub(crate) pending_accept: Option<Socket>,
    pub(crate) connection_cb: Option<ConnectionCb>,
    pub(crate) alloc_cb: Option<AllocCb>,
    pub(crate) read_cb: Option<ReadCb>,
    pub(crate) shutdown_req: Option<Token>,
    /// Write requests not yet fully handed to the kernel, oldest first.
    pub(crate) write_queue: VecDeque<Token>,
    /// Bytes charged for queued writes.
    pub(crate) write_queue_size: usize,
    /// Write requests submitted and not yet returned to the user.
    pub(crate) write_reqs_pending: u32,
}

impl TcpState {
    fn new() -> TcpState {
        TcpState {
            socket: None,
            registered: None,
            bind_error: None,
            connect_req: None,
            pending_accept: None,
            connection_cb: None,
            alloc_cb: None,
            read_cb: None,
            shutdown_req: None,
            write_queue: VecDeque::new(),
            write_queue_size: 0,
            write_reqs_pending: 0,
        }
    }
}

fn tcp_state(handle: &mut Handle) -> &mut TcpState {
    match &mut handle.kind {
        HandleKind::Tcp(state) => state,
        _ => unreachable!("handle is not a TCP handle"),
    }
}

impl EventLoop {
    pub fn tcp_init(&mut self) -> TcpId {
        TcpId(self.init_handle(HandleKind::Tcp(TcpState::new())))
    }

    /// Binds the handle, creating the socket if it does not exist yet.
    ///
    /// An address-in-use failure is not reported here: it is stored on the
    /// handle and surfaces from the next `tcp_listen` or `tcp_connect`.
    /// All other bind failures are returned immediately.
    pub fn tcp_bind(&mut self, id: TcpId, addr: SocketAddr) -> Result<()> {
        let handle = self.tcp_handle(id.0)?;
        if handle.flags.contains(Flags::BOUND) {
            return Err(Error::new(ErrorCode::Already));
        }

        let state = tcp_state(handle);
        if state.socket.is_none() {
            let socket = Socket::for_addr(addr, libc::SOCK_STREAM)?;
            socket.set_reuse_address()?;
            state.socket = Some(socket);
        }

        let deferred = match state.socket.as_ref().unwrap().bind(addr) {
            Ok(_) => None,
            Err(ref err) if err.raw_os_error() == Some(libc::EADDRINUSE) => {
                Some(Error::from_raw_os_error(libc::EADDRINUSE))
            }
            Err(err) => return Err(err.into()),
        };
        state.bind_error = deferred;

        let handle = self.handles.get_mut(id.0 .0).unwrap();
        handle.flags.insert(Flags::BOUND);
        if deferred.is_some() {
            handle.flags.insert(Flags::BIND_ERROR);
        }
        Ok(())
    }

    /// Starts listening for incoming connections. The connection callback
    /// fires once per accepted connection; claim each one with
    /// [`tcp_accept`] from inside the callback.
    ///
    /// [`tcp_accept`]: EventLoop::tcp_accept
    pub fn tcp_listen<F>(&mut self, id: TcpId, backlog: i32, cb: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, Result<()>) + 'static,
    {
        let handle = self.tcp_handle(id.0)?;
        if handle.flags.contains(Flags::BIND_ERROR) {
            return Err(tcp_state(handle).bind_error.expect("BIND_ERROR without error"));
        }
        if handle.flags.contains(Flags::LISTENING) || handle.flags.contains(Flags::READING) {
            return Err(Error::new(ErrorCode::Already));
        }

        let state = tcp_state(handle);
        match state.socket.as_ref() {
            Some(socket) => socket.listen(backlog)?,
            // Never bound: nothing to listen on.
            None => return Err(Error::new(ErrorCode::Invalid)),
        }
        state.connection_cb = Some(Box::new(cb));

        self.handles
            .get_mut(id.0 .0)
            .unwrap()
            .flags
            .insert(Flags::LISTENING);
        self.tcp_sync_interest(id.0)
    }

    /// Claims the connection that the server's connection callback just
    /// announced, transferring the accepted socket into `client` (a fresh
    /// handle from [`tcp_init`]) and re-arming the server.
    ///
    /// [`tcp_init`]: EventLoop::tcp_init
    pub fn tcp_accept(&mut self, server: TcpId, client: TcpId) -> Result<()> {
        let accepted = {
            let handle = self.tcp_handle(server.0)?;
            match tcp_state(handle).pending_accept.take() {
                Some(socket) => socket,
                None => return Err(Error::new(ErrorCode::NotConn)),
            }
        };

        {
            let handle = self.tcp_handle(client.0)?;
            let state = tcp_state(handle);
            if state.socket.is_some() {
                return Err(Error::new(ErrorCode::Invalid));
            }
            state.socket = Some(accepted);
            self.handles
                .get_mut(client.0 .0)
                .unwrap()
                .flags
                .insert(Flags::CONNECTION);
        }

        // Re-arms read interest on the server, unless it started closing.
        self.tcp_sync_interest(server.0)
    }

    /// Submits a non-blocking connect. The callback reports the outcome;
    /// on success the handle is a connected stream. The handle is bound to
    /// the wildcard address first if it was never bound.
    pub fn tcp_connect<F>(&mut self, id: TcpId, addr: SocketAddr, cb: F) -> Result<RequestId>
    where
        F: FnOnce(&mut EventLoop, Result<()>) + 'static,
    {
        let handle = self.tcp_handle(id.0)?;
        if handle.flags.contains(Flags::BIND_ERROR) {
            return Err(tcp_state(handle).bind_error.expect("BIND_ERROR without error"));
        }
        if handle.flags.contains(Flags::CONNECTION) || handle.flags.contains(Flags::CONNECTED) {
            return Err(Error::new(ErrorCode::IsConn));
        }
        if handle.flags.contains(Flags::LISTENING) {
            return Err(Error::new(ErrorCode::Invalid));
        }
        let state = tcp_state(handle);
        if state.connect_req.is_some() {
            return Err(Error::new(ErrorCode::Already));
        }

        if state.socket.is_none() {
            // The kernel auto-binds to the wildcard address on connect.
            let socket = Socket::for_addr(addr, libc::SOCK_STREAM)?;
            socket.set_reuse_address()?;
            state.socket = Some(socket);
        }
        state.socket.as_ref().unwrap().connect(addr)?;

        let req_token = Token(self.requests.insert(Request::new(RequestKind::Connect {
            handle: id.0,
            cb: Some(Box::new(cb)),
            error: None,
        })));

        let handle = self.handles.get_mut(id.0 .0).unwrap();
        handle.flags.insert(Flags::BOUND);
        handle.reqs_pending += 1;
        tcp_state(handle).connect_req = Some(req_token);

        self.tcp_sync_interest(id.0)?;
        Ok(RequestId(req_token))
    }

    /// Starts reading. The alloc callback supplies each buffer; the read
    /// callback sees every chunk, `Ok(0)` for an unused buffer, and
    /// `Err(EOF)` at end of stream.
    pub fn tcp_read_start<A, F>(&mut self, id: TcpId, alloc_cb: A, read_cb: F) -> Result<()>
    where
        A: FnMut(&mut EventLoop, usize) -> Vec<u8> + 'static,
        F: FnMut(&mut EventLoop, Result<usize>, Vec<u8>) + 'static,
    {
        let handle = self.tcp_handle(id.0)?;
        if !handle.flags.contains(Flags::CONNECTION) {
            return Err(Error::new(ErrorCode::Invalid));
        }
        if handle.flags.contains(Flags::READING) {
            return Err(Error::new(ErrorCode::Already));
        }
        if handle.flags.contains(Flags::EOF) {
            return Err(Error::new(ErrorCode::Eof));
        }

        let state = tcp_state(handle);
        state.alloc_cb = Some(Box::new(alloc_cb));
        state.read_cb = Some(Box::new(read_cb));
        handle.flags.insert(Flags::READING);

        self.tcp_sync_interest(id.0)
    }

    /// Stops read-side callbacks. The buffers already delivered stay with
    /// the user; nothing further is read until `tcp_read_start`.
    pub fn tcp_read_stop(&mut self, id: TcpId) -> Result<()> {
        let handle = self.tcp_handle(id.0)?;
        handle.flags.remove(Flags::READING);
        let state = tcp_state(handle);
        state.alloc_cb = None;
        state.read_cb = None;
        self.tcp_sync_interest(id.0)
    }

    /// Writes the buffers, in order, completing in submission order. An
    /// immediate kernel accept completes without charging the handle;
    /// anything else is queued and charged to `write_queue_size` until the
    /// write's callback has run.
    pub fn tcp_write<F>(&mut self, id: TcpId, bufs: &[&[u8]], cb: F) -> Result<RequestId>
    where
        F: FnOnce(&mut EventLoop, Result<()>) + 'static,
    {
        let handle = self.tcp_handle(id.0)?;
        if !handle.flags.contains(Flags::CONNECTION) {
            return Err(Error::new(ErrorCode::Invalid));
        }
        if handle.flags.contains(Flags::SHUTTING) {
            return Err(Error::new(ErrorCode::Pipe));
        }

        let state = tcp_state(handle);
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let fd = state.socket.as_ref().unwrap().as_raw_fd();

        // An immediate attempt would reorder bytes while older writes are
        // still queued.
        let mut written = 0;
        if state.write_queue.is_empty() {
            while written < total {
                match socket::writev(fd, bufs, written) {
                    Ok(n) => written += n,
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let queued_bytes = total - written;
        let data = if queued_bytes == 0 {
            Vec::new()
        } else {
            let mut data = Vec::with_capacity(queued_bytes);
            let mut skip = written;
            for buf in bufs {
                if skip >= buf.len() {
                    skip -= buf.len();
                    continue;
                }
                data.extend_from_slice(&buf[skip..]);
                skip = 0;
            }
            data
        };

        let req_token = Token(self.requests.insert(Request::new(RequestKind::Write {
            handle: id.0,
            data,
            written: 0,
            queued_bytes,
            cb: Some(Box::new(cb)),
            error: None,
        })));

        let handle = self.handles.get_mut(id.0 .0).unwrap();
        handle.reqs_pending += 1;
        let state = tcp_state(handle);
        state.write_reqs_pending += 1;

        if queued_bytes == 0 {
            trace!("write accepted immediately; token={} bytes={}", id.0 .0, total);
            self.pending_push(req_token);
        } else {
            state.write_queue.push_back(req_token);
            state.write_queue_size += queued_bytes;
            self.tcp_sync_interest(id.0)?;
        }
        Ok(RequestId(req_token))
    }

    /// Requests an orderly write-side shutdown. The actual
    /// `shutdown(SHUT_WR)` happens once every write submitted before this
    /// call has completed; the callback fires after it.
    pub fn tcp_shutdown<F>(&mut self, id: TcpId, cb: F) -> Result<RequestId>
    where
        F: FnOnce(&mut EventLoop, Result<()>) + 'static,
    {
        let handle = self.tcp_handle(id.0)?;
        if !handle.flags.contains(Flags::CONNECTION) {
            return Err(Error::new(ErrorCode::Invalid));
        }
        if handle.flags.contains(Flags::SHUTTING) {
            return Err(Error::new(ErrorCode::Pipe));
        }

        let req_token = Token(self.requests.insert(Request::new(RequestKind::Shutdown {
            handle: id.0,
            cb: Some(Box::new(cb)),
            error: None,
        })));

        let handle = self.handles.get_mut(id.0 .0).unwrap();
        handle.flags.insert(Flags::SHUTTING);
        handle.reqs_pending += 1;
        tcp_state(handle).shutdown_req = Some(req_token);

        // Resolves in the endgame pass once write_reqs_pending reaches 0.
        self.want_endgame(id.0);
        Ok(RequestId(req_token))
    }

    /// The locally bound address.
    pub fn tcp_getsockname(&self, id: TcpId) -> Result<SocketAddr> {
        match self.handles.get(id.0 .0).map(|h| &h.kind) {
            Some(HandleKind::Tcp(state)) => match state.socket.as_ref() {
                Some(socket) => socket.local_addr().map_err(Error::from),
                None => Err(Error::new(ErrorCode::Invalid)),
            },
            _ => Err(Error::new(ErrorCode::Invalid)),
        }
    }

    /*
     *
     * ===== Loop-internal =====
     *
     */

    fn tcp_handle(&mut self, token: Token) -> Result<&mut Handle> {
        let ok = match self.handles.get(token.0) {
            Some(handle) => {
                matches!(handle.kind, HandleKind::Tcp(_)) && !handle.flags.contains(Flags::CLOSING)
            }
            None => false,
        };
        if ok {
            Ok(self.handles.get_mut(token.0).unwrap())
        } else {
            Err(Error::new(ErrorCode::Invalid))
        }
    }

    pub(crate) fn tcp_io_event(&mut self, token: Token, readable: bool, writable: bool) {
        if writable {
            self.tcp_handle_writable(token);
        }
        if readable {
            self.tcp_handle_readable(token);
        }
        let _ = self.tcp_sync_interest(token);
    }

    fn tcp_handle_writable(&mut self, token: Token) {
        let connecting = match self.handles.get_mut(token.0) {
            Some(handle) => {
                !handle.flags.contains(Flags::CONNECTED) && tcp_state(handle).connect_req.is_some()
            }
            None => return,
        };
        if connecting {
            self.tcp_finish_connect(token);
        } else {
            self.tcp_drain_writes(token);
        }
    }

    /// Writability on a connecting socket: the connect finished, one way
    /// or the other. `SO_ERROR` tells which.
    fn tcp_finish_connect(&mut self, token: Token) {
        let (req_token, status) = {
            let handle = match self.handles.get_mut(token.0) {
                Some(handle) => handle,
                None => return,
            };
            let state = tcp_state(handle);
            let req_token = match state.connect_req.take() {
                Some(req) => req,
                None => return,
            };
            let status = match state.socket.as_ref().unwrap().take_error() {
                Ok(None) => Ok(()),
                Ok(Some(err)) => Err(Error::from(err)),
                Err(err) => Err(Error::from(err)),
            };
            (req_token, status)
        };

        trace!("connect finished; token={} ok={}", token.0, status.is_ok());
        match status {
            Ok(()) => {
                let handle = self.handles.get_mut(token.0).unwrap();
                handle.flags.insert(Flags::CONNECTION);
                handle.flags.insert(Flags::CONNECTED);
            }
            Err(err) => {
                if let Some(req) = self.requests.get_mut(req_token.0) {
                    req.set_error(err);
                }
            }
        }
        self.pending_push(req_token);
    }

    fn tcp_drain_writes(&mut self, token: Token) {
        loop {
            let (fd, req_token) = match self.handles.get_mut(token.0) {
                Some(handle) if !handle.flags.contains(Flags::CLOSING) => {
                    let state = tcp_state(handle);
                    let fd = match state.socket.as_ref() {
                        Some(socket) => socket.as_raw_fd(),
                        None => return,
                    };
                    match state.write_queue.front() {
                        Some(req) => (fd, *req),
                        None => return,
                    }
                }
                _ => return,
            };

            let res = {
                let req = self.requests.get_mut(req_token.0).expect("queued write vanished");
                let (data, written) = match &mut req.kind {
                    RequestKind::Write { data, written, .. } => (data, written),
                    _ => unreachable!("non-write request on write queue"),
                };
                match socket::send(fd, &data[*written..]) {
                    Ok(n) => {
                        *written += n;
                        Ok(*written == data.len())
                    }
                    Err(err) => Err(err),
                }
            };

            match res {
                Ok(true) => {
                    // Fully flushed; completes through the pending queue.
                    self.tcp_pop_write(token);
                    self.pending_push(req_token);
                }
                // Kernel took a chunk but not all of it; try the rest.
                Ok(false) => continue,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if let Some(req) = self.requests.get_mut(req_token.0) {
                        req.set_error(err.into());
                    }
                    self.tcp_pop_write(token);
                    self.pending_push(req_token);
                }
            }
        }
    }

    fn tcp_pop_write(&mut self, token: Token) {
        if let Some(handle) = self.handles.get_mut(token.0) {
            tcp_state(handle).write_queue.pop_front();
        }
    }

    fn tcp_handle_readable(&mut self, token: Token) {
        let flags = match self.handles.get(token.0) {
            Some(handle) => handle.flags,
            None => return,
        };
        if flags.contains(Flags::LISTENING) {
            self.tcp_drain_accept(token);
        } else if flags.contains(Flags::READING) {
            self.tcp_drain_read(token);
        }
    }

    /// Accepts until the kernel runs dry, announcing each connection. If
    /// the callback does not claim a connection, accepting pauses until
    /// `tcp_accept` is called.
    fn tcp_drain_accept(&mut self, token: Token) {
        let mut cb = match self.handles.get_mut(token.0) {
            Some(handle) => match tcp_state(handle).connection_cb.take() {
                Some(cb) => cb,
                None => return,
            },
            None => return,
        };

        loop {
            let res = match self.handles.get_mut(token.0) {
                Some(handle)
                    if handle.flags.contains(Flags::LISTENING)
                        && !handle.flags.contains(Flags::CLOSING) =>
                {
                    let state = tcp_state(handle);
                    if state.pending_accept.is_some() {
                        break;
                    }
                    state.socket.as_ref().unwrap().accept()
                }
                _ => break,
            };

            match res {
                Ok((socket, peer)) => {
                    trace!("accepted connection; token={} peer={}", token.0, peer);
                    let handle = self.handles.get_mut(token.0).unwrap();
                    tcp_state(handle).pending_accept = Some(socket);
                    cb(self, Ok(()));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    cb(self, Err(err.into()));
                    break;
                }
            }
        }

        if let Some(handle) = self.handles.get_mut(token.0) {
            if handle.flags.contains(Flags::LISTENING) {
                let state = tcp_state(handle);
                if state.connection_cb.is_none() {
                    state.connection_cb = Some(cb);
                }
            }
        }
    }

    /// Drains the socket into alloc-callback buffers until the kernel has
    /// nothing more, the buffer was not filled, or the stream ends.
    fn tcp_drain_read(&mut self, token: Token) {
        let (fd, mut alloc_cb, mut read_cb) = match self.handles.get_mut(token.0) {
            Some(handle) => {
                let state = tcp_state(handle);
                let fd = match state.socket.as_ref() {
                    Some(socket) => socket.as_raw_fd(),
                    None => return,
                };
                match (state.alloc_cb.take(), state.read_cb.take()) {
                    (Some(alloc_cb), Some(read_cb)) => (fd, alloc_cb, read_cb),
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

            let mut buf = alloc_cb(self, READ_CHUNK);
            if buf.is_empty() {
                // A zero-length buffer is tolerated and reported unused.
                read_cb(self, Ok(0), buf);
                break;
            }
            // The alloc callback may have stopped reading or closed the
            // handle; the fd may be gone.
            if !keep_reading(self) {
                break;
            }

            let res = loop {
                match socket::recv(fd, &mut buf) {
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    res => break res,
                }
            };

            match res {
                Ok(0) => {
                    let handle = self.handles.get_mut(token.0).unwrap();
                    handle.flags.remove(Flags::READING);
                    handle.flags.insert(Flags::EOF);
                    buf.clear();
                    read_cb(self, Err(Error::new(ErrorCode::Eof)), buf);
                    break;
                }
                Ok(n) => {
                    let filled = n == buf.len();
                    buf.truncate(n);
                    read_cb(self, Ok(n), buf);
                    // A partial read means the kernel buffer is empty.
                    if !filled {
                        break;
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    // Spurious readiness; hand the buffer back unused.
                    read_cb(self, Ok(0), buf);
                    break;
                }
                Err(err) => {
                    let handle = self.handles.get_mut(token.0).unwrap();
                    handle.flags.remove(Flags::READING);
                    buf.clear();
                    read_cb(self, Err(err.into()), buf);
                    break;
                }
            }
        }

        if let Some(handle) = self.handles.get_mut(token.0) {
            if handle.flags.contains(Flags::READING) {
                let state = tcp_state(handle);
                if state.read_cb.is_none() {
                    state.read_cb = Some(read_cb);
                    state.alloc_cb = Some(alloc_cb);
                }
            }
        }
    }

    /// Brings the selector registration in line with what the handle can
    /// currently make progress on.
    pub(crate) fn tcp_sync_interest(&mut self, token: Token) -> Result<()> {
        let (fd, registered, want) = {
            let handle = match self.handles.get_mut(token.0) {
                Some(handle) => handle,
                None => return Ok(()),
            };
            let flags = handle.flags;
            let state = tcp_state(handle);
            let fd = match state.socket.as_ref() {
                Some(socket) => socket.as_raw_fd(),
                None => return Ok(()),
            };

            let mut want: Option<Interest> = None;
            if !flags.contains(Flags::CLOSING) {
                let readable = (flags.contains(Flags::READING) && flags.contains(Flags::CONNECTION))
                    || (flags.contains(Flags::LISTENING) && state.pending_accept.is_none());
                let writable = (state.connect_req.is_some() && !flags.contains(Flags::CONNECTED))
                    || !state.write_queue.is_empty();
                if readable {
                    want = Some(Interest::READABLE);
                }
                if writable {
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
            tcp_state(handle).registered = want;
        }
        Ok(())
    }

    /// Dispatch of a returned connect or write request.
    pub(crate) fn tcp_return(&mut self, kind: RequestKind) {
        match kind {
            RequestKind::Connect { handle, cb, error } => {
                let status = match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                if let Some(cb) = cb {
                    cb(self, status);
                }
                self.request_returned(handle);
            }
            RequestKind::Write {
                handle,
                queued_bytes,
                cb,
                error,
                ..
            } => {
                if let Some(h) = self.handles.get_mut(handle.0) {
                    let flags = h.flags;
                    let state = tcp_state(h);
                    state.write_queue_size -= queued_bytes;
                    state.write_reqs_pending -= 1;
                    if state.write_reqs_pending == 0
                        && flags.contains(Flags::SHUTTING)
                        && !flags.contains(Flags::SHUT)
                    {
                        self.want_endgame(handle);
                    }
                }
                let status = match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                if let Some(cb) = cb {
                    cb(self, status);
                }
                self.request_returned(handle);
            }
            _ => unreachable!("request kind is not returned through the TCP path"),
        }
    }

    /// Close teardown: the socket goes away immediately, queued requests
    /// come back as aborted, the close callback waits for them in the
    /// endgame.
    pub(crate) fn tcp_close_teardown(&mut self, token: Token) {
        let (socket, aborted) = {
            let handle = match self.handles.get_mut(token.0) {
                Some(handle) => handle,
                None => return,
            };
            handle.flags.remove(Flags::READING);
            handle.flags.remove(Flags::LISTENING);

            let state = tcp_state(handle);
            state.alloc_cb = None;
            state.read_cb = None;
            state.connection_cb = None;
            state.pending_accept = None;
            state.registered = None;

            let mut aborted: Vec<Token> = Vec::new();
            if let Some(req) = state.connect_req.take() {
                aborted.push(req);
            }
            aborted.extend(state.write_queue.drain(..));
            (state.socket.take(), aborted)
        };

        if let Some(socket) = socket {
            let _ = self.selector.deregister(socket.as_raw_fd());
            // Dropping closes the socket here, before the callbacks run.
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

    /// The endgame visit: an ordered shutdown once writes have drained,
    /// and the final close once every request has been returned.
    pub(crate) fn tcp_endgame(&mut self, token: Token) {
        let shutdown_ready = match self.handles.get_mut(token.0) {
            Some(handle) => {
                handle.flags.contains(Flags::SHUTTING)
                    && !handle.flags.contains(Flags::SHUT)
                    && tcp_state(handle).write_reqs_pending == 0
                    && tcp_state(handle).shutdown_req.is_some()
            }
            None => return,
        };

        if shutdown_ready {
            let (req_token, status) = {
                let handle = self.handles.get_mut(token.0).unwrap();
                let state = tcp_state(handle);
                let req_token = state.shutdown_req.take().unwrap();
                let status = match state.socket.as_ref() {
                    Some(socket) => socket.shutdown_write().map_err(Error::from),
                    // Closed before the shutdown got its turn.
                    None => Err(Error::new(ErrorCode::NotConn)),
                };
                if status.is_ok() {
                    handle.flags.insert(Flags::SHUT);
                }
                (req_token, status)
            };

            let cb = match self.requests.remove(req_token.0) {
                Some(Request {
                    kind: RequestKind::Shutdown { cb, .. },
                    ..
                }) => cb,
                _ => None,
            };
            if let Some(cb) = cb {
                cb(self, status);
            }
            self.request_returned(token);
        }

        let close_ready = match self.handles.get(token.0) {
            Some(handle) => handle.flags.contains(Flags::CLOSING) && handle.reqs_pending == 0,
            None => return,
        };
        if close_ready {
            self.finish_close(token);
        }
    }
}
