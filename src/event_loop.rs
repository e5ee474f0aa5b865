use std::collections::{BTreeMap, VecDeque};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{io, mem};

use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::handle::{AnyHandle, Flags, Handle, HandleKind, Tag};
use crate::interest::Interest;
use crate::request::{Request, RequestKind};
use crate::sys;
use crate::token::Token;
use crate::util::Slab;
use crate::watcher::Family;

/// Token under which the wake primitive is registered with the selector.
/// Arena keys grow from zero, so this can never collide with a handle.
pub(crate) const WAKER: Token = Token(usize::MAX);

/// Upper bound on a single poll's timeout. A delta beyond this merely
/// causes an extra (empty) loop iteration.
const POLL_TIMEOUT_MAX_MS: u64 = i32::MAX as u64;

/// `EventLoop` configuration.
#[derive(Debug, Clone)]
pub struct Builder {
    events_capacity: usize,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            events_capacity: 1024,
        }
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Sets the capacity of the internal poll-event buffer, i.e. how many
    /// readiness events one poll can deliver.
    ///
    /// The default value for this is 1024.
    pub fn events_capacity(&mut self, capacity: usize) -> &mut Self {
        self.events_capacity = capacity;
        self
    }

    pub fn build(&self) -> Result<EventLoop> {
        EventLoop::configured(self)
    }
}

/// Single threaded I/O event loop.
///
/// All handles live inside the loop and are addressed through copyable
/// typed ids. A loop is owned by the thread that created it; the only
/// operation that may be invoked from another thread is
/// [`AsyncWaker::send`].
///
/// [`run`] drives iterations in a fixed phase order: cached-time update,
/// due timers, the pending-request/endgame drain interleaved with idle
/// watchers, prepare watchers, the poll, check watchers. It returns once
/// the loop's reference count drops to zero, that is, once every handle
/// has been closed (plus any [`retain`]/[`release`] adjustment).
///
/// [`AsyncWaker::send`]: crate::AsyncWaker::send
/// [`run`]: EventLoop::run
/// [`retain`]: EventLoop::retain
/// [`release`]: EventLoop::release
pub struct EventLoop {
    pub(crate) selector: sys::Selector,
    events: sys::Events,
    pub(crate) waker: Arc<sys::Waker>,

    pub(crate) handles: Slab<Handle>,
    pub(crate) requests: Slab<Request>,

    /// Timers keyed by `(due_ms, seq)`; `seq` is the deterministic
    /// tie-break for timers due at the same millisecond.
    pub(crate) timers: BTreeMap<(u64, u64), Token>,
    pub(crate) timer_seq: u64,

    /// Completed or errored requests awaiting user-callback dispatch.
    pub(crate) pending: VecDeque<Token>,
    /// Handles awaiting their final close-callback invocation.
    pub(crate) endgame: Vec<Token>,

    pub(crate) watchers: [Vec<Token>; 3],

    /// Number of live handles keeping the loop alive, plus any manual
    /// adjustment.
    refs: i64,

    base: Instant,
    pub(crate) now_ms: u64,
}

impl EventLoop {
    /// Constructs a new `EventLoop` using the default configuration
    /// values.
    pub fn new() -> Result<EventLoop> {
        Builder::default().build()
    }

    fn configured(config: &Builder) -> Result<EventLoop> {
        let selector = sys::Selector::new()?;

        // Register the wake primitive with the selector; `AsyncWaker::send`
        // pokes it from foreign threads.
        let waker = sys::Waker::new()?;
        selector.register(waker.as_raw_fd(), WAKER, Interest::READABLE)?;

        Ok(EventLoop {
            selector,
            events: sys::Events::with_capacity(config.events_capacity),
            waker: Arc::new(waker),
            handles: Slab::with_capacity(256),
            requests: Slab::with_capacity(256),
            timers: BTreeMap::new(),
            timer_seq: 0,
            pending: VecDeque::new(),
            endgame: Vec::new(),
            watchers: [Vec::new(), Vec::new(), Vec::new()],
            refs: 0,
            base: Instant::now(),
            now_ms: 0,
        })
    }

    /// The cached loop time in milliseconds, updated once per iteration
    /// (and after every poll). Monotonic, relative to loop creation.
    pub fn now(&self) -> u64 {
        self.now_ms
    }

    /// Refreshes the cached loop time.
    pub fn update_time(&mut self) {
        self.now_ms = self.base.elapsed().as_millis() as u64;
    }

    /// Manually increments the loop's liveness count.
    pub fn retain(&mut self) {
        self.refs += 1;
    }

    /// Manually decrements the loop's liveness count. Useful to let the
    /// loop exit while a handle (e.g. an interval timer) is still open.
    pub fn release(&mut self) {
        self.refs -= 1;
    }

    /// Keeps spinning the event loop until no handle keeps it alive.
    pub fn run(&mut self) -> Result<()> {
        loop {
            trace!("event loop tick");
            self.update_time();
            self.process_timers();

            // Idle watchers run only while the loop would otherwise block;
            // close and request callbacks are flushed before them, and
            // again after them, until none of the three produces new work.
            while self.refs > 0
                && (!self.watchers[Family::Idle as usize].is_empty()
                    || !self.pending.is_empty()
                    || !self.endgame.is_empty())
            {
                while !self.pending.is_empty() || !self.endgame.is_empty() {
                    self.process_endgames();
                    self.process_pending();
                }

                self.invoke_watchers(Family::Idle);
            }

            if self.refs <= 0 {
                break;
            }

            self.invoke_watchers(Family::Prepare);
            self.poll()?;
            self.invoke_watchers(Family::Check);
        }

        debug_assert!(self.pending.is_empty());
        debug_assert!(self.endgame.is_empty());
        Ok(())
    }

    /// Requests the handle to be closed. The close callback is invoked
    /// from a later loop iteration, once every request in flight on the
    /// handle has been returned; it is the last signal about this handle
    /// and its id is dead afterwards. Closing an already-closing handle is
    /// a no-op.
    pub fn close<H, F>(&mut self, handle: H, cb: F) -> Result<()>
    where
        H: Into<AnyHandle>,
        F: FnOnce(&mut EventLoop) + 'static,
    {
        let token = handle.into().token();
        let handle = match self.handles.get_mut(token.0) {
            Some(handle) => handle,
            None => return Err(Error::new(ErrorCode::Invalid)),
        };
        if handle.flags.contains(Flags::CLOSING) {
            return Ok(());
        }
        handle.flags.insert(Flags::CLOSING);
        handle.close_cb = Some(Box::new(cb));

        match handle.kind.tag() {
            Tag::Tcp => self.tcp_close_teardown(token),
            Tag::Udp => self.udp_close_teardown(token),
            Tag::Timer => {
                self.timer_teardown(token);
                self.want_endgame(token);
            }
            Tag::Watcher => {
                self.watcher_teardown(token);
                self.want_endgame(token);
            }
            Tag::Async => self.async_close_teardown(token),
        }
        Ok(())
    }

    /// Whether the handle is scheduled: for timers and watchers, started
    /// and not stopped; for other types, open and not closing.
    pub fn is_active<H: Into<AnyHandle>>(&self, handle: H) -> bool {
        let token = handle.into().token();
        match self.handles.get(token.0) {
            None => false,
            Some(handle) => match handle.kind.tag() {
                Tag::Timer | Tag::Watcher => handle.flags.contains(Flags::ACTIVE),
                _ => !handle.flags.contains(Flags::CLOSING),
            },
        }
    }

    /*
     *
     * ===== Internal machinery =====
     *
     */

    pub(crate) fn init_handle(&mut self, kind: HandleKind) -> Token {
        let token = Token(self.handles.insert(Handle::new(kind)));
        self.refs += 1;
        trace!("init handle; token={}", token.0);
        token
    }

    /// Queues the handle for the endgame pass unless it is already queued.
    pub(crate) fn want_endgame(&mut self, token: Token) {
        if let Some(handle) = self.handles.get_mut(token.0) {
            if !handle.flags.contains(Flags::ENDGAME_QUEUED) {
                handle.flags.insert(Flags::ENDGAME_QUEUED);
                self.endgame.push(token);
            }
        }
    }

    /// Marks the request completed (or errored) and queues it for
    /// user-callback dispatch.
    pub(crate) fn pending_push(&mut self, token: Token) {
        if let Some(req) = self.requests.get_mut(token.0) {
            if !req.pending {
                req.pending = true;
                self.pending.push_back(token);
            }
        }
    }

    fn process_endgames(&mut self) {
        while let Some(token) = self.endgame.pop() {
            let tag = match self.handles.get_mut(token.0) {
                Some(handle) => {
                    handle.flags.remove(Flags::ENDGAME_QUEUED);
                    handle.kind.tag()
                }
                None => continue,
            };
            match tag {
                Tag::Tcp => self.tcp_endgame(token),
                Tag::Udp => self.udp_endgame(token),
                Tag::Timer | Tag::Watcher => self.finish_close(token),
                Tag::Async => self.async_endgame(token),
            }
        }
    }

    /// Runs one batch of pending-request callbacks. Requests queued by
    /// these callbacks wait for the next batch.
    fn process_pending(&mut self) {
        let batch: Vec<Token> = self.pending.drain(..).collect();
        for token in batch {
            self.dispatch_request(token);
        }
    }

    fn dispatch_request(&mut self, token: Token) {
        // Wake-up requests are persistent: clear the loan, keep the slot.
        if let Some(Request {
            kind: RequestKind::Wakeup { .. },
            ..
        }) = self.requests.get(token.0)
        {
            if let Some(req) = self.requests.get_mut(token.0) {
                req.pending = false;
            }
            self.async_return(token);
            return;
        }

        let mut req = match self.requests.remove(token.0) {
            Some(req) => req,
            None => return,
        };
        req.pending = false;

        match req.kind {
            RequestKind::Connect { .. } | RequestKind::Write { .. } => self.tcp_return(req.kind),
            RequestKind::Send { .. } => self.udp_return(req.kind),
            // Shutdown requests resolve in the endgame, never here.
            RequestKind::Shutdown { .. } | RequestKind::Wakeup { .. } => {
                unreachable!("request kind cannot be queued as pending")
            }
        }
    }

    /// Common tail of every returned request: one less reason to keep the
    /// handle from its endgame.
    pub(crate) fn request_returned(&mut self, token: Token) {
        if let Some(handle) = self.handles.get_mut(token.0) {
            debug_assert!(handle.reqs_pending > 0);
            handle.reqs_pending -= 1;
            if handle.flags.contains(Flags::CLOSING) && handle.reqs_pending == 0 {
                self.want_endgame(token);
            }
        }
    }

    /// Final step of the two-phase close: mark `CLOSED`, release the
    /// arena slot, drop the loop reference and hand the last signal to the
    /// user.
    pub(crate) fn finish_close(&mut self, token: Token) {
        let handle = match self.handles.get_mut(token.0) {
            Some(handle) => handle,
            None => return,
        };
        if !handle.flags.contains(Flags::CLOSING) || handle.flags.contains(Flags::CLOSED) {
            return;
        }
        debug_assert_eq!(handle.reqs_pending, 0);
        handle.flags.insert(Flags::CLOSED);

        let mut handle = self.handles.remove(token.0).expect("closing handle vanished");
        if let HandleKind::Async(state) = &handle.kind {
            self.requests.remove(state.wakeup_req.0);
        }
        self.refs -= 1;
        trace!("closed handle; token={}", token.0);

        if let Some(cb) = handle.close_cb.take() {
            cb(self);
        }
    }

    fn poll_timeout(&mut self) -> Option<Duration> {
        // Any idle watcher forces a non-blocking poll. So does work queued
        // after the drain, e.g. by a prepare callback: close callbacks are
        // flushed promptly, never parked behind a blocking poll.
        if !self.watchers[Family::Idle as usize].is_empty()
            || !self.pending.is_empty()
            || !self.endgame.is_empty()
        {
            return Some(Duration::ZERO);
        }

        let (&(due, _), _) = self.timers.first_key_value()?;
        self.update_time();
        let delta = due.saturating_sub(self.now_ms).min(POLL_TIMEOUT_MAX_MS);
        Some(Duration::from_millis(delta))
    }

    /// The only point where the loop suspends.
    fn poll(&mut self) -> Result<()> {
        let timeout = self.poll_timeout();
        trace!("polling; timeout={:?}", timeout);

        let mut events = mem::take(&mut self.events);
        let res = self.selector.select(&mut events, timeout);
        self.update_time();

        match res {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                self.events = events;
                return Ok(());
            }
            Err(err) => {
                self.events = events;
                return Err(err.into());
            }
        }

        for event in events.iter() {
            let token = sys::event::token(event);
            let readable = sys::event::is_readable(event);
            let writable = sys::event::is_writable(event);
            trace!(
                "readiness event; token={} readable={} writable={}",
                token.0,
                readable,
                writable
            );

            if token == WAKER {
                self.process_wake();
                continue;
            }

            // The handle may have been closed by a callback earlier in this
            // batch; its socket is gone, so the event is stale.
            let tag = match self.handles.get(token.0) {
                Some(handle) if !handle.flags.contains(Flags::CLOSING) => handle.kind.tag(),
                _ => continue,
            };
            match tag {
                Tag::Tcp => self.tcp_io_event(token, readable, writable),
                Tag::Udp => self.udp_io_event(token, readable, writable),
                Tag::Timer | Tag::Watcher | Tag::Async => {}
            }
        }

        self.events = events;
        Ok(())
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("handles", &self.handles.len())
            .field("refs", &self.refs)
            .field("now_ms", &self.now_ms)
            .finish()
    }
}
