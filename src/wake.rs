use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::handle::{AsyncCb, AsyncId, Flags, HandleKind};
use crate::request::{Request, RequestKind};
use crate::sys;
use crate::token::Token;

pub(crate) struct AsyncState {
    pub(crate) cb: Option<AsyncCb>,
    pub(crate) sent: Arc<AtomicBool>,
    /// Token of the handle's persistent wake-up request.
    pub(crate) wakeup_req: Token,
}

/// Cross-thread wake-up sender for an async handle.
///
/// This is the only part of the API that may be used from a thread other
/// than the loop's. Senders are cheap to clone; every send after the
/// previous wake-up was observed produces at least one callback
/// invocation, sends in between coalesce.
///
/// The user must stop calling [`send`] before closing the handle; a send
/// racing the close is not detected.
///
/// [`send`]: AsyncWaker::send
#[derive(Clone)]
pub struct AsyncWaker {
    id: AsyncId,
    sent: Arc<AtomicBool>,
    waker: Arc<sys::Waker>,
}

impl AsyncWaker {
    /// The id of the async handle this waker pokes, e.g. to close it from
    /// the loop thread.
    pub fn id(&self) -> AsyncId {
        self.id
    }

    /// Wakes the loop and schedules the async callback. Callable from any
    /// thread.
    pub fn send(&self) -> Result<()> {
        // Exchange-and-set; only the 0 -> 1 transition posts a wake-up,
        // everything else coalesces onto the already-posted one.
        if !self.sent.swap(true, Ordering::AcqRel) {
            self.waker.wake().map_err(Error::from)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AsyncWaker {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("AsyncWaker").field("id", &self.id).finish()
    }
}

impl EventLoop {
    /// Creates an async handle with its persistent wake-up request and
    /// returns the cross-thread sender.
    pub fn async_init<F>(&mut self, cb: F) -> AsyncWaker
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let sent = Arc::new(AtomicBool::new(false));

        // Reserve the request slot first so the handle can point at it.
        let req_token = Token(self.requests.insert(Request::new(RequestKind::Wakeup {
            handle: Token(0),
        })));

        let token = self.init_handle(HandleKind::Async(AsyncState {
            cb: Some(Box::new(cb)),
            sent: Arc::clone(&sent),
            wakeup_req: req_token,
        }));

        if let Some(req) = self.requests.get_mut(req_token.0) {
            req.kind = RequestKind::Wakeup { handle: token };
        }

        AsyncWaker {
            id: AsyncId(token),
            sent,
            waker: Arc::clone(&self.waker),
        }
    }

    /*
     *
     * ===== Loop-internal =====
     *
     */

    /// The wake primitive fired: queue the wake-up request of every async
    /// handle whose sent-flag is raised.
    pub(crate) fn process_wake(&mut self) {
        self.waker.ack();

        let mut woken: Vec<Token> = Vec::new();
        for (_, handle) in self.handles.iter() {
            if let HandleKind::Async(state) = &handle.kind {
                if state.sent.load(Ordering::Acquire) {
                    woken.push(state.wakeup_req);
                }
            }
        }

        trace!("wake; async handles signalled={}", woken.len());
        for req in woken {
            self.pending_push(req);
        }
    }

    /// Dispatch of a dequeued wake-up request. The sent-flag is cleared
    /// before the callback runs, so a send that races the callback posts a
    /// fresh wake-up.
    pub(crate) fn async_return(&mut self, req_token: Token) {
        let handle_token = match self.requests.get(req_token.0) {
            Some(req) => req.handle(),
            None => return,
        };

        let (closing, mut cb) = match self.handles.get_mut(handle_token.0) {
            Some(handle) => {
                let closing = handle.flags.contains(Flags::CLOSING);
                match &mut handle.kind {
                    HandleKind::Async(state) => {
                        state.sent.store(false, Ordering::Release);
                        (closing, if closing { None } else { state.cb.take() })
                    }
                    _ => return,
                }
            }
            None => return,
        };

        if closing {
            self.want_endgame(handle_token);
            return;
        }

        if let Some(cb) = cb.as_mut() {
            cb(self);
        }

        if let Some(HandleKind::Async(state)) =
            self.handles.get_mut(handle_token.0).map(|h| &mut h.kind)
        {
            if state.cb.is_none() {
                state.cb = cb;
            }
        }
    }

    /// Close teardown: the endgame must wait until an already-posted
    /// wake-up has been observed.
    pub(crate) fn async_close_teardown(&mut self, token: Token) {
        let sent = match self.handles.get(token.0).map(|h| &h.kind) {
            Some(HandleKind::Async(state)) => state.sent.load(Ordering::Acquire),
            _ => return,
        };
        if !sent {
            self.want_endgame(token);
        }
    }

    pub(crate) fn async_endgame(&mut self, token: Token) {
        let sent = match self.handles.get(token.0).map(|h| &h.kind) {
            Some(HandleKind::Async(state)) => state.sent.load(Ordering::Acquire),
            _ => return,
        };
        if !sent {
            self.finish_close(token);
        }
    }
}
