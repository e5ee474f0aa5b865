use std::net::SocketAddr;

use crate::error::Error;
use crate::handle::{ConnectCb, SendCb, ShutdownCb, WriteCb};
use crate::token::Token;

/// A request slot in the loop arena.
///
/// A request is borrowed by the loop from submission until its user
/// callback has run; `pending` is the loan marker. It is cleared before
/// the callback is invoked and guards against double-queueing on the
/// pending list.
pub(crate) struct Request {
    pub(crate) pending: bool,
    pub(crate) kind: RequestKind,
}

impl Request {
    pub(crate) fn new(kind: RequestKind) -> Request {
        Request {
            pending: false,
            kind,
        }
    }

    /// The handle this request operates on.
    pub(crate) fn handle(&self) -> Token {
        match &self.kind {
            RequestKind::Connect { handle, .. } => *handle,
            RequestKind::Write { handle, .. } => *handle,
            RequestKind::Shutdown { handle, .. } => *handle,
            RequestKind::Send { handle, .. } => *handle,
            RequestKind::Wakeup { handle } => *handle,
        }
    }

    pub(crate) fn set_error(&mut self, err: Error) {
        match &mut self.kind {
            RequestKind::Connect { error, .. } => *error = Some(err),
            RequestKind::Write { error, .. } => *error = Some(err),
            RequestKind::Shutdown { error, .. } => *error = Some(err),
            RequestKind::Send { error, .. } => *error = Some(err),
            RequestKind::Wakeup { .. } => {}
        }
    }
}

pub(crate) enum RequestKind {
    Connect {
        handle: Token,
        cb: Option<ConnectCb>,
        error: Option<Error>,
    },
    Write {
        handle: Token,
        /// Bytes not accepted by the immediate send, concatenated.
        data: Vec<u8>,
        /// Progress into `data`.
        written: usize,
        /// Bytes charged against the handle's `write_queue_size`; zero when
        /// the immediate send took everything.
        queued_bytes: usize,
        cb: Option<WriteCb>,
        error: Option<Error>,
    },
    Shutdown {
        handle: Token,
        cb: Option<ShutdownCb>,
        error: Option<Error>,
    },
    Send {
        handle: Token,
        data: Vec<u8>,
        addr: SocketAddr,
        cb: Option<SendCb>,
        error: Option<Error>,
    },
    /// The persistent wake-up request of an async handle; never freed by
    /// dispatch, only by the handle's endgame.
    Wakeup { handle: Token },
}
