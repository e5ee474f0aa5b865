use std::fmt;

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::net::tcp::TcpState;
use crate::net::udp::UdpState;
use crate::timer::TimerState;
use crate::token::Token;
use crate::wake::AsyncState;
use crate::watcher::WatcherState;

/*
 *
 * ===== Callback signatures =====
 *
 */

// Handle ids are `Copy`, so callbacks receive only the operation payload;
// a closure that needs its own id captures it at registration time.

pub type CloseCb = Box<dyn FnOnce(&mut EventLoop)>;
pub type TimerCb = Box<dyn FnMut(&mut EventLoop)>;
pub type WatcherCb = Box<dyn FnMut(&mut EventLoop)>;
pub type AsyncCb = Box<dyn FnMut(&mut EventLoop)>;

/// Invoked once per accepted connection while listening; an `Err` status
/// reports a failed accept without stopping the listener.
pub type ConnectionCb = Box<dyn FnMut(&mut EventLoop, Result<()>)>;
pub type ConnectCb = Box<dyn FnOnce(&mut EventLoop, Result<()>)>;
pub type WriteCb = Box<dyn FnOnce(&mut EventLoop, Result<()>)>;
pub type ShutdownCb = Box<dyn FnOnce(&mut EventLoop, Result<()>)>;
pub type SendCb = Box<dyn FnOnce(&mut EventLoop, Result<()>)>;

/// Supplies a read buffer of (at least the suggested) capacity. The
/// storage is owned by the caller of the read APIs: it is handed back
/// through the read callback, used or not.
pub type AllocCb = Box<dyn FnMut(&mut EventLoop, usize) -> Vec<u8>>;

/// Stream read callback. `Ok(n)` delivers `n` bytes at the front of the
/// buffer; `Ok(0)` means the buffer was not used (not an error, not end of
/// stream); `Err` with [`ErrorCode::Eof`] is end of stream.
///
/// [`ErrorCode::Eof`]: crate::ErrorCode::Eof
pub type ReadCb = Box<dyn FnMut(&mut EventLoop, Result<usize>, Vec<u8>)>;

/// Datagram receive callback; the address is the datagram's source.
/// `Ok(0)` with no address means the buffer was returned unused.
pub type RecvCb =
    Box<dyn FnMut(&mut EventLoop, Result<usize>, Vec<u8>, Option<std::net::SocketAddr>)>;

/*
 *
 * ===== Handle flags =====
 *
 */

/// Handle state bitset. A state is a set of these, not an enum; see the
/// per-operation requirements in `net::tcp` and `net::udp`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Flags(u16);

impl Flags {
    pub(crate) const CLOSING: Flags = Flags(1 << 0);
    pub(crate) const CLOSED: Flags = Flags(1 << 1);
    pub(crate) const BOUND: Flags = Flags(1 << 2);
    pub(crate) const LISTENING: Flags = Flags(1 << 3);
    pub(crate) const CONNECTION: Flags = Flags(1 << 4);
    pub(crate) const CONNECTED: Flags = Flags(1 << 5);
    pub(crate) const READING: Flags = Flags(1 << 6);
    pub(crate) const ACTIVE: Flags = Flags(1 << 7);
    pub(crate) const EOF: Flags = Flags(1 << 8);
    pub(crate) const SHUTTING: Flags = Flags(1 << 9);
    pub(crate) const SHUT: Flags = Flags(1 << 10);
    pub(crate) const ENDGAME_QUEUED: Flags = Flags(1 << 11);
    pub(crate) const BIND_ERROR: Flags = Flags(1 << 12);

    pub(crate) const fn empty() -> Flags {
        Flags(0)
    }

    pub(crate) fn contains(self, other: Flags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub(crate) fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 13] = [
            (Flags::CLOSING, "CLOSING"),
            (Flags::CLOSED, "CLOSED"),
            (Flags::BOUND, "BOUND"),
            (Flags::LISTENING, "LISTENING"),
            (Flags::CONNECTION, "CONNECTION"),
            (Flags::CONNECTED, "CONNECTED"),
            (Flags::READING, "READING"),
            (Flags::ACTIVE, "ACTIVE"),
            (Flags::EOF, "EOF"),
            (Flags::SHUTTING, "SHUTTING"),
            (Flags::SHUT, "SHUT"),
            (Flags::ENDGAME_QUEUED, "ENDGAME_QUEUED"),
            (Flags::BIND_ERROR, "BIND_ERROR"),
        ];

        let mut one = false;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

/*
 *
 * ===== Handles =====
 *
 */

macro_rules! handle_id {
    ($(#[$doc: meta])* $name: ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) Token);

        impl From<$name> for AnyHandle {
            fn from(id: $name) -> AnyHandle {
                AnyHandle::$name(id)
            }
        }
    };
}

handle_id!(
    /// Id of a TCP stream or listener handle.
    TcpId
);
handle_id!(
    /// Id of a UDP socket handle.
    UdpId
);
handle_id!(
    /// Id of a timer handle.
    TimerId
);
handle_id!(
    /// Id of a prepare watcher, invoked just before the loop blocks.
    PrepareId
);
handle_id!(
    /// Id of a check watcher, invoked just after the loop unblocks.
    CheckId
);
handle_id!(
    /// Id of an idle watcher, invoked while the loop would otherwise block.
    IdleId
);
handle_id!(
    /// Id of an async (cross-thread wake-up) handle.
    AsyncId
);

/// Any handle id; the argument of the type-agnostic operations
/// ([`EventLoop::close`], [`EventLoop::is_active`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AnyHandle {
    TcpId(TcpId),
    UdpId(UdpId),
    TimerId(TimerId),
    PrepareId(PrepareId),
    CheckId(CheckId),
    IdleId(IdleId),
    AsyncId(AsyncId),
}

impl AnyHandle {
    pub(crate) fn token(self) -> Token {
        match self {
            AnyHandle::TcpId(id) => id.0,
            AnyHandle::UdpId(id) => id.0,
            AnyHandle::TimerId(id) => id.0,
            AnyHandle::PrepareId(id) => id.0,
            AnyHandle::CheckId(id) => id.0,
            AnyHandle::IdleId(id) => id.0,
            AnyHandle::AsyncId(id) => id.0,
        }
    }
}

/// Identifies an in-flight request (connect, write, shutdown, send).
///
/// There is no cancel API; a request is cancelled by closing its handle,
/// in which case its callback reports `ECONNABORTED` before the handle's
/// close callback runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) Token);

/// A handle slot in the loop arena: the common header plus the per-type
/// payload.
pub(crate) struct Handle {
    pub(crate) flags: Flags,
    pub(crate) close_cb: Option<CloseCb>,
    /// Requests submitted on this handle and not yet returned to the user.
    /// The close callback may only run once this reaches zero.
    pub(crate) reqs_pending: u32,
    pub(crate) kind: HandleKind,
}

impl Handle {
    pub(crate) fn new(kind: HandleKind) -> Handle {
        Handle {
            flags: Flags::empty(),
            close_cb: None,
            reqs_pending: 0,
            kind,
        }
    }
}

pub(crate) enum HandleKind {
    Tcp(TcpState),
    Udp(UdpState),
    Timer(TimerState),
    Watcher(WatcherState),
    Async(AsyncState),
}

/// Payload-free type tag, used where dispatching on [`HandleKind`] would
/// hold a borrow across the dispatch target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Tag {
    Tcp,
    Udp,
    Timer,
    Watcher,
    Async,
}

impl HandleKind {
    pub(crate) fn tag(&self) -> Tag {
        match self {
            HandleKind::Tcp(_) => Tag::Tcp,
            HandleKind::Udp(_) => Tag::Udp,
            HandleKind::Timer(_) => Tag::Timer,
            HandleKind::Watcher(_) => Tag::Watcher,
            HandleKind::Async(_) => Tag::Async,
        }
    }
}
