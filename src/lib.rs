//! Callback-driven non-blocking I/O event loop.
//!
//! `evio` runs a single-threaded loop that owns every resource registered
//! with it: TCP streams and listeners, UDP sockets, timers, loop-phase
//! watchers (prepare/check/idle) and cross-thread wake-ups. User code
//! holds copyable typed ids and supplies closures; the loop invokes them
//! as operations complete, one at a time, on the loop's thread.
//!
//! One loop iteration runs, in order: the cached-time update, due timers,
//! the pending-request/close drain (interleaved with idle watchers),
//! prepare watchers, the poll — the only point where the loop blocks —
//! and check watchers. [`EventLoop::run`] returns once the last handle
//! has been closed.
//!
//! Operations are request-shaped: a write, connect, shutdown or send is
//! submitted, makes progress as the OS allows, and finishes by invoking
//! its callback with a `Result`. Closing is two-phase: [`EventLoop::close`]
//! tears the resource down immediately, but the close callback — the last
//! signal about a handle — fires only after every in-flight request on it
//! has been returned (aborted requests report `ECONNABORTED` first).
//!
//! # Example
//!
//! A timer that fires twice, then lets the loop exit:
//!
//! ```
//! use evio::EventLoop;
//!
//! let mut lp = EventLoop::new().unwrap();
//! let timer = lp.timer_init();
//! let mut fired = 0;
//! lp.timer_start(timer, move |lp| {
//!     fired += 1;
//!     if fired == 2 {
//!         lp.timer_stop(timer).unwrap();
//!         lp.close(timer, |_| ()).unwrap();
//!     }
//! }, 10, 10).unwrap();
//! lp.run().unwrap();
//! ```

#![cfg(unix)]
#![deny(missing_debug_implementations)]

mod error;
mod event_loop;
mod handle;
mod interest;
mod net;
mod request;
mod sys;
mod timer;
mod token;
mod util;
mod wake;
mod watcher;

pub use error::{Error, ErrorCode, Result};
pub use event_loop::{Builder, EventLoop};
pub use handle::{
    AnyHandle, AsyncId, CheckId, IdleId, PrepareId, RequestId, TcpId, TimerId, UdpId,
};
pub use net::udp::{Membership, UdpFlags};
pub use token::Token;
pub use wake::AsyncWaker;
