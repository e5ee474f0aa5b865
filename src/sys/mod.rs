//! OS plumbing behind the portable core.
//!
//! The seam is small on purpose: a readiness `Selector`, a cross-thread
//! `Waker`, raw socket operations, and the `Event`/`Events` accessors. A
//! completion-port backend implements the same seam by mapping dequeued
//! completion packets onto pending-request insertions instead of readiness
//! events; the portable core does not change.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{event, socket, Event, Events, Selector, Socket, Waker};
