use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::event_loop::EventLoop;
use crate::handle::{CheckId, Flags, HandleKind, IdleId, PrepareId, WatcherCb};
use crate::token::Token;

/// When in a loop iteration a watcher family is invoked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Family {
    /// Just before the loop blocks in the poll.
    Prepare = 0,
    /// Just after the loop returns from the poll.
    Check = 1,
    /// While the loop would otherwise block.
    Idle = 2,
}

pub(crate) struct WatcherState {
    pub(crate) family: Family,
    pub(crate) cb: Option<WatcherCb>,
}

// The three families are the same machinery invoked at different points
// of the iteration, so the operations are generated per id type.
macro_rules! watcher_ops {
    ($family: expr, $id: ident, $init: ident, $start: ident, $stop: ident) => {
        pub fn $init(&mut self) -> $id {
            $id(self.init_handle(HandleKind::Watcher(WatcherState {
                family: $family,
                cb: None,
            })))
        }

        /// Starts the watcher. Starting an already-active watcher is a
        /// no-op; the original callback stays in place.
        pub fn $start<F>(&mut self, id: $id, cb: F) -> Result<()>
        where
            F: FnMut(&mut EventLoop) + 'static,
        {
            self.watcher_start(id.0, Box::new(cb))
        }

        /// Stops the watcher; its callback will no longer be invoked.
        /// Safe to call on the currently-iterating watcher, and a no-op if
        /// the watcher is not active.
        pub fn $stop(&mut self, id: $id) -> Result<()> {
            self.watcher_stop(id.0)
        }
    };
}

impl EventLoop {
    watcher_ops!(Family::Prepare, PrepareId, prepare_init, prepare_start, prepare_stop);
    watcher_ops!(Family::Check, CheckId, check_init, check_start, check_stop);
    watcher_ops!(Family::Idle, IdleId, idle_init, idle_start, idle_stop);

    fn watcher_start(&mut self, token: Token, cb: WatcherCb) -> Result<()> {
        let (flags, state) = self.watcher_mut(token)?;
        if flags.contains(Flags::ACTIVE) {
            return Ok(());
        }
        let family = state.family;
        state.cb = Some(cb);
        self.handles.get_mut(token.0).unwrap().flags.insert(Flags::ACTIVE);
        self.watchers[family as usize].push(token);
        Ok(())
    }

    fn watcher_stop(&mut self, token: Token) -> Result<()> {
        let (flags, state) = self.watcher_mut(token)?;
        if !flags.contains(Flags::ACTIVE) {
            return Ok(());
        }
        let family = state.family;
        state.cb = None;
        self.handles.get_mut(token.0).unwrap().flags.remove(Flags::ACTIVE);
        self.watchers[family as usize].retain(|t| *t != token);
        Ok(())
    }

    /// `watcher_stop` minus the not-a-watcher checks; used by `close`.
    pub(crate) fn watcher_teardown(&mut self, token: Token) {
        if let Some(HandleKind::Watcher(state)) = self.handles.get_mut(token.0).map(|h| &mut h.kind)
        {
            let family = state.family;
            state.cb = None;
            self.handles.get_mut(token.0).unwrap().flags.remove(Flags::ACTIVE);
            self.watchers[family as usize].retain(|t| *t != token);
        }
    }

    /// One pass over a watcher family. Iteration goes over a snapshot and
    /// re-checks liveness per entry, so callbacks may stop (or close) any
    /// watcher, including the one currently running.
    pub(crate) fn invoke_watchers(&mut self, family: Family) {
        let snapshot: Vec<Token> = self.watchers[family as usize].clone();
        trace!("invoking {:?} watchers; count={}", family, snapshot.len());

        for token in snapshot {
            let mut cb = match self.handles.get_mut(token.0) {
                Some(handle)
                    if handle.flags.contains(Flags::ACTIVE)
                        && !handle.flags.contains(Flags::CLOSING) =>
                {
                    match &mut handle.kind {
                        HandleKind::Watcher(state) => match state.cb.take() {
                            Some(cb) => cb,
                            None => continue,
                        },
                        _ => continue,
                    }
                }
                _ => continue,
            };

            cb(self);

            // Restore unless the callback stopped the watcher or installed
            // a new callback by stop + start.
            if let Some(handle) = self.handles.get_mut(token.0) {
                if handle.flags.contains(Flags::ACTIVE) {
                    if let HandleKind::Watcher(state) = &mut handle.kind {
                        if state.cb.is_none() {
                            state.cb = Some(cb);
                        }
                    }
                }
            }
        }
    }

    fn watcher_mut(&mut self, token: Token) -> Result<(Flags, &mut WatcherState)> {
        match self.handles.get_mut(token.0) {
            Some(handle) if !handle.flags.contains(Flags::CLOSING) => {
                let flags = handle.flags;
                match &mut handle.kind {
                    HandleKind::Watcher(state) => Ok((flags, state)),
                    _ => Err(Error::new(ErrorCode::Invalid)),
                }
            }
            _ => Err(Error::new(ErrorCode::Invalid)),
        }
    }
}
