use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::event_loop::EventLoop;
use crate::handle::{Flags, HandleKind, TimerCb, TimerId};
use crate::token::Token;

pub(crate) struct TimerState {
    pub(crate) cb: Option<TimerCb>,
    /// Whether a callback was ever bound. Distinct from `cb`, which is
    /// taken out of its slot while it runs; `timer_again` from inside the
    /// timer's own callback must still see a started timer.
    pub(crate) started: bool,
    pub(crate) due: u64,
    pub(crate) repeat: u64,
    /// Key under which the timer currently sits in the loop's ordered set;
    /// `Some` exactly while the `ACTIVE` flag is set.
    pub(crate) key: Option<(u64, u64)>,
}

impl EventLoop {
    pub fn timer_init(&mut self) -> TimerId {
        TimerId(self.init_handle(HandleKind::Timer(TimerState {
            cb: None,
            started: false,
            due: 0,
            repeat: 0,
            key: None,
        })))
    }

    /// Schedules the timer to fire once after `timeout` ms, then every
    /// `repeat` ms if `repeat` is non-zero. Starting an active timer
    /// reschedules it.
    pub fn timer_start<F>(&mut self, id: TimerId, cb: F, timeout: u64, repeat: u64) -> Result<()>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let now = self.now_ms;
        let seq = self.timer_seq;
        self.timer_seq += 1;

        let state = self.timer_state_mut(id.0)?;
        let old_key = state.key.take();
        state.cb = Some(Box::new(cb));
        state.started = true;
        state.due = now + timeout;
        state.repeat = repeat;
        let key = (state.due, seq);
        state.key = Some(key);

        if let Some(old) = old_key {
            self.timers.remove(&old);
        }
        self.timer_insert(key, id.0);
        self.handles.get_mut(id.0 .0).unwrap().flags.insert(Flags::ACTIVE);
        Ok(())
    }

    /// Stops the timer. Stopping an inactive timer is a no-op.
    pub fn timer_stop(&mut self, id: TimerId) -> Result<()> {
        self.timer_state_mut(id.0)?;
        self.timer_teardown(id.0);
        Ok(())
    }

    /// Stops the timer and, if it is repeating, restarts it using the
    /// repeat value as the timeout. Fails if the timer has never been
    /// started.
    pub fn timer_again(&mut self, id: TimerId) -> Result<()> {
        let now = self.now_ms;
        let seq = self.timer_seq;

        let state = self.timer_state_mut(id.0)?;
        if !state.started {
            return Err(Error::new(ErrorCode::Invalid));
        }

        let old_key = state.key.take();
        let repeat = state.repeat;
        let key = if repeat != 0 {
            state.due = now + repeat;
            let key = (state.due, seq);
            state.key = Some(key);
            Some(key)
        } else {
            None
        };

        if let Some(old) = old_key {
            self.timers.remove(&old);
        }
        let handle = self.handles.get_mut(id.0 .0).unwrap();
        match key {
            Some(key) => {
                handle.flags.insert(Flags::ACTIVE);
                self.timer_seq += 1;
                self.timer_insert(key, id.0);
            }
            None => handle.flags.remove(Flags::ACTIVE),
        }
        Ok(())
    }

    /// Sets the repeat interval. Does not reschedule a live timer: if the
    /// timer is waiting on its previous interval, that interval completes
    /// first.
    pub fn timer_set_repeat(&mut self, id: TimerId, repeat: u64) -> Result<()> {
        self.timer_state_mut(id.0)?.repeat = repeat;
        Ok(())
    }

    pub fn timer_get_repeat(&self, id: TimerId) -> Result<u64> {
        match self.handles.get(id.0 .0).map(|h| &h.kind) {
            Some(HandleKind::Timer(state)) => Ok(state.repeat),
            _ => Err(Error::new(ErrorCode::Invalid)),
        }
    }

    /*
     *
     * ===== Loop-internal =====
     *
     */

    /// Fires every timer due at the cached time. The minimum is
    /// re-extracted after each callback, so callbacks may start and stop
    /// timers freely.
    pub(crate) fn process_timers(&mut self) {
        loop {
            let (&key, &token) = match self.timers.first_key_value() {
                Some(entry) => entry,
                None => break,
            };
            if key.0 > self.now_ms {
                break;
            }
            self.timers.remove(&key);

            let state = match self.handles.get_mut(token.0).map(|h| &mut h.kind) {
                Some(HandleKind::Timer(state)) => state,
                _ => continue,
            };

            let mut cb = match state.cb.take() {
                Some(cb) => cb,
                None => continue,
            };

            if state.repeat != 0 {
                // Reschedule before the callback so the callback observes
                // an active timer; the sequence number is kept, making the
                // fire order of equal-due repeating timers stable.
                let due = std::cmp::max(key.0 + state.repeat, self.now_ms);
                state.due = due;
                let new_key = (due, key.1);
                state.key = Some(new_key);
                self.timer_insert(new_key, token);
            } else {
                state.key = None;
                self.handles
                    .get_mut(token.0)
                    .unwrap()
                    .flags
                    .remove(Flags::ACTIVE);
            }

            trace!("timer fired; token={}", token.0);
            cb(self);

            // Put the callback back unless the callback itself stopped or
            // restarted the timer.
            if let Some(HandleKind::Timer(state)) = self.handles.get_mut(token.0).map(|h| &mut h.kind)
            {
                if state.cb.is_none() {
                    state.cb = Some(cb);
                }
            }
        }
    }

    /// Removes the timer from the ordered set; shared by `timer_stop` and
    /// `close`.
    pub(crate) fn timer_teardown(&mut self, token: Token) {
        if let Some(HandleKind::Timer(state)) = self.handles.get_mut(token.0).map(|h| &mut h.kind) {
            if let Some(key) = state.key.take() {
                self.timers.remove(&key);
                self.handles
                    .get_mut(token.0)
                    .unwrap()
                    .flags
                    .remove(Flags::ACTIVE);
            }
        }
    }

    fn timer_insert(&mut self, key: (u64, u64), token: Token) {
        if self.timers.insert(key, token).is_some() {
            // A colliding (due, seq) pair means the bookkeeping is broken.
            panic!("duplicate timer entry for key {:?}", key);
        }
    }

    fn timer_state_mut(&mut self, token: Token) -> Result<&mut TimerState> {
        match self.handles.get_mut(token.0).map(|h| (&h.flags, &mut h.kind)) {
            Some((flags, HandleKind::Timer(state))) if !flags.contains(Flags::CLOSING) => Ok(state),
            _ => Err(Error::new(ErrorCode::Invalid)),
        }
    }
}
