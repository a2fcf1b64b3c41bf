//! Repeating and one-shot timers on top of the backend's one-shot timeouts.
//!
//! A repeating timer is re-armed with its interval right before its callback
//! runs, so a slow callback does not shift the next expiry. A one-shot timer
//! is removed as soon as its callback returns.

use std::fmt;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::callback::{self, boxed, BoxCallback};
use crate::{Backend, CallbackResult, Error, Event, Reactor, Result, Token};

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Identifies a live timer. Returned by [`Reactor::add_timer`] and needed to
/// cancel it.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl From<Token> for TimerId {
    fn from(token: Token) -> Self {
        Self(token.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum TimerKind {
    /// Fires every interval until removed.
    Repeating,
    /// Fires once, then unregisters itself.
    OneShot,
}

pub(crate) struct TimerRegistration<B: Backend> {
    pub(crate) token: Token,
    pub(crate) callback: Option<BoxCallback<B>>,
    pub(crate) kind: TimerKind,
    pub(crate) interval: Duration,
}

/// Converts a (possibly fractional) number of seconds into a timer interval
/// with microsecond resolution.
pub fn interval_from_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::InvalidInterval(secs));
    }
    let micros = (secs * MICROS_PER_SECOND).round();
    if micros >= u64::MAX as f64 {
        return Err(Error::InvalidInterval(secs));
    }
    Ok(Duration::from_micros(micros as u64))
}

impl<B: Backend> Reactor<B> {
    /// Schedules `callback` to run after `interval`, and every `interval`
    /// after that for [`TimerKind::Repeating`].
    ///
    /// `args` is bound to the timer and handed to every invocation.
    pub fn add_timer<F, A>(
        &mut self,
        interval: Duration,
        kind: TimerKind,
        mut callback: F,
        mut args: A,
    ) -> Result<TimerId>
    where
        F: FnMut(&mut Reactor<B>, Event, &mut A) -> CallbackResult + 'static,
        A: 'static,
    {
        let token = self.backend.create_timeout()?;
        if let Err(e) = self.backend.arm(token, interval) {
            self.release(token);
            return Err(e.into());
        }

        let id = TimerId::from(token);
        let callback = boxed(move |reactor, event| callback(reactor, event, &mut args));
        self.tables.insert_timer(
            id,
            TimerRegistration {
                token,
                callback: Some(callback),
                kind,
                interval,
            },
        );
        debug!(%id, ?kind, ?interval, "timer added");

        Ok(id)
    }

    /// Cancels a timer. Unknown or already fired ids are ignored.
    pub fn remove_timer(&mut self, id: TimerId) {
        if let Some(timer) = self.tables.remove_timer(id) {
            self.release(timer.token);
            debug!(%id, "timer removed");
        }
    }

    /// Cancels every timer, leaving descriptor and signal watches untouched.
    pub fn clear_all_timers(&mut self) {
        let timers = self.tables.take_timers();
        let count = timers.len();
        for timer in timers {
            self.release(timer.token);
        }
        debug!(count, "all timers cleared");
    }

    pub fn timer_count(&self) -> usize {
        self.tables.timer_len()
    }

    pub fn contains_timer(&self, id: TimerId) -> bool {
        self.tables.contains_timer(id)
    }

    /// Runs one expiry of timer `id`.
    pub(crate) fn fire_timer(&mut self, id: TimerId) -> CallbackResult {
        let Some(timer) = self.tables.timer_mut(id) else {
            return Ok(());
        };
        let (token, kind, interval) = (timer.token, timer.kind, timer.interval);
        let Some(mut callback) = timer.callback.take() else {
            return Ok(());
        };

        let mut rearmed = false;
        if kind == TimerKind::Repeating {
            match self.backend.arm(token, interval) {
                Ok(()) => rearmed = true,
                Err(e) => warn!(%id, error = %e, "failed to rearm timer, dropping it after this run"),
            }
        }

        trace!(%id, ?kind, "timer fired");
        callback::invoke(&mut callback, self, Event::Timer(id))?;

        if !rearmed {
            self.remove_timer(id);
        } else if let Some(timer) = self.tables.timer_mut(id) {
            timer.callback = Some(callback);
        }

        Ok(())
    }
}
