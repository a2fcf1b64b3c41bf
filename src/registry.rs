use std::os::fd::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::debug;

use crate::callback::boxed;
use crate::table::Watch;
use crate::timer::interval_from_secs;
use crate::{Backend, CallbackResult, Direction, Error, Event, Flag, Reactor, Result, TimerId};

/// The first argument of [`Reactor::add`] and [`Reactor::del`]; its meaning
/// depends on the [`Flag`].
///
/// | flag                 | `add`                          | `del`        |
/// |----------------------|--------------------------------|--------------|
/// | `Read`, `Write`      | descriptor                     | descriptor   |
/// | `Signal`             | signal (or its number)         | same         |
/// | `Timer`, `TimerOnce` | interval (or whole seconds)    | timer id     |
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Key {
    /// A descriptor, signal number, whole seconds or raw timer id.
    Raw(i32),
    Signal(Signal),
    /// Fractional seconds.
    Seconds(f64),
    Interval(Duration),
    Timer(TimerId),
}

impl From<RawFd> for Key {
    fn from(value: RawFd) -> Self {
        Key::Raw(value)
    }
}

impl From<Signal> for Key {
    fn from(value: Signal) -> Self {
        Key::Signal(value)
    }
}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Key::Seconds(value)
    }
}

impl From<Duration> for Key {
    fn from(value: Duration) -> Self {
        Key::Interval(value)
    }
}

impl From<TimerId> for Key {
    fn from(value: TimerId) -> Self {
        Key::Timer(value)
    }
}

impl Key {
    fn mismatch(self, flag: Flag) -> Error {
        Error::KeyMismatch { key: self, flag }
    }

    fn fd(self, flag: Flag) -> Result<RawFd> {
        match self {
            Key::Raw(fd) => Ok(fd),
            other => Err(other.mismatch(flag)),
        }
    }

    fn signal(self, flag: Flag) -> Result<Signal> {
        match self {
            Key::Signal(signal) => Ok(signal),
            Key::Raw(signo) => Signal::try_from(signo).map_err(|_| Error::InvalidSignal(signo)),
            other => Err(other.mismatch(flag)),
        }
    }

    fn interval(self, flag: Flag) -> Result<Duration> {
        match self {
            Key::Interval(interval) => Ok(interval),
            Key::Seconds(secs) => interval_from_secs(secs),
            Key::Raw(secs) => interval_from_secs(f64::from(secs)),
            other => Err(other.mismatch(flag)),
        }
    }

    fn timer_id(self) -> Option<TimerId> {
        match self {
            Key::Timer(id) => Some(id),
            Key::Raw(raw) => u64::try_from(raw).ok().map(TimerId::from_raw),
            _ => None,
        }
    }
}

/// What a successful [`Reactor::add`] registered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Added {
    Watch,
    Timer(TimerId),
}

impl Added {
    pub const fn timer_id(self) -> Option<TimerId> {
        match self {
            Added::Timer(id) => Some(id),
            Added::Watch => None,
        }
    }
}

impl<B: Backend> Reactor<B> {
    /// Registers `callback` for the condition selected by `flag`.
    ///
    /// `args` is bound to the registration and passed to every invocation.
    /// Timer registrations return the id needed to cancel them.
    ///
    /// ```no_run
    /// # use evreactor::{Flag, Reactor};
    /// # fn main() -> evreactor::Result<()> {
    /// let mut reactor = Reactor::new()?;
    /// let id = reactor
    ///     .add(0.5, Flag::Timer, |_, _, ticks: &mut u32| {
    ///         *ticks += 1;
    ///         Ok(())
    ///     }, 0u32)?
    ///     .timer_id();
    /// # let _ = id;
    /// reactor.run_forever()
    /// # }
    /// ```
    pub fn add<K, F, A>(&mut self, key: K, flag: Flag, mut callback: F, mut args: A) -> Result<Added>
    where
        K: Into<Key>,
        F: FnMut(&mut Reactor<B>, Event, &mut A) -> CallbackResult + 'static,
        A: 'static,
    {
        let key = key.into();
        match (flag.direction(), flag.timer_kind()) {
            (Some(direction), _) => {
                let fd = key.fd(flag)?;
                self.add_io_watch(fd, direction, move |reactor, event| {
                    callback(reactor, event, &mut args)
                })?;
                Ok(Added::Watch)
            }
            (_, Some(kind)) => {
                let interval = key.interval(flag)?;
                self.add_timer(interval, kind, callback, args).map(Added::Timer)
            }
            (None, None) => {
                let signal = key.signal(flag)?;
                self.add_signal_watch(signal, move |reactor, event| {
                    callback(reactor, event, &mut args)
                })?;
                Ok(Added::Watch)
            }
        }
    }

    /// Removes the registration selected by `key` and `flag`.
    ///
    /// Never fails: unknown keys, and keys that cannot name a registration
    /// of that flag, are ignored.
    pub fn del<K: Into<Key>>(&mut self, key: K, flag: Flag) {
        let key = key.into();
        match flag {
            Flag::Read | Flag::Write => {
                if let (Ok(fd), Some(direction)) = (key.fd(flag), flag.direction()) {
                    self.remove_io_watch(fd, direction);
                }
            }
            Flag::Signal => {
                if let Ok(signal) = key.signal(flag) {
                    self.remove_signal_watch(signal);
                }
            }
            Flag::Timer | Flag::TimerOnce => {
                if let Some(id) = key.timer_id() {
                    self.remove_timer(id);
                }
            }
        }
    }

    /// Watches `fd` for readiness in `direction`, calling `callback` every
    /// time it is ready until the watch is removed.
    ///
    /// An existing watch for the same `(fd, direction)` is cancelled first. If
    /// the new watch cannot be created, the key is left unregistered.
    pub fn add_io_watch<F>(&mut self, fd: RawFd, direction: Direction, callback: F) -> Result<()>
    where
        F: FnMut(&mut Reactor<B>, Event) -> CallbackResult + 'static,
    {
        if self.tables.io_token(fd, direction).is_some() {
            debug!(fd, ?direction, "replacing existing watch");
            self.remove_io_watch(fd, direction);
        }

        let token = self.backend.watch_fd(fd, direction)?;
        self.tables
            .insert_io(fd, direction, Watch::new(token, boxed(callback)));
        debug!(fd, ?direction, ?token, "watch added");

        Ok(())
    }

    pub fn remove_io_watch(&mut self, fd: RawFd, direction: Direction) {
        if let Some(watch) = self.tables.remove_io(fd, direction) {
            self.release(watch.token);
            debug!(fd, ?direction, "watch removed");
        }
    }

    /// Calls `callback` on every delivery of `signal` until the watch is
    /// removed. An existing watch for `signal` is cancelled first.
    pub fn add_signal_watch<F>(&mut self, signal: Signal, callback: F) -> Result<()>
    where
        F: FnMut(&mut Reactor<B>, Event) -> CallbackResult + 'static,
    {
        if self.tables.signal_token(signal).is_some() {
            debug!(?signal, "replacing existing signal watch");
            self.remove_signal_watch(signal);
        }

        let token = self.backend.watch_signal(signal)?;
        self.tables
            .insert_signal(signal, Watch::new(token, boxed(callback)));
        debug!(?signal, ?token, "signal watch added");

        Ok(())
    }

    pub fn remove_signal_watch(&mut self, signal: Signal) {
        if let Some(watch) = self.tables.remove_signal(signal) {
            self.release(watch.token);
            debug!(?signal, "signal watch removed");
        }
    }

    pub fn is_watching(&self, fd: RawFd, direction: Direction) -> bool {
        self.tables.io_token(fd, direction).is_some()
    }

    pub fn is_watching_signal(&self, signal: Signal) -> bool {
        self.tables.signal_token(signal).is_some()
    }

    /// Number of active descriptor watches, counting each direction.
    pub fn io_watch_count(&self) -> usize {
        self.tables.io_len()
    }

    /// Number of distinct descriptors with at least one watch.
    pub fn watched_fd_count(&self) -> usize {
        self.tables.fd_len()
    }

    pub fn signal_watch_count(&self) -> usize {
        self.tables.signal_len()
    }
}
