//! Bookkeeping for active registrations.
//!
//! Three independent maps track descriptor watches, signal watches and timers.
//! A fourth map indexes every live native [`Token`] back to the [`Event`] its
//! registration produces, which is how the dispatch loop resolves what the
//! backend reports. Every entry owns its token: whoever removes an entry is
//! responsible for cancelling the token with the backend.

use std::os::fd::RawFd;

use nix::sys::signal::Signal;
use rustc_hash::FxHashMap;

use crate::callback::BoxCallback;
use crate::timer::TimerRegistration;
use crate::{Backend, Direction, Event, TimerId, Token};

pub(crate) struct Watch<B: Backend> {
    pub(crate) token: Token,
    /// `None` while the callback is running.
    pub(crate) callback: Option<BoxCallback<B>>,
}

impl<B: Backend> Watch<B> {
    pub(crate) fn new(token: Token, callback: BoxCallback<B>) -> Self {
        Self {
            token,
            callback: Some(callback),
        }
    }
}

struct FdBucket<B: Backend> {
    read: Option<Watch<B>>,
    write: Option<Watch<B>>,
}

impl<B: Backend> FdBucket<B> {
    fn slot(&mut self, direction: Direction) -> &mut Option<Watch<B>> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn get(&self, direction: Direction) -> Option<&Watch<B>> {
        match direction {
            Direction::Read => self.read.as_ref(),
            Direction::Write => self.write.as_ref(),
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn len(&self) -> usize {
        self.read.is_some() as usize + self.write.is_some() as usize
    }
}

pub(crate) struct Tables<B: Backend> {
    io: FxHashMap<RawFd, FdBucket<B>>,
    signals: FxHashMap<Signal, Watch<B>>,
    timers: FxHashMap<TimerId, TimerRegistration<B>>,
    index: FxHashMap<Token, Event>,
}

impl<B: Backend> Default for Tables<B> {
    fn default() -> Self {
        Self {
            io: Default::default(),
            signals: Default::default(),
            timers: Default::default(),
            index: Default::default(),
        }
    }
}

impl<B: Backend> Tables<B> {
    /// Resolves a token reported by the backend.
    pub(crate) fn resolve(&self, token: Token) -> Option<Event> {
        self.index.get(&token).copied()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    // ---- descriptor watches ----

    pub(crate) fn io_token(&self, fd: RawFd, direction: Direction) -> Option<Token> {
        self.io
            .get(&fd)
            .and_then(|bucket| bucket.get(direction))
            .map(|watch| watch.token)
    }

    /// Records a watch for `(fd, direction)`, handing back the entry it replaced.
    pub(crate) fn insert_io(
        &mut self,
        fd: RawFd,
        direction: Direction,
        watch: Watch<B>,
    ) -> Option<Watch<B>> {
        self.index.insert(watch.token, Event::io(fd, direction));
        let bucket = self.io.entry(fd).or_insert_with(|| FdBucket {
            read: None,
            write: None,
        });
        let previous = bucket.slot(direction).replace(watch);
        if let Some(previous) = &previous {
            self.index.remove(&previous.token);
        }
        previous
    }

    pub(crate) fn remove_io(&mut self, fd: RawFd, direction: Direction) -> Option<Watch<B>> {
        let bucket = self.io.get_mut(&fd)?;
        let removed = bucket.slot(direction).take();
        if bucket.is_empty() {
            self.io.remove(&fd);
        }
        if let Some(watch) = &removed {
            self.index.remove(&watch.token);
        }
        removed
    }

    pub(crate) fn io_len(&self) -> usize {
        self.io.values().map(FdBucket::len).sum()
    }

    pub(crate) fn fd_len(&self) -> usize {
        self.io.len()
    }

    // ---- signal watches ----

    pub(crate) fn signal_token(&self, signal: Signal) -> Option<Token> {
        self.signals.get(&signal).map(|watch| watch.token)
    }

    pub(crate) fn insert_signal(&mut self, signal: Signal, watch: Watch<B>) -> Option<Watch<B>> {
        self.index.insert(watch.token, Event::Signal(signal));
        let previous = self.signals.insert(signal, watch);
        if let Some(previous) = &previous {
            self.index.remove(&previous.token);
        }
        previous
    }

    pub(crate) fn remove_signal(&mut self, signal: Signal) -> Option<Watch<B>> {
        let removed = self.signals.remove(&signal)?;
        self.index.remove(&removed.token);
        Some(removed)
    }

    pub(crate) fn signal_len(&self) -> usize {
        self.signals.len()
    }

    // ---- timers ----

    pub(crate) fn insert_timer(&mut self, id: TimerId, timer: TimerRegistration<B>) {
        self.index.insert(timer.token, Event::Timer(id));
        self.timers.insert(id, timer);
    }

    pub(crate) fn remove_timer(&mut self, id: TimerId) -> Option<TimerRegistration<B>> {
        let removed = self.timers.remove(&id)?;
        self.index.remove(&removed.token);
        Some(removed)
    }

    pub(crate) fn timer_mut(&mut self, id: TimerId) -> Option<&mut TimerRegistration<B>> {
        self.timers.get_mut(&id)
    }

    pub(crate) fn contains_timer(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Empties the timer table, returning a snapshot of what it held.
    pub(crate) fn take_timers(&mut self) -> Vec<TimerRegistration<B>> {
        let timers: Vec<_> = self.timers.drain().map(|(_, timer)| timer).collect();
        for timer in &timers {
            self.index.remove(&timer.token);
        }
        timers
    }

    pub(crate) fn timer_len(&self) -> usize {
        self.timers.len()
    }

    // ---- callbacks ----

    /// Detaches the callback of the watch owning `token`.
    ///
    /// Returns `None` if the watch is gone or its callback is already running.
    pub(crate) fn take_watch_callback(
        &mut self,
        event: Event,
        token: Token,
    ) -> Option<BoxCallback<B>> {
        self.watch_mut(event, token)?.callback.take()
    }

    /// Reattaches a callback detached by `take_watch_callback`, provided the
    /// same registration is still present. Otherwise the callback is dropped.
    pub(crate) fn restore_watch_callback(
        &mut self,
        event: Event,
        token: Token,
        callback: BoxCallback<B>,
    ) {
        if let Some(watch) = self.watch_mut(event, token) {
            if watch.callback.is_none() {
                watch.callback = Some(callback);
            }
        }
    }

    fn watch_mut(&mut self, event: Event, token: Token) -> Option<&mut Watch<B>> {
        let watch = match event {
            Event::Readable(fd) => self.io.get_mut(&fd)?.read.as_mut(),
            Event::Writable(fd) => self.io.get_mut(&fd)?.write.as_mut(),
            Event::Signal(signal) => self.signals.get_mut(&signal),
            Event::Timer(_) => None,
        }?;
        (watch.token == token).then_some(watch)
    }

    /// Empties every table, returning all tokens that were still live.
    pub(crate) fn clear(&mut self) -> Vec<Token> {
        let tokens = self.index.drain().map(|(token, _)| token).collect();
        self.io.clear();
        self.signals.clear();
        self.timers.clear();
        tokens
    }
}
