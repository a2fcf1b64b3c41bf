//! Linux [`Backend`] on `epoll`.
//!
//! Descriptor watches are level-triggered registrations of the caller's
//! descriptor; read and write interest on the same descriptor share one
//! registration. Every timeout is its own non-blocking `timerfd`. Signal
//! watches share one `signalfd`; a watched signal is blocked on the thread
//! that registered it, so register signals from the loop thread. Removing
//! a signal watch discards deliveries still queued for it and restores the
//! blocked state the signal had before it was watched.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::epoll::{Epoll, EpollEvent, EpollFlags, EpollTimeout};
pub use nix::sys::epoll::EpollCreateFlags;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::utils::{epoll_ctl, is_gone};
use crate::{Backend, Direction, Token};

// The top two bits of the epoll user data tell which kind of source fired.
const KIND_SHIFT: u32 = 62;
const KIND_MASK: u64 = 0b11 << KIND_SHIFT;
const FD_KIND: u64 = 0;
const TIMER_KIND: u64 = 1 << KIND_SHIFT;
const SIGNAL_KIND: u64 = 2 << KIND_SHIFT;

/// A zero expiration disarms a timerfd instead of firing immediately.
const MIN_TIMEOUT: Duration = Duration::from_nanos(1);

enum Handle {
    Fd(RawFd, Direction),
    Timer(TimerFd),
    Signal(Signal),
}

#[derive(Default)]
struct FdInterest {
    read: Option<Token>,
    write: Option<Token>,
}

impl FdInterest {
    fn slot(&mut self, direction: Direction) -> &mut Option<Token> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn flags(&self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read.is_some() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write.is_some() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

struct Signals {
    fd: SignalFd,
    tokens: FxHashMap<Signal, Token>,
    /// Watched signals that were unblocked before their watch was added.
    blocked_here: SigSet,
}

impl Signals {
    /// Reads and drops every queued delivery of `set`, then points the
    /// signalfd back at the watched signals.
    fn discard_pending(&mut self, set: &SigSet) -> io::Result<()> {
        self.fd.set_mask(set).map_err(io::Error::from)?;
        while self.fd.read_signal().map_err(io::Error::from)?.is_some() {}
        self.fd
            .set_mask(&sigset_of(self.tokens.keys()))
            .map_err(io::Error::from)
    }
}

fn sigset_of<'a>(signals: impl IntoIterator<Item = &'a Signal>) -> SigSet {
    let mut set = SigSet::empty();
    for signal in signals {
        set.add(*signal);
    }
    set
}

/// Converts a wait timeout, rounding up to whole milliseconds so that a
/// pending timer is not polled in a busy loop.
fn epoll_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(timeout) => {
            let mut millis = timeout.as_millis();
            if timeout.subsec_nanos() % 1_000_000 != 0 {
                millis += 1;
            }
            // Longer waits return early with nothing ready, which is harmless.
            EpollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
        }
    }
}

pub struct EpollBackend {
    epoll: Epoll,
    event_buf: Vec<EpollEvent>,
    handles: FxHashMap<Token, Handle>,
    fds: FxHashMap<RawFd, FdInterest>,
    signals: Option<Signals>,
    last_token: u64,
}

impl EpollBackend {
    /// Creates the epoll context. `capacity` bounds how many events a single
    /// wait can report.
    pub fn new(capacity: usize, flags: EpollCreateFlags) -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new(flags).map_err(io::Error::from)?,
            event_buf: vec![EpollEvent::empty(); capacity.max(1)],
            handles: Default::default(),
            fds: Default::default(),
            signals: None,
            last_token: 0,
        })
    }

    pub fn inner(&self) -> &Epoll {
        &self.epoll
    }

    fn next_token(&mut self) -> Token {
        self.last_token += 1;
        Token(self.last_token)
    }

    fn unwatch_fd(&mut self, fd: RawFd, direction: Direction, token: Token) -> io::Result<()> {
        let Some(interest) = self.fds.get_mut(&fd) else {
            return Ok(());
        };
        if *interest.slot(direction) != Some(token) {
            return Ok(());
        }
        *interest.slot(direction) = None;

        let flags = interest.flags();
        let result = if flags.is_empty() {
            self.fds.remove(&fd);
            epoll_ctl(&self.epoll, libc::EPOLL_CTL_DEL, fd, None)
        } else {
            let event = EpollEvent::new(flags, FD_KIND | fd as u32 as u64);
            epoll_ctl(&self.epoll, libc::EPOLL_CTL_MOD, fd, Some(event))
        };

        match result {
            Err(e) if is_gone(&e) => {
                debug!(fd, "descriptor closed before its watch was cancelled");
                Ok(())
            }
            other => other,
        }
    }

    fn unwatch_signal(&mut self, signal: Signal) -> io::Result<()> {
        let Some(signals) = &mut self.signals else {
            return Ok(());
        };
        signals.tokens.remove(&signal);
        if !signals.blocked_here.contains(signal) {
            return signals
                .fd
                .set_mask(&sigset_of(signals.tokens.keys()))
                .map_err(io::Error::from);
        }

        // An unblocked signal that is still pending runs its default action.
        let single = sigset_of([&signal]);
        signals.discard_pending(&single)?;
        signals.blocked_here.remove(signal);
        single.thread_unblock().map_err(io::Error::from)
    }

    fn open_signalfd(&mut self, mask: &SigSet) -> io::Result<()> {
        let fd = SignalFd::with_flags(mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(io::Error::from)?;
        self.epoll
            .add(&fd, EpollEvent::new(EpollFlags::EPOLLIN, SIGNAL_KIND))
            .map_err(io::Error::from)?;
        self.signals = Some(Signals {
            fd,
            tokens: Default::default(),
            blocked_here: SigSet::empty(),
        });
        Ok(())
    }

    fn collect_fd(&self, fd: RawFd, flags: EpollFlags, ready: &mut Vec<Token>) {
        let Some(interest) = self.fds.get(&fd) else {
            return;
        };
        // Errors and hang-ups are reported to both directions.
        let broken = flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
        if let Some(token) = interest.read {
            if broken || flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLPRI) {
                ready.push(token);
            }
        }
        if let Some(token) = interest.write {
            if broken || flags.contains(EpollFlags::EPOLLOUT) {
                ready.push(token);
            }
        }
    }

    fn collect_timer(&self, token: Token, ready: &mut Vec<Token>) -> io::Result<()> {
        let Some(Handle::Timer(timer)) = self.handles.get(&token) else {
            return Ok(());
        };
        match timer.wait() {
            Ok(()) => ready.push(token),
            Err(Errno::EAGAIN) => trace!(?token, "spurious timer wakeup"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn collect_signals(&mut self, ready: &mut Vec<Token>) -> io::Result<()> {
        let Some(signals) = &mut self.signals else {
            return Ok(());
        };
        while let Some(info) = signals.fd.read_signal().map_err(io::Error::from)? {
            let Ok(signal) = Signal::try_from(info.ssi_signo as libc::c_int) else {
                continue;
            };
            if let Some(&token) = signals.tokens.get(&signal) {
                ready.push(token);
            }
        }
        Ok(())
    }
}

impl Default for EpollBackend {
    fn default() -> Self {
        Self::new(crate::DEFAULT_EVENT_BUF_CAPACITY, EpollCreateFlags::EPOLL_CLOEXEC)
            .expect("Failed to create epoll instance")
    }
}

impl Backend for EpollBackend {
    fn watch_fd(&mut self, fd: RawFd, direction: Direction) -> io::Result<Token> {
        let token = self.next_token();
        let interest = self.fds.entry(fd).or_default();
        if interest.slot(direction).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already watched in this direction",
            ));
        }

        let op = if interest.flags().is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        *interest.slot(direction) = Some(token);
        let event = EpollEvent::new(interest.flags(), FD_KIND | fd as u32 as u64);

        if let Err(e) = epoll_ctl(&self.epoll, op, fd, Some(event)) {
            *interest.slot(direction) = None;
            if op == libc::EPOLL_CTL_ADD {
                self.fds.remove(&fd);
            }
            return Err(e);
        }

        self.handles.insert(token, Handle::Fd(fd, direction));
        Ok(token)
    }

    fn watch_signal(&mut self, signal: Signal) -> io::Result<Token> {
        if let Some(signals) = &self.signals {
            if signals.tokens.contains_key(&signal) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "signal already watched",
                ));
            }
        }

        // Block first, so that a delivery racing the registration is queued
        // for the signalfd instead of running the default disposition.
        let single = sigset_of([&signal]);
        let blocked_here = !single
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(io::Error::from)?
            .contains(signal);

        let mut watched: Vec<Signal> = self
            .signals
            .as_ref()
            .map(|signals| signals.tokens.keys().copied().collect())
            .unwrap_or_default();
        watched.push(signal);
        let mask = sigset_of(&watched);

        let registered = if let Some(signals) = &mut self.signals {
            signals.fd.set_mask(&mask).map_err(io::Error::from)
        } else {
            self.open_signalfd(&mask)
        };
        if let Err(e) = registered {
            if blocked_here {
                let _ = single.thread_unblock();
            }
            return Err(e);
        }

        let token = self.next_token();
        if let Some(signals) = &mut self.signals {
            signals.tokens.insert(signal, token);
            if blocked_here {
                signals.blocked_here.add(signal);
            }
        }
        self.handles.insert(token, Handle::Signal(signal));
        Ok(token)
    }

    fn create_timeout(&mut self) -> io::Result<Token> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(io::Error::from)?;

        let token = self.next_token();
        self.epoll
            .add(&timer, EpollEvent::new(EpollFlags::EPOLLIN, TIMER_KIND | token.0))
            .map_err(io::Error::from)?;
        self.handles.insert(token, Handle::Timer(timer));

        Ok(token)
    }

    fn arm(&mut self, token: Token, after: Duration) -> io::Result<()> {
        let Some(Handle::Timer(timer)) = self.handles.get(&token) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown timeout"));
        };
        let expiration = Expiration::OneShot(TimeSpec::from_duration(after.max(MIN_TIMEOUT)));
        timer
            .set(expiration, TimerSetTimeFlags::empty())
            .map_err(io::Error::from)
    }

    fn cancel(&mut self, token: Token) -> io::Result<()> {
        match self.handles.remove(&token) {
            None => Ok(()),
            Some(Handle::Fd(fd, direction)) => self.unwatch_fd(fd, direction, token),
            // Closing the timerfd on drop removes it from the interest list too.
            Some(Handle::Timer(timer)) => self.epoll.delete(&timer).map_err(io::Error::from),
            Some(Handle::Signal(signal)) => self.unwatch_signal(signal),
        }
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Token>) -> io::Result<()> {
        let n = self
            .epoll
            .wait(&mut self.event_buf, epoll_timeout(timeout))
            .map_err(io::Error::from)?;

        for i in 0..n {
            let event = self.event_buf[i];
            let data = event.data();
            match data & KIND_MASK {
                FD_KIND => self.collect_fd(data as u32 as RawFd, event.events(), ready),
                TIMER_KIND => self.collect_timer(Token(data & !KIND_MASK), ready)?,
                SIGNAL_KIND => self.collect_signals(ready)?,
                _ => {}
            }
        }

        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        if let Some(signals) = &mut self.signals {
            let ours = signals.blocked_here;
            if signals.discard_pending(&ours).is_ok() {
                let _ = ours.thread_unblock();
            }
        }
    }
}
