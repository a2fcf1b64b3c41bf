//! A deterministic [`Backend`] driven by a virtual clock.
//!
//! Nothing here touches the operating system. Descriptors become ready and
//! signals are delivered only when the test says so, and time only moves
//! inside [`Backend::wait`]: a wait jumps straight to the earliest timer
//! deadline (or to the end of its timeout), so seconds of simulated time run
//! instantly.
//!
//! ```
//! use std::time::Duration;
//!
//! use evreactor::sim::SimBackend;
//! use evreactor::{Reactor, TimerKind};
//!
//! let mut reactor = Reactor::with_backend(SimBackend::new());
//! reactor
//!     .add_timer(Duration::from_millis(500), TimerKind::OneShot, |_, _, _| Ok(()), ())
//!     .unwrap();
//! reactor.run_once().unwrap();
//! assert_eq!(reactor.backend().now(), Duration::from_millis(500));
//! assert_eq!(reactor.timer_count(), 0);
//! ```

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;
use rustc_hash::FxHashMap;

use crate::{Backend, Direction, Token};

#[derive(Default)]
pub struct SimBackend {
    now: Duration,
    last_token: u64,
    fds: FxHashMap<(RawFd, Direction), Token>,
    signals: FxHashMap<Signal, Token>,
    /// Deadline of every timeout, `None` while disarmed.
    timeouts: FxHashMap<Token, Option<Duration>>,
    pending: Vec<Token>,
    cancelled: usize,
}

impl SimBackend {
    pub fn new() -> Self {
        Default::default()
    }

    /// Simulated time elapsed since the backend was created.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Reports `fd` ready in `direction` on the next wait. Returns `false` if
    /// nothing watches it.
    pub fn make_ready(&mut self, fd: RawFd, direction: Direction) -> bool {
        match self.fds.get(&(fd, direction)) {
            Some(&token) => {
                self.pending.push(token);
                true
            }
            None => false,
        }
    }

    /// Delivers `signal` on the next wait. Returns `false` if nothing watches
    /// it.
    pub fn raise(&mut self, signal: Signal) -> bool {
        match self.signals.get(&signal) {
            Some(&token) => {
                self.pending.push(token);
                true
            }
            None => false,
        }
    }

    pub fn armed_timeouts(&self) -> usize {
        self.timeouts.values().filter(|d| d.is_some()).count()
    }

    /// Number of handles created and not yet cancelled.
    pub fn live_handles(&self) -> usize {
        self.fds.len() + self.signals.len() + self.timeouts.len()
    }

    /// Number of successful cancellations so far.
    pub fn cancellations(&self) -> usize {
        self.cancelled
    }

    fn next_token(&mut self) -> Token {
        self.last_token += 1;
        Token(self.last_token)
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timeouts.values().flatten().min().copied()
    }

    fn expire_due(&mut self, ready: &mut Vec<Token>) {
        let now = self.now;
        let mut due: Vec<(Duration, Token)> = self
            .timeouts
            .iter()
            .filter_map(|(&token, &deadline)| deadline.filter(|&d| d <= now).map(|d| (d, token)))
            .collect();
        due.sort();
        for (_, token) in due {
            self.timeouts.insert(token, None);
            ready.push(token);
        }
    }
}

impl Backend for SimBackend {
    fn watch_fd(&mut self, fd: RawFd, direction: Direction) -> io::Result<Token> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if self.fds.contains_key(&(fd, direction)) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let token = self.next_token();
        self.fds.insert((fd, direction), token);
        Ok(token)
    }

    fn watch_signal(&mut self, signal: Signal) -> io::Result<Token> {
        if self.signals.contains_key(&signal) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let token = self.next_token();
        self.signals.insert(signal, token);
        Ok(token)
    }

    fn create_timeout(&mut self) -> io::Result<Token> {
        let token = self.next_token();
        self.timeouts.insert(token, None);
        Ok(token)
    }

    fn arm(&mut self, token: Token, after: Duration) -> io::Result<()> {
        match self.timeouts.get_mut(&token) {
            Some(deadline) => {
                *deadline = Some(self.now + after);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown timeout")),
        }
    }

    fn cancel(&mut self, token: Token) -> io::Result<()> {
        let removed = self.timeouts.remove(&token).is_some() || {
            let before = self.fds.len() + self.signals.len();
            self.fds.retain(|_, t| *t != token);
            self.signals.retain(|_, t| *t != token);
            before != self.fds.len() + self.signals.len()
        };
        if removed {
            self.pending.retain(|t| *t != token);
            self.cancelled += 1;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Token>) -> io::Result<()> {
        if !self.pending.is_empty() {
            ready.append(&mut self.pending);
            return Ok(());
        }

        let limit = timeout.map(|t| self.now + t);
        match (self.next_deadline(), limit) {
            (Some(deadline), Some(limit)) if deadline > limit => self.now = limit,
            (Some(deadline), _) => {
                self.now = self.now.max(deadline);
                self.expire_due(ready);
            }
            (None, Some(limit)) => self.now = limit,
            (None, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "simulated wait would block forever",
                ))
            }
        }
        Ok(())
    }
}
