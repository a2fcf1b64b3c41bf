use std::os::fd::RawFd;

use nix::sys::signal::Signal;

use crate::{Direction, TimerId};

/// What fired, handed to every callback.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Event {
    Readable(RawFd),
    Writable(RawFd),
    Signal(Signal),
    Timer(TimerId),
}

impl Event {
    pub(crate) const fn io(fd: RawFd, direction: Direction) -> Self {
        match direction {
            Direction::Read => Event::Readable(fd),
            Direction::Write => Event::Writable(fd),
        }
    }

    /// Returns `true` if a read watch fired.
    pub const fn is_readable(&self) -> bool {
        matches!(self, Event::Readable(_))
    }

    /// Returns `true` if a write watch fired.
    pub const fn is_writable(&self) -> bool {
        matches!(self, Event::Writable(_))
    }

    /// Returns the descriptor of an I/O event.
    pub const fn fd(&self) -> Option<RawFd> {
        match self {
            Event::Readable(fd) | Event::Writable(fd) => Some(*fd),
            _ => None,
        }
    }

    /// Returns the delivered signal of a signal event.
    pub const fn signal(&self) -> Option<Signal> {
        match self {
            Event::Signal(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Returns the id of the timer that expired.
    pub const fn timer_id(&self) -> Option<TimerId> {
        match self {
            Event::Timer(id) => Some(*id),
            _ => None,
        }
    }
}
