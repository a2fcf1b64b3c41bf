//! This module defines `Flag`, the closed set of registration kinds accepted by
//! [`Reactor::add`](crate::Reactor::add) and [`Reactor::del`](crate::Reactor::del),
//! and `Direction`, the readiness direction of a descriptor watch.

use crate::timer::TimerKind;
use crate::Error;

/// The readiness direction of an I/O watch.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Direction {
    Read,
    Write,
}

/// Selects what kind of registration `add`/`del` operate on.
///
/// The numeric values are part of the public contract and can be converted
/// back with [`Flag::try_from`].
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum Flag {
    /// Descriptor readable.
    Read = 1,
    /// Descriptor writable.
    Write = 2,
    /// Signal delivered.
    Signal = 4,
    /// Repeating timer.
    Timer = 8,
    /// One-shot timer.
    TimerOnce = 16,
}

impl Flag {
    /// Returns the numeric value of the flag.
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Returns the direction for `Read` and `Write`, `None` otherwise.
    pub const fn direction(self) -> Option<Direction> {
        match self {
            Flag::Read => Some(Direction::Read),
            Flag::Write => Some(Direction::Write),
            _ => None,
        }
    }

    /// Returns the timer kind for `Timer` and `TimerOnce`, `None` otherwise.
    pub const fn timer_kind(self) -> Option<TimerKind> {
        match self {
            Flag::Timer => Some(TimerKind::Repeating),
            Flag::TimerOnce => Some(TimerKind::OneShot),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Flag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Flag::Read),
            2 => Ok(Flag::Write),
            4 => Ok(Flag::Signal),
            8 => Ok(Flag::Timer),
            16 => Ok(Flag::TimerOnce),
            other => Err(Error::UnknownFlag(other)),
        }
    }
}

impl From<Flag> for u8 {
    fn from(value: Flag) -> Self {
        value.bits()
    }
}
