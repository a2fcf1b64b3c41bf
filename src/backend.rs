use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::Direction;

/// Opaque native handle issued by a [`Backend`].
///
/// Tokens are never reused by the backend that issued them, so a stale token
/// can never be confused with a later registration.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Token(pub u64);

/// The notification mechanism a [`Reactor`] is built on.
///
/// Constructing the backend value creates its context. Descriptor and signal
/// watches are persistent: they report readiness every time the condition
/// holds until cancelled. Timeouts are one-shot and report once per `arm`.
///
/// # Primary Implementors
///
/// [`EpollBackend`] for production use, [`SimBackend`] for simulated time and
/// `MockBackend` (feature `mock`) for failure injection. Prefer writing code
/// against `Reactor<impl Backend>` so that it can be driven by any of them.
///
/// [`Reactor`]: crate::Reactor
/// [`EpollBackend`]: crate::EpollBackend
/// [`SimBackend`]: crate::sim::SimBackend
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait Backend {
    fn watch_fd(&mut self, fd: RawFd, direction: Direction) -> io::Result<Token>;

    fn watch_signal(&mut self, signal: Signal) -> io::Result<Token>;

    /// Creates a disarmed one-shot timeout.
    fn create_timeout(&mut self) -> io::Result<Token>;

    /// Arms (or re-arms) a timeout created by `create_timeout` to expire once
    /// after `after`.
    fn arm(&mut self, token: Token, after: Duration) -> io::Result<()>;

    /// Releases a native handle. Unknown tokens are ignored.
    fn cancel(&mut self, token: Token) -> io::Result<()>;

    /// Blocks until at least one handle is ready or `timeout` elapses, then
    /// appends the ready tokens to `ready`. `None` waits indefinitely.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Token>) -> io::Result<()>;
}
