//! A single-threaded event reactor.
//!
//! [`Reactor`] multiplexes descriptor readiness, signal delivery and timer
//! expiry onto one dispatch loop and invokes the registered callbacks on the
//! loop's thread. Callbacks receive `&mut Reactor` and may register or remove
//! anything, including themselves.
//!
//! ```no_run
//! use std::net::TcpListener;
//! use std::os::fd::AsRawFd;
//!
//! use evreactor::{Direction, Reactor, TimerKind};
//! use nix::sys::signal::Signal;
//!
//! # fn main() -> evreactor::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:3000")?;
//! listener.set_nonblocking(true)?;
//!
//! let mut reactor = Reactor::new()?;
//! reactor.add_io_watch(listener.as_raw_fd(), Direction::Read, move |_, _| {
//!     let (_stream, _addr) = listener.accept()?;
//!     Ok(())
//! })?;
//! reactor.add_timer(
//!     std::time::Duration::from_secs(5),
//!     TimerKind::Repeating,
//!     |_, _, _| Ok(()),
//!     (),
//! )?;
//! reactor.add_signal_watch(Signal::SIGTERM, |reactor, _| {
//!     reactor.stop();
//!     Ok(())
//! })?;
//!
//! reactor.run_forever()?;
//! # Ok(()) }
//! ```

mod backend;
mod callback;
mod config;
pub mod epoll;
mod error;
mod event;
mod fatal;
mod flag;
mod registry;
pub mod sim;
mod table;
mod timer;
mod utils;

use std::mem;
use std::time::Duration;

use tracing::{info, trace, warn};

use crate::epoll::EpollCreateFlags;

#[cfg(feature = "mock")]
#[cfg_attr(docsrs, doc(cfg(feature = "mock")))]
pub use crate::backend::MockBackend;
pub use crate::backend::{Backend, Token};
pub use crate::callback::{CallbackError, CallbackResult};
pub use crate::config::Config;
pub use crate::epoll::EpollBackend;
pub use crate::error::{Error, Result};
pub use crate::event::Event;
pub use crate::fatal::{FatalHook, FatalPolicy, FATAL_EXIT_CODE};
pub use crate::flag::{Direction, Flag};
pub use crate::registry::{Added, Key};
use crate::table::Tables;
pub use crate::timer::{interval_from_secs, TimerId, TimerKind};

const DEFAULT_EVENT_BUF_CAPACITY: usize = 256;

/// The event reactor. Owns exactly one backend context and every
/// registration made through it.
pub struct Reactor<B: Backend = EpollBackend> {
    backend: B,
    tables: Tables<B>,
    ready: Vec<Token>,
    fatal_policy: FatalPolicy,
    dispatching: bool,
    stopped: bool,
}

impl Default for Reactor<EpollBackend> {
    fn default() -> Self {
        Self::new().expect("Failed to create epoll backend")
    }
}

impl Reactor<EpollBackend> {
    /// Creates a reactor on a default [`EpollBackend`].
    pub fn new() -> Result<Self> {
        let backend = EpollBackend::new(DEFAULT_EVENT_BUF_CAPACITY, EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self::with_backend(backend))
    }
}

impl<B: Backend> Reactor<B> {
    pub fn with_backend(backend: B) -> Self {
        Self::with_config(backend, Config::default())
    }

    pub fn with_config(backend: B, config: Config) -> Self {
        Self {
            backend,
            tables: Tables::default(),
            ready: Vec::with_capacity(config.ready_capacity),
            fatal_policy: config.fatal_policy,
            dispatching: false,
            stopped: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Runs the loop until [`stop`](Self::stop) is called.
    ///
    /// Waits interrupted by a signal are retried; any other backend error is
    /// returned.
    pub fn run_forever(&mut self) -> Result<()> {
        while !self.stopped {
            match self.run_once() {
                Ok(()) => continue,
                Err(e) if e.is_interrupted() => continue,
                Err(e) => return Err(e),
            }
        }
        self.stopped = false;
        info!("event loop stopped");
        Ok(())
    }

    pub fn run_once(&mut self) -> Result<()> {
        self.run_once_with_timeout(None)
    }

    /// Waits for at most `timeout` (forever if `None`), then runs the
    /// callback of every ready registration.
    ///
    /// All ready callbacks run before this returns, even if one of them
    /// calls `stop`.
    pub fn run_once_with_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.dispatching {
            return Err(Error::Reentrant);
        }

        let mut ready = mem::take(&mut self.ready);
        ready.clear();
        if let Err(e) = self.backend.wait(timeout, &mut ready) {
            self.ready = ready;
            return Err(e.into());
        }

        self.dispatching = true;
        for &token in &ready {
            self.dispatch(token);
        }
        self.dispatching = false;
        self.ready = ready;

        Ok(())
    }

    /// Makes [`run_forever`](Self::run_forever) return once the current
    /// batch of callbacks has run.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopped
    }

    /// Cancels every remaining registration and releases the backend.
    ///
    /// Dropping the reactor does the same, but discards errors.
    pub fn close(mut self) -> Result<()> {
        let result = self.release_all();
        info!("reactor closed");
        result
    }

    fn dispatch(&mut self, token: Token) {
        // Cancelled earlier in this batch.
        let Some(event) = self.tables.resolve(token) else {
            trace!(?token, "skipping stale token");
            return;
        };

        let result = match event {
            Event::Timer(id) => self.fire_timer(id),
            _ => self.fire_watch(event, token),
        };
        if let Err(e) = result {
            self.fatal_policy.escalate(event, &e);
        }
    }

    fn fire_watch(&mut self, event: Event, token: Token) -> CallbackResult {
        let Some(mut callback) = self.tables.take_watch_callback(event, token) else {
            return Ok(());
        };

        trace!(?event, "dispatching");
        callback::invoke(&mut callback, self, event)?;
        self.tables.restore_watch_callback(event, token, callback);

        Ok(())
    }

    /// Cancels a native handle whose table entry is already gone.
    pub(crate) fn release(&mut self, token: Token) {
        if let Err(e) = self.backend.cancel(token) {
            warn!(?token, error = %e, "failed to cancel native handle");
        }
    }

    fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for token in self.tables.clear() {
            if let Err(e) = self.backend.cancel(token) {
                warn!(?token, error = %e, "failed to cancel native handle");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl<B: Backend> Drop for Reactor<B> {
    fn drop(&mut self) {
        if !self.tables.is_empty() {
            let _ = self.release_all();
        }
    }
}
