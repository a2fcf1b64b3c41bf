use std::io;

use crate::{Flag, Key};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously by registration and loop operations.
///
/// Callback failures never show up here; they are handled by the
/// [`FatalPolicy`](crate::FatalPolicy).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend could not create, arm or wait on a native handle.
    #[error(transparent)]
    Backend(#[from] io::Error),

    #[error("invalid timer interval: {0} seconds")]
    InvalidInterval(f64),

    #[error("invalid signal number: {0}")]
    InvalidSignal(i32),

    #[error("unknown event flag: {0}")]
    UnknownFlag(u8),

    #[error("key {key:?} cannot be used with flag {flag:?}")]
    KeyMismatch { key: Key, flag: Flag },

    /// `run_once` was called from inside a callback.
    #[error("recursive call to Reactor::run_once")]
    Reentrant,
}

impl Error {
    /// Returns `true` if this is a backend wait interrupted by a signal.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Backend(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}
