use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::{Backend, Event, Reactor};

/// The value every callback returns. `Err` is fatal to the process.
pub type CallbackResult = Result<(), CallbackError>;

pub(crate) type BoxCallback<B> = Box<dyn FnMut(&mut Reactor<B>, Event) -> CallbackResult>;

/// An unrecoverable failure raised by a callback.
///
/// Any error type converts into it through `?`:
///
/// ```
/// # use evreactor::CallbackResult;
/// fn on_readable() -> CallbackResult {
///     std::fs::metadata("/")?;
///     Ok(())
/// }
/// # on_readable().unwrap();
/// ```
pub struct CallbackError(Repr);

enum Repr {
    Failed(Box<dyn StdError + Send + Sync>),
    Message(String),
    Panicked(String),
}

impl CallbackError {
    /// Creates an error from a plain message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self(Repr::Message(message.to_string()))
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self(Repr::Panicked(message))
    }

    /// Returns `true` if the callback panicked instead of returning `Err`.
    pub fn is_panic(&self) -> bool {
        matches!(self.0, Repr::Panicked(_))
    }

    /// Returns the wrapped error, if the callback returned one.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match &self.0 {
            Repr::Failed(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl<E> From<E> for CallbackError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self(Repr::Failed(Box::new(error)))
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Failed(e) => e.fmt(f),
            Repr::Message(m) => f.write_str(m),
            Repr::Panicked(m) => write!(f, "callback panicked: {m}"),
        }
    }
}

impl fmt::Debug for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            Repr::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Repr::Panicked(m) => f.debug_tuple("Panicked").field(m).finish(),
        }
    }
}

pub(crate) fn boxed<B, F>(callback: F) -> BoxCallback<B>
where
    B: Backend,
    F: FnMut(&mut Reactor<B>, Event) -> CallbackResult + 'static,
{
    Box::new(callback)
}

/// Runs a callback, turning a panic into a `CallbackError`.
pub(crate) fn invoke<B: Backend>(
    callback: &mut BoxCallback<B>,
    reactor: &mut Reactor<B>,
    event: Event,
) -> CallbackResult {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(reactor, event))) {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::panicked(payload)),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_question_mark_converts_std_errors() {
        fn failing() -> CallbackResult {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
            Ok(())
        }

        let err = failing().unwrap_err();
        assert!(!err.is_panic());
        assert_eq!(err.to_string(), "peer gone");
        assert!(err.source_error().is_some());
    }

    #[test]
    fn test_panic_payloads() {
        let err = CallbackError::panicked(Box::new("boom"));
        assert!(err.is_panic());
        assert_eq!(err.to_string(), "callback panicked: boom");

        let err = CallbackError::panicked(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "callback panicked: owned");

        let err = CallbackError::panicked(Box::new(7u32));
        assert_eq!(err.to_string(), "callback panicked: non-string panic payload");
    }

    #[test]
    fn test_message() {
        let err = CallbackError::msg(format_args!("bad state {}", 3));
        assert_eq!(err.to_string(), "bad state 3");
        assert!(err.source_error().is_none());
    }
}
