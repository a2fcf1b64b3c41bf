//! The fatal-error policy applied when a callback fails.
//!
//! A failing callback is never isolated from the rest of the loop: the error
//! is logged and the process terminates with a reserved exit status, so no
//! further events are dispatched.

use std::fmt;
use std::process;

use crate::{CallbackError, Event};

/// Exit status reserved for a callback failure.
pub const FATAL_EXIT_CODE: i32 = 250;

/// A diverging function invoked instead of exiting the process.
pub type FatalHook = fn(&CallbackError) -> !;

/// What the reactor does after logging a callback failure.
#[derive(Copy, Clone)]
pub enum FatalPolicy {
    /// Terminate the process with the given status.
    Exit(i32),
    /// Hand the error to a diverging hook, for embedding and tests.
    Hook(FatalHook),
}

impl Default for FatalPolicy {
    fn default() -> Self {
        FatalPolicy::Exit(FATAL_EXIT_CODE)
    }
}

impl fmt::Debug for FatalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalPolicy::Exit(code) => f.debug_tuple("Exit").field(code).finish(),
            FatalPolicy::Hook(_) => f.write_str("Hook(..)"),
        }
    }
}

impl FatalPolicy {
    pub(crate) fn escalate(&self, event: Event, error: &CallbackError) -> ! {
        tracing::error!(?event, %error, panicked = error.is_panic(), "callback failed, terminating");
        match *self {
            FatalPolicy::Exit(code) => process::exit(code),
            FatalPolicy::Hook(hook) => hook(error),
        }
    }
}
