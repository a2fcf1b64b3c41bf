use crate::{FatalHook, FatalPolicy};

const DEFAULT_READY_CAPACITY: usize = 64;

/// Reactor settings that do not depend on the backend.
///
/// ```
/// # use evreactor::Config;
/// let config = Config::new().ready_capacity(128).fatal_exit_code(3);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) ready_capacity: usize,
    pub(crate) fatal_policy: FatalPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ready_capacity: DEFAULT_READY_CAPACITY,
            fatal_policy: FatalPolicy::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Default::default()
    }

    /// Initial capacity of the buffer receiving ready tokens from the backend.
    pub fn ready_capacity(mut self, capacity: usize) -> Self {
        self.ready_capacity = capacity;
        self
    }

    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }

    /// Shorthand for `fatal_policy(FatalPolicy::Exit(code))`.
    pub fn fatal_exit_code(self, code: i32) -> Self {
        self.fatal_policy(FatalPolicy::Exit(code))
    }

    /// Shorthand for `fatal_policy(FatalPolicy::Hook(hook))`.
    pub fn on_fatal(self, hook: FatalHook) -> Self {
        self.fatal_policy(FatalPolicy::Hook(hook))
    }

    /// The policy applied when a callback fails.
    pub fn policy(&self) -> FatalPolicy {
        self.fatal_policy
    }
}
