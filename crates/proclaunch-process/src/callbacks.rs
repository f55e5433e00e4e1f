//! Callbacks around a process run

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use crate::lifecycle::ProcessLifecycle;

/// Hooks run by the launcher
///
/// `post_startup` runs right after the spawn, before output capture starts.
/// `on_end` runs once after the exit, in registration order. Both run
/// synchronously; `on_end` must not wait for the end of the same process.
pub trait ExecutionCallback: Send + Sync {
    fn post_startup(&self, _lifecycle: &ProcessLifecycle) {}

    fn on_end(&self, _lifecycle: &ProcessLifecycle) {}
}

/// Closure run at the end of a process
pub struct OnEnd<F>(pub F);

impl<F> ExecutionCallback for OnEnd<F>
where
    F: Fn(&ProcessLifecycle) + Send + Sync,
{
    fn on_end(&self, lifecycle: &ProcessLifecycle) {
        (self.0)(lifecycle)
    }
}

impl<F> fmt::Debug for OnEnd<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OnEnd")
    }
}

/// Closure run after the spawn
pub struct PostStartup<F>(pub F);

impl<F> ExecutionCallback for PostStartup<F>
where
    F: Fn(&ProcessLifecycle) + Send + Sync,
{
    fn post_startup(&self, lifecycle: &ProcessLifecycle) {
        (self.0)(lifecycle)
    }
}

impl<F> fmt::Debug for PostStartup<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PostStartup")
    }
}

/// Run one callback; a panic is logged and swallowed
pub(crate) fn run_guarded(stage: &'static str, lifecycle: &ProcessLifecycle, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(pid = lifecycle.pid(), stage, panic = %message, "Execution callback panicked");
    }
}
