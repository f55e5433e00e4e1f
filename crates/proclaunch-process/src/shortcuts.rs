//! Read-only lifecycle queries for anything wrapping a process

use std::time::Duration;

use crate::end_status::EndStatus;
use crate::lifecycle::ProcessLifecycle;

/// Forwards common queries to [`LifecycleShortcuts::lifecycle`]
pub trait LifecycleShortcuts {
    fn lifecycle(&self) -> &ProcessLifecycle;

    fn end_status(&self) -> EndStatus {
        self.lifecycle().end_status()
    }

    fn is_correctly_done(&self) -> bool {
        self.lifecycle().is_correctly_done()
    }

    fn pid(&self) -> u32 {
        self.lifecycle().pid()
    }

    fn user_exec(&self) -> Option<String> {
        self.lifecycle().user_exec()
    }

    fn is_running(&self) -> bool {
        self.lifecycle().is_running()
    }

    fn uptime(&self) -> Duration {
        self.lifecycle().uptime()
    }

    fn try_exit_code(&self) -> Option<i32> {
        self.lifecycle().try_exit_code()
    }

    fn cpu_duration(&self) -> Option<Duration> {
        self.lifecycle().cpu_duration()
    }
}

impl LifecycleShortcuts for ProcessLifecycle {
    fn lifecycle(&self) -> &ProcessLifecycle {
        self
    }
}
