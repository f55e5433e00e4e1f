//! Maximum execution time

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ProcessError, Result};
use crate::lifecycle::ProcessLifecycle;

/// Kills a process tree that runs longer than allowed
///
/// Arming spawns one timer task that races the limit against the process
/// exit. If the exit comes first the timer is dropped and nothing happens;
/// otherwise the process is marked `TooLongExecutionTime` and its tree killed.
#[derive(Debug, Clone)]
pub struct ExecutionTimeLimiter {
    max_exec_time: Duration,
    scheduler: Option<Handle>,
}

impl ExecutionTimeLimiter {
    pub fn new(max_exec_time: Duration) -> Result<Self> {
        if max_exec_time.is_zero() {
            return Err(ProcessError::InvalidTimeLimit);
        }
        Ok(Self {
            max_exec_time,
            scheduler: None,
        })
    }

    pub fn from_millis(millis: u64) -> Result<Self> {
        Self::new(Duration::from_millis(millis))
    }

    /// Run timers on `handle` instead of the current runtime
    pub fn with_scheduler(mut self, handle: Handle) -> Self {
        self.scheduler = Some(handle);
        self
    }

    pub fn max_exec_time(&self) -> Duration {
        self.max_exec_time
    }

    pub(crate) fn arm(&self, lifecycle: &ProcessLifecycle) -> JoinHandle<()> {
        let lifecycle = lifecycle.clone();
        let max = self.max_exec_time;

        let timer = async move {
            tokio::select! {
                biased;
                _ = lifecycle.wait_exited() => {
                    debug!(pid = lifecycle.pid(), "Process ended within time limit");
                }
                _ = tokio::time::sleep(max) => lifecycle.stop_too_long(max).await,
            }
        };

        match &self.scheduler {
            Some(handle) => handle.spawn(timer),
            None => tokio::spawn(timer),
        }
    }
}
