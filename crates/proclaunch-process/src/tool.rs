//! Bounded-parallel runner for executable tools
//!
//! A [`ToolRunner`] resolves each [`ExecutableTool`] with its finder, retains
//! both output streams and starts it. At most `max_in_parallel` tools run at
//! once; further `execute` calls wait for a slot, which is released when a
//! running tool ends.

use std::fmt;
use std::sync::Arc;

use proclaunch_cmdline::{CommandLine, ExecutableFinder, Parameters};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::capture::{CaptureScope, OutputRetention};
use crate::error::{ProcessError, Result};
use crate::exec::retain_output;
use crate::launcher::ProcessLauncher;
use crate::lifecycle::ProcessLifecycle;
use crate::shortcuts::LifecycleShortcuts;

/// Something runnable by a [`ToolRunner`]
pub trait ExecutableTool: Send + Sync + 'static {
    /// Name looked up by the runner's [`ExecutableFinder`]
    fn executable_name(&self) -> &str;

    /// Parameters with every variable already resolved
    fn ready_to_run_parameters(&self) -> Parameters;

    /// Last chance to adjust the launcher (time limit, environment, callbacks...)
    fn before_run(&self, launcher: ProcessLauncher) -> ProcessLauncher {
        launcher
    }
}

/// Starts tools, never more than `max_in_parallel` at a time
#[derive(Clone)]
pub struct ToolRunner {
    finder: Arc<ExecutableFinder>,
    slots: Arc<Semaphore>,
    max_in_parallel: usize,
}

impl ToolRunner {
    /// `max_in_parallel` is raised to 1 if zero
    pub fn new(finder: ExecutableFinder, max_in_parallel: usize) -> Self {
        let max_in_parallel = max_in_parallel.max(1);
        Self {
            finder: Arc::new(finder),
            slots: Arc::new(Semaphore::new(max_in_parallel)),
            max_in_parallel,
        }
    }

    pub fn executable_finder(&self) -> &ExecutableFinder {
        &self.finder
    }

    pub fn max_in_parallel(&self) -> usize {
        self.max_in_parallel
    }

    /// Slots free right now
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Refuse new tools; running ones are left alone
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Wait for a free slot, then resolve and start `tool`
    pub async fn execute<T: ExecutableTool>(&self, tool: T) -> Result<RunningTool<T>> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ProcessError::ToolRunnerClosed)?;

        let command_line = CommandLine::resolve(
            tool.executable_name(),
            tool.ready_to_run_parameters().into_tokens(),
            &self.finder,
        )?;
        let retention = Arc::new(OutputRetention::new(CaptureScope::Both));
        let launcher = retain_output(tool.before_run(ProcessLauncher::new(command_line)), &retention);
        let lifecycle = launcher.start().await?;

        let running = lifecycle.clone();
        tokio::spawn(async move {
            running.wait_for_end().await;
            debug!(pid = running.pid(), "Tool slot released");
            drop(slot);
        });

        Ok(RunningTool {
            tool: Arc::new(tool),
            lifecycle,
            retention,
        })
    }

    /// [`ToolRunner::execute`] on its own task
    pub fn spawn<T: ExecutableTool>(&self, tool: T) -> JoinHandle<Result<RunningTool<T>>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.execute(tool).await })
    }
}

impl fmt::Debug for ToolRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRunner")
            .field("max_in_parallel", &self.max_in_parallel)
            .field("available_slots", &self.available_slots())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A tool started by a [`ToolRunner`]
pub struct RunningTool<T> {
    tool: Arc<T>,
    lifecycle: ProcessLifecycle,
    retention: Arc<OutputRetention>,
}

impl<T> Clone for RunningTool<T> {
    fn clone(&self) -> Self {
        Self {
            tool: Arc::clone(&self.tool),
            lifecycle: self.lifecycle.clone(),
            retention: Arc::clone(&self.retention),
        }
    }
}

impl<T> RunningTool<T> {
    /// The tool this process was started from
    pub fn tool(&self) -> &T {
        &self.tool
    }

    pub fn retention(&self) -> &Arc<OutputRetention> {
        &self.retention
    }

    /// Wait for the end without checking the end status
    pub async fn wait_for_end(self) -> Self {
        self.lifecycle.wait_for_end().await;
        self
    }

    /// Wait, fail unless correctly done, and return the retained output
    pub async fn check_execution_get_text(&self) -> Result<Arc<OutputRetention>> {
        self.lifecycle.check_execution_with(&self.retention).await?;
        self.retention.wait_all_closed().await;
        Ok(Arc::clone(&self.retention))
    }
}

impl<T> LifecycleShortcuts for RunningTool<T> {
    fn lifecycle(&self) -> &ProcessLifecycle {
        &self.lifecycle
    }
}

impl<T> fmt::Debug for RunningTool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningTool")
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}
