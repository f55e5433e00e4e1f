//! One-call "run a tool and collect its output"

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use proclaunch_cmdline::{CommandLine, ExecutableFinder, Parameters};

use crate::capture::{CaptureScope, OutputCapture, OutputRetention};
use crate::error::Result;
use crate::launcher::ProcessLauncher;
use crate::lifecycle::ProcessLifecycle;
use crate::shortcuts::LifecycleShortcuts;

/// A resolved executable with a parameter template
///
/// ```rust,no_run
/// use proclaunch_cmdline::ExecutableFinder;
/// use proclaunch_process::Exec;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut exec = Exec::new("git", &ExecutableFinder::new())?;
/// exec.parameters_mut().add_bulk("log -n 1 --format=<%format%>");
/// exec.set_var("format", "%H");
///
/// let output = exec.run_wait_get_text(|launcher| launcher).await?;
/// println!("{}", output.stdout_text(false));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Exec {
    executable: PathBuf,
    parameters: Parameters,
    vars: HashMap<String, String>,
    drop_orphan_flags: bool,
}

impl Exec {
    /// Resolve `name` now; fails if it can't be found
    pub fn new(name: &str, finder: &ExecutableFinder) -> Result<Self> {
        Ok(Self {
            executable: finder.get(name)?,
            parameters: Parameters::new(),
            vars: HashMap::new(),
            drop_orphan_flags: true,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    /// Value injected in place of `<%name%>` at start
    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Drop `-flag <%missing%>` pairs instead of only the placeholder (default: true)
    pub fn drop_orphan_flags(&mut self, drop: bool) -> &mut Self {
        self.drop_orphan_flags = drop;
        self
    }

    /// Command line the next start would run
    pub fn command_line(&self) -> Result<CommandLine> {
        let resolved = self.parameters.inject_vars(&self.vars, self.drop_orphan_flags);
        Ok(CommandLine::new(&self.executable, resolved.into_tokens())?)
    }

    /// Start with both streams retained
    ///
    /// `before_run` can adjust the launcher (time limit, environment...). If it
    /// sets its own capture engine the retention is added to it.
    pub async fn start<F>(&self, before_run: F) -> Result<RunningExec>
    where
        F: FnOnce(ProcessLauncher) -> ProcessLauncher,
    {
        let retention = Arc::new(OutputRetention::new(CaptureScope::Both));
        let launcher = before_run(ProcessLauncher::new(self.command_line()?));
        let lifecycle = retain_output(launcher, &retention).start().await?;
        Ok(RunningExec {
            lifecycle,
            retention,
        })
    }

    /// Start, wait, check the execution and return the retained output
    pub async fn run_wait_get_text<F>(&self, before_run: F) -> Result<Arc<OutputRetention>>
    where
        F: FnOnce(ProcessLauncher) -> ProcessLauncher,
    {
        let running = self.start(before_run).await?;
        running.lifecycle.check_execution_with(&running.retention).await?;
        running.retention.wait_all_closed().await;
        Ok(running.retention)
    }
}

/// Add `retention` to the launcher capture, creating a full capture if unset
pub(crate) fn retain_output(launcher: ProcessLauncher, retention: &Arc<OutputRetention>) -> ProcessLauncher {
    match launcher.capture() {
        Some(capture) => {
            capture.add_observer(retention.clone());
            launcher
        }
        None => {
            let capture = OutputCapture::new(CaptureScope::Both).with_observer(retention.clone());
            launcher.with_capture(Arc::new(capture))
        }
    }
}

/// A started [`Exec`]
#[derive(Debug, Clone)]
pub struct RunningExec {
    lifecycle: ProcessLifecycle,
    retention: Arc<OutputRetention>,
}

impl RunningExec {
    pub fn retention(&self) -> &Arc<OutputRetention> {
        &self.retention
    }

    pub fn into_parts(self) -> (ProcessLifecycle, Arc<OutputRetention>) {
        (self.lifecycle, self.retention)
    }
}

impl LifecycleShortcuts for RunningExec {
    fn lifecycle(&self) -> &ProcessLifecycle {
        &self.lifecycle
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::end_status::EndStatus;
    use crate::error::ProcessError;
    use crate::shutdown::ShutdownRegistry;

    fn private(launcher: ProcessLauncher) -> ProcessLauncher {
        launcher.with_registry(Arc::new(ShutdownRegistry::new()))
    }

    #[tokio::test]
    async fn test_run_wait_get_text() {
        let mut exec = Exec::new("sh", &ExecutableFinder::new()).unwrap();
        exec.parameters_mut().add(["-c", "<%script%>", "-x", "<%missing%>"]);
        exec.set_var("script", "printf 'Line 1\\nLine 2\\n\\n\\tline 4'");
        assert_eq!(exec.command_line().unwrap().parameters().len(), 2);

        let output = exec.run_wait_get_text(private).await.unwrap();
        assert_eq!(output.stdout_lines(true), ["Line 1", "Line 2", "", "\tline 4"]);
        assert_eq!(output.stdout_lines(false).len(), 3);
    }

    #[tokio::test]
    async fn test_run_wait_get_text_failure() {
        let mut exec = Exec::new("sh", &ExecutableFinder::new()).unwrap();
        exec.parameters_mut().add(["-c", "echo broken >&2; exit 4"]);

        let err = exec.run_wait_get_text(private).await.unwrap_err();
        match err {
            ProcessError::InvalidExecution {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(stderr, ["broken"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_running_exec_shortcuts() {
        let mut exec = Exec::new("sh", &ExecutableFinder::new()).unwrap();
        exec.parameters_mut().add(["-c", "exit 0"]);

        let running = exec.start(private).await.unwrap();
        running.lifecycle().wait_for_end().await;
        assert!(!running.is_running());
        assert_eq!(running.end_status(), EndStatus::CorrectlyDone);
        assert_eq!(running.try_exit_code(), Some(0));
        assert_eq!(running.pid(), running.lifecycle().pid());
    }

    #[test]
    fn test_missing_executable() {
        let err = Exec::new("proclaunch-surely-not-installed-xyz", &ExecutableFinder::new())
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cmdline(_)));
    }
}
