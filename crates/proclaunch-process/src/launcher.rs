//! Process launcher

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use proclaunch_cmdline::CommandLine;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::callbacks::{run_guarded, ExecutionCallback};
use crate::capture::{OutputCapture, StreamKind};
use crate::environment::Environment;
use crate::error::{ProcessError, Result};
use crate::lifecycle::ProcessLifecycle;
use crate::limiter::ExecutionTimeLimiter;
use crate::settings::{KillPolicy, LauncherSettings};
use crate::shutdown::ShutdownRegistry;

/// Spawns the configured command in place of [`Command::spawn`]
///
/// Gets the fully prepared command (arguments, piped stdio, environment,
/// working directory) and may adjust it, wrap it or spawn it another way. The
/// returned child must keep the piped stdio.
pub trait ProcessStartup: Send + Sync {
    fn start(&self, command: &mut Command) -> io::Result<Child>;
}

impl<F> ProcessStartup for F
where
    F: Fn(&mut Command) -> io::Result<Child> + Send + Sync,
{
    fn start(&self, command: &mut Command) -> io::Result<Child> {
        self(command)
    }
}

/// Everything needed to start a supervised process
///
/// A launcher can start the same command any number of times; each start
/// returns an independent [`ProcessLifecycle`].
#[derive(Clone)]
pub struct ProcessLauncher {
    command_line: CommandLine,
    environment: Environment,
    working_dir: Option<PathBuf>,
    exec_code_must_be_zero: bool,
    callbacks: Vec<Arc<dyn ExecutionCallback>>,
    time_limiter: Option<ExecutionTimeLimiter>,
    capture: Option<Arc<OutputCapture>>,
    kill_policy: KillPolicy,
    registry: Arc<ShutdownRegistry>,
    startup: Option<Arc<dyn ProcessStartup>>,
}

impl ProcessLauncher {
    /// Launcher with the host environment and the global shutdown registry
    pub fn new(command_line: CommandLine) -> Self {
        Self {
            command_line,
            environment: Environment::inherit(),
            working_dir: None,
            exec_code_must_be_zero: true,
            callbacks: Vec::new(),
            time_limiter: None,
            capture: None,
            kill_policy: KillPolicy::default(),
            registry: ShutdownRegistry::global(),
            startup: None,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    /// Run in `dir`, which must be an existing directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(ProcessError::InvalidWorkingDirectory { path: dir });
        }
        self.working_dir = Some(dir);
        Ok(self)
    }

    /// Whether a nonzero exit code means `DoneWithError` (default: true)
    pub fn exec_code_must_be_zero(mut self, must_be_zero: bool) -> Self {
        self.exec_code_must_be_zero = must_be_zero;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn ExecutionCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ExecutionCallback>) -> &mut Self {
        self.callbacks.push(callback);
        self
    }

    /// Unregister a callback, compared by pointer
    pub fn remove_callback(&mut self, callback: &Arc<dyn ExecutionCallback>) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|c| !Arc::ptr_eq(c, callback));
        before != self.callbacks.len()
    }

    pub fn with_time_limiter(mut self, limiter: ExecutionTimeLimiter) -> Self {
        self.time_limiter = Some(limiter);
        self
    }

    pub fn with_capture(mut self, capture: Arc<OutputCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn capture(&self) -> Option<&Arc<OutputCapture>> {
        self.capture.as_ref()
    }

    pub fn with_kill_policy(mut self, kill_policy: KillPolicy) -> Self {
        self.kill_policy = kill_policy;
        self
    }

    /// Use a private shutdown registry instead of the global one
    pub fn with_registry(mut self, registry: Arc<ShutdownRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Hand the spawn over to `startup`
    pub fn with_process_startup(mut self, startup: Arc<dyn ProcessStartup>) -> Self {
        self.startup = Some(startup);
        self
    }

    /// Apply serialized defaults
    ///
    /// A capture engine is only created when none was set.
    pub fn apply_settings(mut self, settings: &LauncherSettings) -> Result<Self> {
        self.exec_code_must_be_zero = settings.exec_code_must_be_zero;
        self.kill_policy = settings.kill_policy();
        self.environment.set_default_lang(&settings.default_lang);
        if let Some(limiter) = settings.time_limiter()? {
            self.time_limiter = Some(limiter);
        }
        if let (None, Some(scope)) = (&self.capture, settings.capture) {
            self.capture = Some(Arc::new(OutputCapture::new(scope)));
        }
        Ok(self)
    }

    pub fn command_line(&self) -> &CommandLine {
        &self.command_line
    }

    pub fn full_command_line(&self) -> String {
        self.command_line.full_command_line()
    }

    fn output_stdio(&self, stream: StreamKind) -> Stdio {
        match &self.capture {
            Some(capture) if capture.captures(stream) => Stdio::piped(),
            _ => Stdio::null(),
        }
    }

    /// Spawn the process and start supervising it
    pub async fn start(&self) -> Result<ProcessLifecycle> {
        let full_command_line = self.full_command_line();

        let mut command = Command::new(self.command_line.executable());
        command
            .args(self.command_line.parameters())
            .stdin(Stdio::piped())
            .stdout(self.output_stdio(StreamKind::Stdout))
            .stderr(self.output_stdio(StreamKind::Stderr))
            .kill_on_drop(false);
        self.environment.apply(&mut command);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let spawned = match &self.startup {
            Some(startup) => startup.start(&mut command),
            None => command.spawn(),
        };
        let mut child = spawned.map_err(|source| ProcessError::Spawn {
            command: full_command_line.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let lifecycle = ProcessLifecycle::new(
            pid,
            self.command_line.clone(),
            self.exec_code_must_be_zero,
            self.kill_policy,
            stdin,
        );
        let cleanup_id = self
            .registry
            .register(pid, self.command_line.executable_name());
        info!(pid, command = %full_command_line, "Process started");

        if let Some(limiter) = &self.time_limiter {
            debug!(pid, max_ms = limiter.max_exec_time().as_millis() as u64, "Time limit armed");
            limiter.arm(&lifecycle);
        }

        for callback in &self.callbacks {
            run_guarded("post_startup", &lifecycle, || callback.post_startup(&lifecycle));
        }

        if let Some(capture) = &self.capture {
            capture.attach(&lifecycle, stdout, stderr);
        }

        lifecycle.spawn_reaper(
            child,
            self.callbacks.clone(),
            Arc::clone(&self.registry),
            cleanup_id,
        );
        Ok(lifecycle)
    }
}

impl std::fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("command_line", &self.full_command_line())
            .field("working_dir", &self.working_dir)
            .field("exec_code_must_be_zero", &self.exec_code_must_be_zero)
            .field("callbacks", &self.callbacks.len())
            .field("time_limiter", &self.time_limiter)
            .field("capture", &self.capture)
            .field("kill_policy", &self.kill_policy)
            .field("external_startup", &self.startup.is_some())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::callbacks::{OnEnd, PostStartup};
    use crate::capture::{CaptureScope, OutputRetention};
    use proclaunch_cmdline::ExecutableFinder;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn sh(script: &str) -> ProcessLauncher {
        let cmd = CommandLine::resolve("sh", ["-c", script], &ExecutableFinder::new()).unwrap();
        ProcessLauncher::new(cmd).with_registry(Arc::new(ShutdownRegistry::new()))
    }

    fn retained(launcher: ProcessLauncher, scope: CaptureScope) -> (ProcessLauncher, Arc<OutputRetention>) {
        let retention = Arc::new(OutputRetention::new(CaptureScope::Both));
        let capture = OutputCapture::new(scope).with_observer(retention.clone());
        (launcher.with_capture(Arc::new(capture)), retention)
    }

    #[test]
    fn test_invalid_working_dir() {
        let dir = TempDir::new().unwrap();
        let result = sh("true").with_working_dir(dir.path().join("missing"));
        assert!(matches!(result, Err(ProcessError::InvalidWorkingDirectory { .. })));
    }

    #[tokio::test]
    async fn test_working_dir_and_environment() {
        let dir = TempDir::new().unwrap();
        let launcher = sh("pwd; echo \"$PL_VALUE\"; echo \"$LANG\"")
            .with_working_dir(dir.path())
            .unwrap()
            .with_environment(Environment::empty().with("PL_VALUE", "forty-two").with("LANG", "C"));
        let (launcher, retention) = retained(launcher, CaptureScope::Both);

        let lifecycle = launcher.start().await.unwrap();
        lifecycle.check_execution_with(&retention).await.unwrap();
        retention.wait_all_closed().await;

        let lines = retention.stdout_lines(false);
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&lines[0]).canonicalize().unwrap(), expected_dir);
        assert_eq!(lines[1], "forty-two");
        assert_eq!(lines[2], "C");
    }

    #[tokio::test]
    async fn test_post_startup_sees_pid() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = Arc::clone(&seen);
        let lifecycle = sh("exit 0")
            .with_callback(Arc::new(PostStartup(move |lc: &ProcessLifecycle| {
                seen_cb.store(lc.pid(), Ordering::SeqCst)
            })))
            .start()
            .await
            .unwrap();
        lifecycle.wait_for_end().await;
        assert_eq!(seen.load(Ordering::SeqCst), lifecycle.pid());
    }

    #[test]
    fn test_remove_callback() {
        let callback: Arc<dyn ExecutionCallback> = Arc::new(OnEnd(|_: &ProcessLifecycle| {}));
        let mut launcher = sh("true").with_callback(Arc::clone(&callback));
        assert!(launcher.remove_callback(&callback));
        assert!(!launcher.remove_callback(&callback));
    }

    #[tokio::test]
    async fn test_uncaptured_streams_are_notified() {
        let (launcher, retention) = retained(sh("echo out; echo err >&2"), CaptureScope::StderrOnly);
        let lifecycle = launcher.start().await.unwrap();
        lifecycle.wait_for_end().await;
        retention.wait_all_closed().await;

        assert!(retention.stdout_lines(true).is_empty());
        assert_eq!(retention.stderr_lines(true), ["err"]);
    }

    #[tokio::test]
    async fn test_apply_settings() {
        let settings = LauncherSettings::from_toml_str(
            r#"
            exec_code_must_be_zero = false
            max_exec_time_ms = 150
            capture = "stdout_only"
            "#,
        )
        .unwrap();
        let launcher = sh("exec sleep 30").apply_settings(&settings).unwrap();
        assert_eq!(launcher.capture().unwrap().scope(), CaptureScope::StdoutOnly);

        let lifecycle = launcher.start().await.unwrap();
        assert!(!lifecycle.exec_code_must_be_zero());
        assert!(lifecycle.wait_for_end_timeout(std::time::Duration::from_secs(10)).await);
        assert!(lifecycle.is_too_long_execution_time());
    }

    #[tokio::test]
    async fn test_external_startup_spawns_the_command() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_hook = Arc::clone(&calls);
        let startup = move |command: &mut Command| {
            calls_hook.fetch_add(1, Ordering::SeqCst);
            command.env("PL_STARTED_BY", "hook").spawn()
        };

        let launcher = sh("echo \"$PL_STARTED_BY\"").with_process_startup(Arc::new(startup));
        let (launcher, retention) = retained(launcher, CaptureScope::Both);
        let lifecycle = launcher.start().await.unwrap();
        lifecycle.check_execution_with(&retention).await.unwrap();
        retention.wait_all_closed().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retention.stdout_lines(false), ["hook"]);
    }

    #[tokio::test]
    async fn test_external_startup_failure() {
        let startup = |_: &mut Command| -> io::Result<Child> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "not allowed"))
        };
        let err = sh("true")
            .with_process_startup(Arc::new(startup))
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("bad-interpreter");
        std::fs::write(&script, "#!/nonexistent/interpreter\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let cmd = CommandLine::new(&script, Vec::<String>::new()).unwrap();
        let err = ProcessLauncher::new(cmd).start().await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
