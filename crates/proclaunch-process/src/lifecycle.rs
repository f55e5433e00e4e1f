//! Lifecycle of one supervised process
//!
//! A [`ProcessLifecycle`] is a cheap handle over state shared with the tasks
//! working for the process (reaper, stream readers, stdin writer, time
//! limiter). The state moves through three phases:
//!
//! - `Running`: spawned, exit not recorded yet
//! - `Exited`: exit code and end time recorded, end callbacks not run yet
//! - `Finished`: end callbacks done
//!
//! What ended the process is claimed once, by whichever of natural exit,
//! [`ProcessLifecycle::kill`] or the time limiter gets there first.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proclaunch_cmdline::CommandLine;
use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::callbacks::{run_guarded, ExecutionCallback};
use crate::capture::{OutputRetention, StreamKind};
use crate::end_status::{EndStatus, TerminationCause};
use crate::error::{ProcessError, Result};
use crate::process_tree;
use crate::settings::KillPolicy;
use crate::shutdown::{CleanupId, ShutdownRegistry};
use crate::stdin::StdinInjection;

/// How long `check_execution_with` waits for stderr to drain
pub const STDERR_DRAIN_WAIT: Duration = Duration::from_secs(2);
/// Stderr lines attached to an `InvalidExecution` error
pub const STDERR_EXCERPT_LINES: usize = 50;
/// Period of the CPU time sampling done while the process runs
pub const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

const CAUSE_NONE: u8 = 0;
const CAUSE_NATURAL: u8 = 1;
const CAUSE_KILLED: u8 = 2;
const CAUSE_TIMED_OUT: u8 = 3;

fn encode_cause(cause: TerminationCause) -> u8 {
    match cause {
        TerminationCause::Natural => CAUSE_NATURAL,
        TerminationCause::Killed => CAUSE_KILLED,
        TerminationCause::TimedOut => CAUSE_TIMED_OUT,
    }
}

fn decode_cause(raw: u8) -> Option<TerminationCause> {
    match raw {
        CAUSE_NATURAL => Some(TerminationCause::Natural),
        CAUSE_KILLED => Some(TerminationCause::Killed),
        CAUSE_TIMED_OUT => Some(TerminationCause::TimedOut),
        _ => None,
    }
}

/// Phase of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecyclePhase {
    Running,
    Exited,
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct ExitRecord {
    code: Option<i32>,
    signal: Option<i32>,
    ended: Instant,
    ended_at: DateTime<Utc>,
}

struct LifecycleInner {
    pid: u32,
    command_line: CommandLine,
    exec_code_must_be_zero: bool,
    kill_policy: KillPolicy,
    started: Instant,
    started_at: DateTime<Utc>,
    cause: AtomicU8,
    exit: OnceLock<ExitRecord>,
    phase: watch::Sender<LifecyclePhase>,
    stdin: StdinInjection,
    cpu: Mutex<Option<Duration>>,
}

/// Handle on a started process
#[derive(Clone)]
pub struct ProcessLifecycle {
    inner: Arc<LifecycleInner>,
}

impl ProcessLifecycle {
    pub(crate) fn new(
        pid: u32,
        command_line: CommandLine,
        exec_code_must_be_zero: bool,
        kill_policy: KillPolicy,
        stdin: Option<ChildStdin>,
    ) -> Self {
        let (phase, phase_rx) = watch::channel(LifecyclePhase::Running);
        let stdin = StdinInjection::spawn(stdin, pid, phase_rx);

        Self {
            inner: Arc::new(LifecycleInner {
                pid,
                command_line,
                exec_code_must_be_zero,
                kill_policy,
                started: Instant::now(),
                started_at: Utc::now(),
                cause: AtomicU8::new(CAUSE_NONE),
                exit: OnceLock::new(),
                phase,
                stdin,
                cpu: Mutex::new(None),
            }),
        }
    }

    /// Watch the child until it exits, then run the end sequence
    pub(crate) fn spawn_reaper(
        &self,
        mut child: Child,
        callbacks: Vec<Arc<dyn ExecutionCallback>>,
        registry: Arc<ShutdownRegistry>,
        cleanup_id: CleanupId,
    ) {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            let mut sampling = tokio::time::interval(CPU_SAMPLE_INTERVAL);
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = sampling.tick() => lifecycle.sample_cpu(),
                }
            };
            lifecycle.record_exit(status, &registry, cleanup_id);
            lifecycle.run_end_callbacks(&callbacks);
        });
    }

    fn record_exit(
        &self,
        status: io::Result<ExitStatus>,
        registry: &ShutdownRegistry,
        cleanup_id: CleanupId,
    ) {
        self.claim(TerminationCause::Natural);

        let (code, signal) = match status {
            Ok(status) => (status.code(), exit_signal(&status)),
            Err(e) => {
                warn!(pid = self.pid(), error = %e, "Failed to wait for process");
                (None, None)
            }
        };

        let _ = self.inner.exit.set(ExitRecord {
            code,
            signal,
            ended: Instant::now(),
            ended_at: Utc::now(),
        });
        registry.deregister(cleanup_id);

        info!(
            pid = self.pid(),
            code = ?code,
            signal = ?signal,
            status = %self.end_status(),
            elapsed_ms = self.uptime().as_millis() as u64,
            "Process ended"
        );
        self.inner.phase.send_replace(LifecyclePhase::Exited);
    }

    fn run_end_callbacks(&self, callbacks: &[Arc<dyn ExecutionCallback>]) {
        for callback in callbacks {
            run_guarded("on_end", self, || callback.on_end(self));
        }
        self.inner.phase.send_replace(LifecyclePhase::Finished);
    }

    /// First writer wins
    fn claim(&self, cause: TerminationCause) -> bool {
        self.inner
            .cause
            .compare_exchange(
                CAUSE_NONE,
                encode_cause(cause),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Cause claimed so far, if any
    pub fn termination_cause(&self) -> Option<TerminationCause> {
        decode_cause(self.inner.cause.load(Ordering::Acquire))
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn command_line(&self) -> &CommandLine {
        &self.inner.command_line
    }

    pub fn executable_name(&self) -> String {
        self.inner.command_line.executable_name()
    }

    pub fn exec_code_must_be_zero(&self) -> bool {
        self.inner.exec_code_must_be_zero
    }

    pub fn kill_policy(&self) -> &KillPolicy {
        &self.inner.kill_policy
    }

    /// Stdin of the process
    pub fn stdin(&self) -> &StdinInjection {
        &self.inner.stdin
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.inner.phase.borrow()
    }

    /// True until the exit is recorded
    pub fn is_running(&self) -> bool {
        self.inner.exit.get().is_none()
    }

    pub fn end_status(&self) -> EndStatus {
        EndStatus::classify(
            self.inner.exit.get().map(|record| record.code),
            self.termination_cause(),
            self.inner.exec_code_must_be_zero,
        )
    }

    pub fn is_killed(&self) -> bool {
        self.end_status() == EndStatus::Killed
    }

    pub fn is_too_long_execution_time(&self) -> bool {
        self.end_status() == EndStatus::TooLongExecutionTime
    }

    pub fn is_correctly_done(&self) -> bool {
        self.end_status() == EndStatus::CorrectlyDone
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.exit.get().map(|record| record.ended_at)
    }

    /// Time since the start, frozen at the exit
    pub fn uptime(&self) -> Duration {
        match self.inner.exit.get() {
            Some(record) => record.ended.duration_since(self.inner.started),
            None => self.inner.started.elapsed(),
        }
    }

    /// Exit code, without waiting; `None` while running or after a signal death
    pub fn try_exit_code(&self) -> Option<i32> {
        self.inner.exit.get().and_then(|record| record.code)
    }

    /// Signal that ended the process (Unix only)
    pub fn exit_signal(&self) -> Option<i32> {
        self.inner.exit.get().and_then(|record| record.signal)
    }

    /// Wait for the exit, then return its code
    pub async fn exit_code(&self) -> Option<i32> {
        self.wait_exited().await;
        self.try_exit_code()
    }

    /// User owning the process, while it runs
    pub fn user_exec(&self) -> Option<String> {
        if self.is_running() {
            process_tree::process_user(self.pid())
        } else {
            None
        }
    }

    /// CPU time (user + system) consumed by the process itself
    ///
    /// Read live while the process runs; after the exit, the last value seen
    /// while it was running. `None` where the platform can't tell.
    pub fn cpu_duration(&self) -> Option<Duration> {
        if self.is_running() {
            self.sample_cpu();
        }
        *self.inner.cpu.lock()
    }

    fn sample_cpu(&self) {
        if let Some(cpu) = process_tree::cpu_time(self.pid()) {
            let mut last = self.inner.cpu.lock();
            if last.map_or(true, |previous| cpu > previous) {
                *last = Some(cpu);
            }
        }
    }

    /// Live descendants of the process
    pub fn descendant_pids(&self) -> Vec<u32> {
        if self.is_running() {
            process_tree::descendants(self.pid())
        } else {
            Vec::new()
        }
    }

    async fn wait_phase(&self, target: LifecyclePhase) {
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase >= target).await;
    }

    /// Wait until the exit is recorded; end callbacks may still be running
    pub async fn wait_exited(&self) {
        self.wait_phase(LifecyclePhase::Exited).await
    }

    /// Wait until the exit is recorded and the end callbacks have run
    pub async fn wait_for_end(&self) {
        self.wait_phase(LifecyclePhase::Finished).await
    }

    /// Like [`ProcessLifecycle::wait_for_end`]; false if `timeout` elapsed first
    pub async fn wait_for_end_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_end())
            .await
            .is_ok()
    }

    /// Kill the process and all its descendants
    ///
    /// Does nothing once the process has exited. If a time limit already
    /// claimed the process, waits for that kill instead of starting another.
    pub async fn kill(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        if !self.claim(TerminationCause::Killed) {
            debug!(pid = self.pid(), cause = ?self.termination_cause(), "Process already ending");
            let wait = self.inner.kill_policy.total();
            let _ = tokio::time::timeout(wait, self.wait_exited()).await;
            return Ok(());
        }

        info!(pid = self.pid(), "Killing process");
        self.sample_cpu();
        process_tree::kill_tree(self, &self.inner.kill_policy).await
    }

    /// Called by the time limiter when the limit expires
    pub(crate) async fn stop_too_long(&self, max: Duration) {
        if !self.claim(TerminationCause::TimedOut) {
            debug!(pid = self.pid(), "Time limit reached after the process ended");
            return;
        }

        warn!(
            pid = self.pid(),
            max_ms = max.as_millis() as u64,
            "Execution time limit reached, killing process"
        );
        self.sample_cpu();
        if let Err(e) = process_tree::kill_tree(self, &self.inner.kill_policy).await {
            debug!(pid = self.pid(), error = %e, "Time limit kill incomplete");
        }
    }

    /// Wait for the end and fail unless the process ended correctly
    pub async fn check_execution(&self) -> Result<()> {
        self.wait_for_end().await;
        self.verify(Vec::new())
    }

    /// Like [`ProcessLifecycle::check_execution`], attaching the last stderr lines
    pub async fn check_execution_with(&self, retention: &OutputRetention) -> Result<()> {
        self.wait_for_end().await;
        if self.is_correctly_done() {
            return Ok(());
        }

        let _ = tokio::time::timeout(
            STDERR_DRAIN_WAIT,
            retention.wait_stream_closed(StreamKind::Stderr),
        )
        .await;

        let lines = retention.stderr_lines(true);
        let skip = lines.len().saturating_sub(STDERR_EXCERPT_LINES);
        self.verify(lines.into_iter().skip(skip).collect())
    }

    fn verify(&self, stderr: Vec<String>) -> Result<()> {
        let end_status = self.end_status();
        if end_status == EndStatus::CorrectlyDone {
            return Ok(());
        }
        Err(ProcessError::InvalidExecution {
            command_line: self.inner.command_line.full_command_line(),
            end_status,
            exit_code: self.try_exit_code(),
            stderr,
        })
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

impl fmt::Debug for ProcessLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLifecycle")
            .field("pid", &self.pid())
            .field("command_line", &self.inner.command_line.full_command_line())
            .field("end_status", &self.end_status())
            .finish()
    }
}

impl fmt::Display for ProcessLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} [{}] {}",
            self.executable_name(),
            self.pid(),
            self.end_status(),
            self.inner.command_line.full_command_line()
        )?;
        if let Some(code) = self.try_exit_code() {
            write!(f, " return {code}")?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::callbacks::OnEnd;
    use crate::launcher::ProcessLauncher;
    use proclaunch_cmdline::ExecutableFinder;
    use std::sync::atomic::AtomicUsize;

    fn sh(script: &str) -> ProcessLauncher {
        let cmd = CommandLine::resolve("sh", ["-c", script], &ExecutableFinder::new()).unwrap();
        ProcessLauncher::new(cmd).with_registry(Arc::new(ShutdownRegistry::new()))
    }

    #[tokio::test]
    async fn test_natural_exit() {
        let lifecycle = sh("exit 0").start().await.unwrap();
        lifecycle.wait_for_end().await;

        assert!(!lifecycle.is_running());
        assert_eq!(lifecycle.phase(), LifecyclePhase::Finished);
        assert_eq!(lifecycle.end_status(), EndStatus::CorrectlyDone);
        assert_eq!(lifecycle.termination_cause(), Some(TerminationCause::Natural));
        assert_eq!(lifecycle.exit_code().await, Some(0));
        assert!(lifecycle.ended_at().unwrap() >= lifecycle.started_at());
        lifecycle.check_execution().await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_policy() {
        let lifecycle = sh("exit 3").start().await.unwrap();
        lifecycle.wait_for_end().await;
        assert_eq!(lifecycle.end_status(), EndStatus::DoneWithError);

        let err = lifecycle.check_execution().await.unwrap_err();
        match err {
            ProcessError::InvalidExecution {
                end_status,
                exit_code,
                ..
            } => {
                assert_eq!(end_status, EndStatus::DoneWithError);
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }

        let lifecycle = sh("exit 3")
            .exec_code_must_be_zero(false)
            .start()
            .await
            .unwrap();
        lifecycle.wait_for_end().await;
        assert_eq!(lifecycle.end_status(), EndStatus::CorrectlyDone);
        assert_eq!(lifecycle.try_exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let lifecycle = sh("exec sleep 30").start().await.unwrap();
        assert_eq!(lifecycle.end_status(), EndStatus::NotYetDone);

        lifecycle.kill().await.unwrap();
        lifecycle.kill().await.unwrap();
        assert!(lifecycle.wait_for_end_timeout(Duration::from_secs(5)).await);

        assert_eq!(lifecycle.end_status(), EndStatus::Killed);
        assert!(lifecycle.is_killed());
        assert!(!lifecycle.is_correctly_done());
        assert_eq!(lifecycle.try_exit_code(), None);
        assert_eq!(lifecycle.exit_signal(), Some(15));

        // no effect after the end
        lifecycle.kill().await.unwrap();
        assert_eq!(lifecycle.end_status(), EndStatus::Killed);
    }

    #[tokio::test]
    async fn test_end_callbacks_run_once_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let order = Arc::clone(&order);
            let calls = Arc::clone(&calls);
            OnEnd(move |lc: &ProcessLifecycle| {
                assert!(!lc.is_running());
                calls.fetch_add(1, Ordering::SeqCst);
                order.lock().push("first");
            })
        };
        let panicking = OnEnd(|_: &ProcessLifecycle| panic!("callback failure"));
        let second = {
            let order = Arc::clone(&order);
            OnEnd(move |_: &ProcessLifecycle| order.lock().push("second"))
        };

        let lifecycle = sh("exit 0")
            .with_callback(Arc::new(first))
            .with_callback(Arc::new(panicking))
            .with_callback(Arc::new(second))
            .start()
            .await
            .unwrap();
        lifecycle.wait_for_end().await;
        lifecycle.wait_for_end().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_registry_tracks_running_process() {
        let registry = Arc::new(ShutdownRegistry::new());
        let cmd = CommandLine::resolve("sh", ["-c", "sleep 30"], &ExecutableFinder::new()).unwrap();
        let lifecycle = ProcessLauncher::new(cmd)
            .with_registry(Arc::clone(&registry))
            .start()
            .await
            .unwrap();

        assert_eq!(registry.pids(), vec![lifecycle.pid()]);
        lifecycle.kill().await.unwrap();
        lifecycle.wait_for_end().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_display_and_queries() {
        let lifecycle = sh("sleep 30").start().await.unwrap();
        assert!(lifecycle.uptime() < Duration::from_secs(30));
        assert!(lifecycle.to_string().starts_with(&format!("sh#{}", lifecycle.pid())));
        assert!(lifecycle.user_exec().is_some());

        lifecycle.kill().await.unwrap();
        lifecycle.wait_for_end().await;
        let frozen = lifecycle.uptime();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lifecycle.uptime(), frozen);
        assert!(lifecycle.descendant_pids().is_empty());
        assert!(lifecycle.user_exec().is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cpu_duration_survives_the_exit() {
        let lifecycle = sh("while true; do :; done").start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut cpu = None;
        while Instant::now() < deadline {
            cpu = lifecycle.cpu_duration().filter(|d| *d > Duration::ZERO);
            if cpu.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let running_cpu = cpu.unwrap();

        lifecycle.kill().await.unwrap();
        lifecycle.wait_for_end().await;
        assert!(lifecycle.cpu_duration().unwrap() >= running_cpu);
    }
}
