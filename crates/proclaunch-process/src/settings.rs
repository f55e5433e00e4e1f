//! Launcher settings and kill escalation policy

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureScope;
use crate::environment::DEFAULT_LANG;
use crate::error::Result;
use crate::limiter::ExecutionTimeLimiter;

/// Delay between the graceful and the forced signal
pub const DEFAULT_KILL_GRACE_MS: u64 = 200;
/// Wait for processes to disappear after the forced signal
pub const DEFAULT_KILL_FORCE_WAIT_MS: u64 = 5_000;
/// Liveness polling step while escalating
pub const DEFAULT_KILL_POLL_MS: u64 = 10;

/// How a process tree is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillPolicy {
    /// Wait after the graceful signal before forcing
    pub grace: Duration,
    /// Wait after the forced signal before giving up
    pub force_wait: Duration,
    /// Liveness polling step
    pub poll_interval: Duration,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            force_wait: Duration::from_millis(DEFAULT_KILL_FORCE_WAIT_MS),
            poll_interval: Duration::from_millis(DEFAULT_KILL_POLL_MS),
        }
    }
}

impl KillPolicy {
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_force_wait(mut self, force_wait: Duration) -> Self {
        self.force_wait = force_wait;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Longest time a full escalation on one process can take
    pub fn total(&self) -> Duration {
        self.grace + self.force_wait
    }
}

/// Serializable launcher defaults
///
/// ```toml
/// exec_code_must_be_zero = true
/// max_exec_time_ms = 30000
/// capture = "both"
/// kill_grace_ms = 200
/// kill_force_wait_ms = 5000
/// default_lang = "en_US.UTF-8"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    /// A nonzero exit code means `DoneWithError`
    pub exec_code_must_be_zero: bool,
    /// Time limit, none when absent
    pub max_exec_time_ms: Option<u64>,
    /// Capture scope for launchers without a capture engine
    pub capture: Option<CaptureScope>,
    pub kill_grace_ms: u64,
    pub kill_force_wait_ms: u64,
    /// `LANG` value used when the host has none
    pub default_lang: String,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            exec_code_must_be_zero: true,
            max_exec_time_ms: None,
            capture: None,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            kill_force_wait_ms: DEFAULT_KILL_FORCE_WAIT_MS,
            default_lang: DEFAULT_LANG.to_string(),
        }
    }
}

impl LauncherSettings {
    /// Parse settings from TOML; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn kill_policy(&self) -> KillPolicy {
        KillPolicy::default()
            .with_grace(Duration::from_millis(self.kill_grace_ms))
            .with_force_wait(Duration::from_millis(self.kill_force_wait_ms))
    }

    /// Time limiter for `max_exec_time_ms`, fails on zero
    pub fn time_limiter(&self) -> Result<Option<ExecutionTimeLimiter>> {
        self.max_exec_time_ms
            .map(|ms| ExecutionTimeLimiter::new(Duration::from_millis(ms)))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = LauncherSettings::default();
        assert!(settings.exec_code_must_be_zero);
        assert_eq!(settings.kill_policy(), KillPolicy::default());
        assert!(settings.time_limiter().unwrap().is_none());
        assert_eq!(KillPolicy::default().total(), Duration::from_millis(5_200));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = LauncherSettings::from_toml_str(
            r#"
            max_exec_time_ms = 1500
            capture = "stderr_only"
            kill_grace_ms = 50
            "#,
        )
        .unwrap();

        assert!(settings.exec_code_must_be_zero);
        assert_eq!(settings.capture, Some(CaptureScope::StderrOnly));
        assert_eq!(settings.kill_policy().grace, Duration::from_millis(50));
        assert_eq!(
            settings.kill_policy().force_wait,
            Duration::from_millis(DEFAULT_KILL_FORCE_WAIT_MS)
        );
        let limiter = settings.time_limiter().unwrap().unwrap();
        assert_eq!(limiter.max_exec_time(), Duration::from_millis(1500));
    }

    #[test]
    fn test_zero_time_limit_rejected() {
        let settings = LauncherSettings::from_toml_str("max_exec_time_ms = 0").unwrap();
        assert!(matches!(
            settings.time_limiter(),
            Err(ProcessError::InvalidTimeLimit)
        ));
    }

    #[test]
    fn test_invalid_toml() {
        let err = LauncherSettings::from_toml_str("capture = \"sideways\"").unwrap_err();
        assert!(matches!(err, ProcessError::Settings(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("launcher.toml");
        std::fs::write(&path, "exec_code_must_be_zero = false\ndefault_lang = \"C\"\n").unwrap();

        let settings = LauncherSettings::load(&path).unwrap();
        assert!(!settings.exec_code_must_be_zero);
        assert_eq!(settings.default_lang, "C");

        let missing = LauncherSettings::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ProcessError::Io(_))));
    }
}
