//! # proclaunch-process
//!
//! **Purpose**: Supervision of external processes
//!
//! Starts a process from a [`CommandLine`](proclaunch_cmdline::CommandLine),
//! drains its output line by line, enforces a maximum execution time and makes
//! sure the process and all its descendants are gone on timeout, explicit kill
//! or host shutdown.
//!
//! ## Features
//!
//! - **Lifecycle tracking**: classified end status, exit code, timestamps
//! - **Tree kill**: graceful then forced signals to every descendant and the root
//! - **Time limits**: timer racing the natural exit
//! - **Output capture**: observers for retention, printing and interactive replies
//! - **Stdin injection**: non-blocking writes to the process input
//! - **Shutdown cleanup**: leftover trees killed when the host exits or gets ctrl-c/SIGTERM
//! - **Tool runner**: bounded-parallel start of resolved tools with retained output
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use proclaunch_cmdline::{CommandLine, ExecutableFinder};
//! use proclaunch_process::{
//!     CaptureScope, ExecutionTimeLimiter, OutputCapture, OutputRetention, ProcessLauncher,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cmd = CommandLine::resolve("ffmpeg", ["-hide_banner", "-i", "in.mkv"], &ExecutableFinder::new())?;
//!
//! let retention = Arc::new(OutputRetention::new(CaptureScope::Both));
//! let capture = OutputCapture::new(CaptureScope::Both).with_observer(retention.clone());
//!
//! let lifecycle = ProcessLauncher::new(cmd)
//!     .with_capture(Arc::new(capture))
//!     .with_time_limiter(ExecutionTimeLimiter::new(Duration::from_secs(30))?)
//!     .start()
//!     .await?;
//!
//! lifecycle.check_execution_with(&retention).await?;
//! println!("{}", retention.stderr_text(false));
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod capture;
pub mod end_status;
pub mod environment;
pub mod error;
pub mod exec;
pub mod launcher;
pub mod lifecycle;
pub mod limiter;
pub mod process_tree;
pub mod settings;
pub mod shortcuts;
pub mod shutdown;
pub mod stdin;
pub mod tool;

pub use callbacks::{ExecutionCallback, OnEnd, PostStartup};
pub use capture::{
    CaptureObserver, CaptureScope, InteractiveObserver, LineEntry, OutputCapture, OutputRetention,
    PrintObserver, StreamClosed, StreamKind, StreamOutcome,
};
pub use end_status::{EndStatus, TerminationCause};
pub use environment::Environment;
pub use error::{ProcessError, Result};
pub use exec::{Exec, RunningExec};
pub use launcher::{ProcessLauncher, ProcessStartup};
pub use lifecycle::{LifecyclePhase, ProcessLifecycle};
pub use limiter::ExecutionTimeLimiter;
pub use settings::{KillPolicy, LauncherSettings};
pub use shortcuts::LifecycleShortcuts;
pub use shutdown::{CleanupId, ShutdownGuard, ShutdownRegistry};
pub use stdin::StdinInjection;
pub use tool::{ExecutableTool, RunningTool, ToolRunner};
