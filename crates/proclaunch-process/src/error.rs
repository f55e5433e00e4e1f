//! Error types for process supervision

use std::io;
use std::path::PathBuf;

use proclaunch_cmdline::CmdlineError;
use thiserror::Error;

use crate::capture::StreamKind;
use crate::end_status::EndStatus;

/// Process supervision errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to start the process
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Working directory is missing or not a directory
    #[error("Invalid working directory: {}", path.display())]
    InvalidWorkingDirectory { path: PathBuf },

    /// The process did not end correctly
    #[error(
        "Can't execute correctly {command_line}; {end_status} [{}]",
        fmt_exit_code(exit_code)
    )]
    InvalidExecution {
        command_line: String,
        end_status: EndStatus,
        exit_code: Option<i32>,
        /// Last stderr lines, when they were captured
        stderr: Vec<String>,
    },

    /// Processes still alive after the forced signal
    #[error("Can't kill processes {pids:?}")]
    Unkillable { pids: Vec<u32> },

    /// A line arrived for a stream already reported closed
    #[error("Can't add a {stream} line after the stream was closed")]
    LineAfterStreamClosed { stream: StreamKind },

    /// Maximum execution time must be positive
    #[error("Max execution time can't be zero")]
    InvalidTimeLimit,

    /// The stdin writer has stopped
    #[error("Stdin of process {pid} is closed")]
    StdinClosed { pid: u32 },

    /// The tool runner no longer accepts tools
    #[error("Tool runner is closed")]
    ToolRunnerClosed,

    /// Launcher settings could not be parsed
    #[error("Invalid launcher settings: {0}")]
    Settings(#[from] toml::de::Error),

    /// Host signal handler could not be installed
    #[error("Failed to install signal handler: {0}")]
    SignalHandler(#[from] ctrlc::Error),

    #[error(transparent)]
    Cmdline(#[from] CmdlineError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code".to_string(), |c| c.to_string())
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
