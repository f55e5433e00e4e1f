//! Classified outcome of a supervised process

use std::fmt;

use serde::{Deserialize, Serialize};

/// What ended the process, claimed once by the first event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationCause {
    /// The process exited by itself
    Natural,
    /// A caller asked for the kill
    Killed,
    /// The execution time limit expired
    TimedOut,
}

/// End status of a process; exactly one holds at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndStatus {
    NotYetDone,
    CorrectlyDone,
    DoneWithError,
    Killed,
    TooLongExecutionTime,
}

impl EndStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EndStatus::NotYetDone => "not_yet_done",
            EndStatus::CorrectlyDone => "correctly_done",
            EndStatus::DoneWithError => "done_with_error",
            EndStatus::Killed => "killed",
            EndStatus::TooLongExecutionTime => "too_long_execution_time",
        }
    }

    /// True once the process has exited, whatever the reason
    pub fn is_done(self) -> bool {
        self != EndStatus::NotYetDone
    }

    /// Classify from the exit record and the claimed cause
    ///
    /// `exit` is `None` while the process is alive, `Some(code)` once it has
    /// exited (`code` is `None` for a signal death).
    pub(crate) fn classify(
        exit: Option<Option<i32>>,
        cause: Option<TerminationCause>,
        exec_code_must_be_zero: bool,
    ) -> Self {
        let Some(code) = exit else {
            return EndStatus::NotYetDone;
        };
        match cause {
            Some(TerminationCause::Killed) => EndStatus::Killed,
            Some(TerminationCause::TimedOut) => EndStatus::TooLongExecutionTime,
            _ if exec_code_must_be_zero && code != Some(0) => EndStatus::DoneWithError,
            _ => EndStatus::CorrectlyDone,
        }
    }
}

impl fmt::Display for EndStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
