//! Error types for command-line construction

use std::path::PathBuf;

use thiserror::Error;

/// Command-line construction errors
#[derive(Debug, Error)]
pub enum CmdlineError {
    /// A variable tag was configured empty
    #[error("Variable tag can't be empty ({which} tag)")]
    EmptyVarTag {
        /// `"start"` or `"end"`
        which: &'static str,
    },

    /// The executable name could not be resolved in any search directory
    #[error("Can't find executable \"{name}\"")]
    ExecutableNotFound { name: String },

    /// The path exists but is not an executable regular file
    #[error("Not an executable file: {}", path.display())]
    NotExecutable { path: PathBuf },

    /// The key prefix was configured empty
    #[error("Parameter key prefix can't be empty")]
    EmptyKeyPrefix,
}

/// Result type for command-line operations
pub type Result<T> = std::result::Result<T, CmdlineError>;
