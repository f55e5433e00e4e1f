//! Frozen executable + argument list

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CmdlineError, Result};
use crate::finder::{is_executable, ExecutableFinder, WINDOWS_EXEC_EXTENSIONS};
use crate::parameters::Parameters;

/// Immutable command line: a validated executable and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    executable: PathBuf,
    parameters: Vec<String>,
}

impl CommandLine {
    /// Create a command line for an explicit executable path
    pub fn new<I, S>(executable: impl Into<PathBuf>, parameters: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let executable = executable.into();
        if !is_executable(&executable) {
            return Err(CmdlineError::NotExecutable { path: executable });
        }
        Ok(Self {
            executable,
            parameters: parameters.into_iter().map(Into::into).collect(),
        })
    }

    /// Create a command line, resolving `name` with `finder`
    pub fn resolve<I, S>(name: &str, parameters: I, finder: &ExecutableFinder) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let executable = finder.get(name)?;
        Self::new(executable, parameters)
    }

    /// Resolve `name` and freeze `template` with `vars` injected
    ///
    /// The template itself is left untouched.
    pub fn from_template(
        name: &str,
        template: &Parameters,
        finder: &ExecutableFinder,
        vars: &HashMap<String, String>,
        drop_orphan_flag: bool,
    ) -> Result<Self> {
        let resolved = template.duplicate().inject_vars(vars, drop_orphan_flag);
        Self::resolve(name, resolved.into_tokens(), finder)
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Executable file name, without a Windows executable extension
    pub fn executable_name(&self) -> String {
        let file_name = self
            .executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if cfg!(windows) {
            if let Some((stem, ext)) = file_name.rsplit_once('.') {
                let ext = ext.to_ascii_lowercase();
                if WINDOWS_EXEC_EXTENSIONS.contains(&ext.as_str()) {
                    return stem.to_string();
                }
            }
        }
        file_name
    }

    /// Diagnostic rendering; tokens containing a space are double-quoted
    pub fn full_command_line(&self) -> String {
        std::iter::once(self.executable.to_string_lossy().into_owned())
            .chain(self.parameters.iter().cloned())
            .map(|token| {
                if token.contains(' ') {
                    format!("\"{token}\"")
                } else {
                    token
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_command_line())
    }
}
