//! Executable lookup across a search path

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{CmdlineError, Result};

/// Environment variable holding extra search directories (platform path-list syntax)
pub const SEARCH_DIRS_ENV: &str = "PROCLAUNCH_SEARCH_DIRS";

#[cfg(windows)]
const PATH_LIST_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_LIST_SEPARATOR: &str = ":";

/// Extensions stripped from executable names on Windows
pub const WINDOWS_EXEC_EXTENSIONS: [&str; 4] = ["exe", "com", "cmd", "bat"];

/// True if `path` is a regular file the current user may execute
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = path.metadata() else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolves executable names to absolute paths
///
/// Lookup order:
/// 1. executables registered with [`ExecutableFinder::register`]
/// 2. the name itself, when it is a path to an executable
/// 3. directories listed in `PROCLAUNCH_SEARCH_DIRS`
/// 4. directories added with [`ExecutableFinder::add_path`], latest first
/// 5. `~/bin`, `~/App/bin`, the current directory
/// 6. `PATH`
#[derive(Debug, Clone, Default)]
pub struct ExecutableFinder {
    registered: HashMap<String, PathBuf>,
    added_paths: Vec<PathBuf>,
}

impl ExecutableFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a search directory, searched before the previously added ones
    pub fn add_path(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        let dir = dir.into();
        trace!(dir = %dir.display(), "Add executable search dir");
        self.added_paths.insert(0, dir);
        self
    }

    /// Builder variant of [`ExecutableFinder::add_path`]
    pub fn with_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.add_path(dir);
        self
    }

    /// Pin `name` to an explicit executable
    pub fn register(&mut self, name: &str, path: impl Into<PathBuf>) -> Result<&mut Self> {
        let path = path.into();
        if !is_executable(&path) {
            return Err(CmdlineError::NotExecutable { path });
        }
        debug!(name, path = %path.display(), "Registered executable");
        self.registered.insert(name.to_string(), path);
        Ok(self)
    }

    /// Resolve `name` to an executable path
    pub fn get(&self, name: &str) -> Result<PathBuf> {
        if let Some(path) = self.registered.get(name) {
            return Ok(path.clone());
        }

        let direct = Path::new(name);
        if direct.components().count() > 1 && is_executable(direct) {
            return Ok(direct.to_path_buf());
        }

        let search_path = self.full_path_string();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        match which::which_in(name, Some(search_path), cwd) {
            Ok(found) => {
                trace!(name, path = %found.display(), "Resolved executable");
                Ok(found)
            }
            Err(e) => {
                debug!(name, error = %e, "Executable lookup failed");
                Err(CmdlineError::ExecutableNotFound {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Ordered, de-duplicated search directories
    pub fn full_path(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();

        if let Some(extra) = std::env::var_os(SEARCH_DIRS_ENV) {
            dirs.extend(std::env::split_paths(&extra));
        }

        dirs.extend(self.added_paths.iter().cloned());

        if let Some(home) = dirs::home_dir() {
            dirs.push(home.join("bin"));
            dirs.push(home.join("App").join("bin"));
        }

        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }

        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }

        let mut unique = Vec::with_capacity(dirs.len());
        for dir in dirs {
            if !dir.as_os_str().is_empty() && !unique.contains(&dir) {
                unique.push(dir);
            }
        }
        unique
    }

    /// Search directories joined with the platform separator
    ///
    /// Suitable as a child `PATH` value.
    pub fn full_path_string(&self) -> String {
        self.full_path()
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(PATH_LIST_SEPARATOR)
    }
}
