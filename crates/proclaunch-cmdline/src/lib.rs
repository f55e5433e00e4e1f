//! # proclaunch-cmdline
//!
//! **Purpose**: Command-line construction for supervised processes
//!
//! ## Features
//!
//! - **Parameter templates**: token lists with `<%name%>` placeholders
//! - **Orphan flag dropping**: `-flag <%missing%>` disappears as a pair
//! - **Parameter editing**: lookup, alter and remove by key
//! - **Executable lookup**: registered names, extra search dirs, `PATH`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use proclaunch_cmdline::{CommandLine, ExecutableFinder, Parameters};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let template = Parameters::parse("-i <%input%> -codec copy <%output%>");
//!
//! let mut vars = HashMap::new();
//! vars.insert("input".to_string(), "in.mkv".to_string());
//! vars.insert("output".to_string(), "out.mp4".to_string());
//!
//! let cmd = CommandLine::from_template("ffmpeg", &template, &ExecutableFinder::new(), &vars, true)?;
//! println!("{}", cmd.full_command_line());
//! # Ok(())
//! # }
//! ```

pub mod command_line;
pub mod error;
pub mod finder;
pub mod parameters;

pub use command_line::CommandLine;
pub use error::{CmdlineError, Result};
pub use finder::{is_executable, ExecutableFinder, SEARCH_DIRS_ENV};
pub use parameters::{tokenize, Parameters};
