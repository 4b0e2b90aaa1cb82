//! Command handlers
//!
//! Terminal front end: argument parsing, prompts, dependency checks and the
//! download flow itself.

pub mod cli;
pub mod download;
pub mod prompt;
pub mod system;

pub use cli::Cli;
pub use download::run;
pub use system::{check_dependencies, cleanup_folder, ToolStatus};
