//! Core business logic module
//!
//! This module contains the domain models, the job pool and its workers,
//! and the adapters around the external extraction and remux tools.

pub mod config;
pub mod control;
pub mod extraction;
pub mod format_selector;
pub mod models;
pub mod naming;
pub mod network_probe;
pub mod pool;
pub mod remux;
pub mod runtime;
pub mod worker;
pub mod ytdlp;

#[cfg(test)]
pub(crate) mod test_support;



#[cfg(test)]
mod integration_tests;

// Re-export commonly used types
pub use config::{AppConfig, ConfigStore};
pub use models::{AppError, AppResult, DownloadJob, JobRequest, JobState, OutputFormat, Resolution};
pub use pool::PoolEvent;
pub use runtime::{spawn_pool, PoolHandle, PoolSettings};
