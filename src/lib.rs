//! Media Downloader - Core Library
//!
//! Concurrent media downloads driven by yt-dlp with format selection,
//! pause/resume/cancel control and ffmpeg remuxing.

pub mod commands;
pub mod core;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::{AppConfig, ConfigStore},
    models::{AppError, AppResult, DownloadJob, JobRequest, JobState, OutputFormat, Resolution},
    pool::PoolEvent,
    runtime::{spawn_pool, PoolHandle, PoolSettings},
};
