//! Application configuration management
//!
//! The configuration lives in a small INI file with a single
//! `[DownloadOptions]` section. The file is created on first run from a
//! one-shot throughput probe; afterwards it is only read, until a front end
//! changes a value through [`ConfigStore::update`].

use anyhow::{Context, Result};
use config::{Config, File, FileFormat, Map, Value};
use directories::{BaseDirs, ProjectDirs};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::models::{AppError, AppResult};
use crate::core::network_probe::ThroughputProbe;
use crate::utils::file_utils::ensure_dir_exists;

pub const CONFIG_FILE_NAME: &str = "download_config.ini";
pub const CONFIG_SECTION: &str = "DownloadOptions";

pub const FRAGMENT_BOUNDS: RangeInclusive<u32> = 1..=32;
pub const CHUNK_SIZE_BOUNDS: RangeInclusive<u64> = 64 * 1024..=64 * 1024 * 1024;
pub const PARALLEL_JOB_BOUNDS: RangeInclusive<usize> = 1..=32;

const KEY_FOLDER: &str = "download_folder";
const KEY_FRAGMENTS: &str = "concurrent_fragment_downloads";
const KEY_CHUNK_SIZE: &str = "http_chunk_size";
const KEY_PARALLEL_JOBS: &str = "max_parallel_jobs";

/// Download options shared by every job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub download_folder: PathBuf,
    pub concurrent_fragment_downloads: u32,
    /// Bytes per HTTP range request
    pub http_chunk_size: u64,
    /// Worker cap; falls back to the fragment count when unset
    pub max_parallel_jobs: Option<usize>,
}

/// Fragment concurrency and chunk size derived from measured throughput
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkTuning {
    pub concurrent_fragment_downloads: u32,
    pub http_chunk_size: u64,
}

impl NetworkTuning {
    pub const FAST: NetworkTuning = NetworkTuning {
        concurrent_fragment_downloads: 10,
        http_chunk_size: 4_194_304,
    };
    pub const MEDIUM: NetworkTuning = NetworkTuning {
        concurrent_fragment_downloads: 5,
        http_chunk_size: 2_097_152,
    };
    pub const SLOW: NetworkTuning = NetworkTuning {
        concurrent_fragment_downloads: 3,
        http_chunk_size: 1_048_576,
    };

    /// Tier for a link speed in MB/s
    pub fn from_throughput(mbps: f64) -> Self {
        if mbps >= 5.0 {
            Self::FAST
        } else if mbps >= 2.0 {
            Self::MEDIUM
        } else {
            Self::SLOW
        }
    }
}

impl AppConfig {
    pub fn with_tuning(download_folder: PathBuf, tuning: NetworkTuning) -> Self {
        Self {
            download_folder,
            concurrent_fragment_downloads: tuning.concurrent_fragment_downloads,
            http_chunk_size: tuning.http_chunk_size,
            max_parallel_jobs: None,
        }
    }

    /// Number of jobs allowed to hold a worker at once
    pub fn worker_slots(&self) -> usize {
        self.max_parallel_jobs
            .unwrap_or(self.concurrent_fragment_downloads as usize)
            .max(1)
    }

    /// Validate configuration values
    pub fn validate(&self) -> AppResult<()> {
        if self.download_folder.as_os_str().is_empty() {
            return Err(AppError::Config("download_folder must not be empty".into()));
        }
        if !FRAGMENT_BOUNDS.contains(&self.concurrent_fragment_downloads) {
            return Err(AppError::Config(format!(
                "{} must be between {} and {}",
                KEY_FRAGMENTS,
                FRAGMENT_BOUNDS.start(),
                FRAGMENT_BOUNDS.end()
            )));
        }
        if !CHUNK_SIZE_BOUNDS.contains(&self.http_chunk_size) {
            return Err(AppError::Config(format!(
                "{} must be between {} and {} bytes",
                KEY_CHUNK_SIZE,
                CHUNK_SIZE_BOUNDS.start(),
                CHUNK_SIZE_BOUNDS.end()
            )));
        }
        if let Some(jobs) = self.max_parallel_jobs {
            if !PARALLEL_JOB_BOUNDS.contains(&jobs) {
                return Err(AppError::Config(format!(
                    "{} must be between {} and {}",
                    KEY_PARALLEL_JOBS,
                    PARALLEL_JOB_BOUNDS.start(),
                    PARALLEL_JOB_BOUNDS.end()
                )));
            }
        }
        Ok(())
    }

    /// Pull hand-edited values back into range, warning about each one
    pub fn clamp_to_bounds(&mut self) {
        let fragments = clamp_logged(
            KEY_FRAGMENTS,
            self.concurrent_fragment_downloads,
            &FRAGMENT_BOUNDS,
        );
        self.concurrent_fragment_downloads = fragments;
        self.http_chunk_size = clamp_logged(KEY_CHUNK_SIZE, self.http_chunk_size, &CHUNK_SIZE_BOUNDS);
        self.max_parallel_jobs = self
            .max_parallel_jobs
            .map(|jobs| clamp_logged(KEY_PARALLEL_JOBS, jobs, &PARALLEL_JOB_BOUNDS));
    }

    /// Build from a parsed `[DownloadOptions]` table. Missing or malformed
    /// keys fall back to the slow tier and the home folder.
    fn from_section(section: &Map<String, Value>, home: &Path) -> Self {
        let mut config = Self::with_tuning(home.to_path_buf(), NetworkTuning::SLOW);

        if let Some(folder) = lookup(section, KEY_FOLDER) {
            let folder = folder.trim();
            if !folder.is_empty() {
                config.download_folder = expand_home(folder, home);
            }
        }
        if let Some(value) = parse_key::<u32>(section, KEY_FRAGMENTS) {
            config.concurrent_fragment_downloads = value;
        }
        if let Some(value) = parse_key::<u64>(section, KEY_CHUNK_SIZE) {
            config.http_chunk_size = value;
        }
        config.max_parallel_jobs = parse_key::<usize>(section, KEY_PARALLEL_JOBS);

        config.clamp_to_bounds();
        config
    }

    fn to_ini(&self) -> String {
        let folder = self.download_folder.to_string_lossy().replace('\\', "\\\\");
        let mut out = format!(
            "[{}]\n{} = {}\n{} = {}\n{} = {}\n",
            CONFIG_SECTION,
            KEY_FOLDER,
            folder,
            KEY_FRAGMENTS,
            self.concurrent_fragment_downloads,
            KEY_CHUNK_SIZE,
            self.http_chunk_size
        );
        if let Some(jobs) = self.max_parallel_jobs {
            out.push_str(&format!("{} = {}\n", KEY_PARALLEL_JOBS, jobs));
        }
        out
    }
}

fn clamp_logged<T>(key: &str, value: T, bounds: &RangeInclusive<T>) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if value < *bounds.start() {
        warn!("⚠️ {} = {} is below {}, clamping", key, value, bounds.start());
        *bounds.start()
    } else if value > *bounds.end() {
        warn!("⚠️ {} = {} is above {}, clamping", key, value, bounds.end());
        *bounds.end()
    } else {
        value
    }
}

fn lookup(section: &Map<String, Value>, key: &str) -> Option<String> {
    section
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .and_then(|(_, value)| value.clone().into_string().ok())
}

fn parse_key<T: std::str::FromStr>(section: &Map<String, Value>, key: &str) -> Option<T> {
    let raw = lookup(section, key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring malformed {} = {:?}", key, raw);
            None
        }
    }
}

fn expand_home(folder: &str, home: &Path) -> PathBuf {
    match folder.strip_prefix('~') {
        Some(rest) if rest.is_empty() => home.to_path_buf(),
        Some(rest) if rest.starts_with('/') || rest.starts_with('\\') => home.join(&rest[1..]),
        _ => PathBuf::from(folder),
    }
}

fn home_dir() -> AppResult<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| AppError::Config("Unable to determine the home directory".into()))
}

/// What a read of the configuration file found
enum ReadOutcome {
    Missing,
    NoSection,
    Loaded(AppConfig),
}

fn read_config_file(path: &Path, home: &Path) -> Result<ReadOutcome> {
    if !path.exists() {
        return Ok(ReadOutcome::Missing);
    }

    let settings = Config::builder()
        .add_source(File::from(path).format(FileFormat::Ini))
        .build()
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let sections: HashMap<String, Value> = settings
        .try_deserialize()
        .with_context(|| format!("Unexpected layout in config file: {:?}", path))?;

    let section = sections
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(CONFIG_SECTION))
        .map(|(_, value)| value.into_table())
        .transpose()
        .with_context(|| format!("[{}] is not a section", CONFIG_SECTION))?;

    Ok(match section {
        Some(table) => ReadOutcome::Loaded(AppConfig::from_section(&table, home)),
        None => ReadOutcome::NoSection,
    })
}

fn write_config_file(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    std::fs::write(path, config.to_ini())
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Saved configuration to: {:?}", path);
    Ok(())
}

/// Owner of the loaded configuration
///
/// Reads are concurrent; `update` serialises writers so two front-end
/// changes never interleave on disk.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<AppConfig>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load the configuration at `path`, creating it on first run.
    ///
    /// The probe runs only when the file or its section is missing. A file
    /// that cannot be parsed is left untouched and defaults are used for
    /// this session.
    pub async fn load_or_create(
        path: impl Into<PathBuf>,
        probe: &dyn ThroughputProbe,
    ) -> AppResult<Self> {
        let path = path.into();
        let home = home_dir()?;

        let config = match read_config_file(&path, &home) {
            Ok(ReadOutcome::Loaded(config)) => {
                info!("Loaded configuration from: {:?}", path);
                config
            }
            Ok(outcome) => {
                if matches!(outcome, ReadOutcome::NoSection) {
                    warn!("No [{}] section in {:?}, recreating it", CONFIG_SECTION, path);
                }
                let speed = probe.measure().await;
                let config =
                    AppConfig::with_tuning(home.clone(), NetworkTuning::from_throughput(speed));
                if let Err(err) = write_config_file(&path, &config) {
                    warn!("⚠️ Could not persist configuration: {:#}", err);
                }
                info!(
                    "Created configuration ({} fragments, {} byte chunks)",
                    config.concurrent_fragment_downloads, config.http_chunk_size
                );
                config
            }
            Err(err) => {
                warn!("⚠️ {:#}; using defaults for this session", err);
                AppConfig::with_tuning(home.clone(), NetworkTuning::SLOW)
            }
        };

        Ok(Self {
            path,
            current: RwLock::new(config),
            write_lock: Mutex::new(()),
        })
    }

    /// `<platform config dir>/download_config.ini`
    pub fn default_path() -> AppResult<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "media-dl", "media-dl")
            .ok_or_else(|| AppError::Config("Failed to get project directories".into()))?;
        Ok(project_dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current values
    pub fn config(&self) -> AppConfig {
        self.current.read().clone()
    }

    pub fn worker_slots(&self) -> usize {
        self.current.read().worker_slots()
    }

    /// Configured download folder, created when missing
    pub fn get_download_folder(&self) -> AppResult<PathBuf> {
        let folder = self.current.read().download_folder.clone();
        ensure_dir_exists(&folder)?;
        Ok(folder)
    }

    /// Apply a change, validate it and persist it.
    ///
    /// On a validation or write error the in-memory values stay unchanged.
    pub async fn update<F>(&self, change: F) -> AppResult<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let _guard = self.write_lock.lock().await;

        let mut next = self.config();
        change(&mut next);
        next.validate()?;

        write_config_file(&self.path, &next)
            .map_err(|e| AppError::Config(format!("{:#}", e)))?;

        *self.current.write() = next.clone();
        debug!("Configuration updated: {:?}", next);
        Ok(next)
    }
}
