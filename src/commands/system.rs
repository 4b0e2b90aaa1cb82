//! System command handlers
//!
//! External tool checks and download-folder housekeeping.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::models::{AppError, AppResult};
use crate::core::remux::{self, FFMPEG_BINARY};
use crate::core::ytdlp::{self, YtDlpBackend, YTDLP_BINARY};
use crate::utils::file_utils::cleanup_download_folder;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Presence of one external tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolStatus {
    pub name: &'static str,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub install_hint: String,
}

impl ToolStatus {
    pub fn is_available(&self) -> bool {
        self.path.is_some()
    }
}

pub fn ytdlp_install_hint() -> String {
    match std::env::consts::OS {
        "macos" if which::which("brew").is_ok() => "brew install yt-dlp".to_string(),
        "windows" if which::which("winget").is_ok() => "winget install yt-dlp.yt-dlp".to_string(),
        _ => "python3 -m pip install -U yt-dlp (or see https://github.com/yt-dlp/yt-dlp#installation)"
            .to_string(),
    }
}

/// First line of `<binary> <flag>`, bounded by a timeout
async fn tool_version(binary: &Path, flag: &str) -> AppResult<String> {
    let run = tokio::process::Command::new(binary)
        .arg(flag)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(VERSION_TIMEOUT, run)
        .await
        .map_err(|_| AppError::System(format!("{} {} timed out", binary.display(), flag)))??;

    if !output.status.success() {
        return Err(AppError::System(format!(
            "{} {} exited with {}",
            binary.display(),
            flag,
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

pub async fn check_ytdlp() -> ToolStatus {
    info!("📺 Checking yt-dlp availability");
    let path = ytdlp::locate_binary();
    let version = match &path {
        Some(binary) => YtDlpBackend::with_binary(binary.clone()).version().await.ok(),
        None => None,
    };
    ToolStatus {
        name: YTDLP_BINARY,
        path,
        version,
        install_hint: ytdlp_install_hint(),
    }
}

pub async fn check_ffmpeg() -> ToolStatus {
    info!("🎬 Checking FFmpeg availability");
    let path = remux::check_ffmpeg();
    let version = match &path {
        Some(binary) => tool_version(binary, "-version").await.ok(),
        None => None,
    };
    ToolStatus {
        name: FFMPEG_BINARY,
        path,
        version,
        install_hint: remux::install_hint(),
    }
}

pub async fn check_dependencies() -> Vec<ToolStatus> {
    vec![check_ytdlp().await, check_ffmpeg().await]
}

/// Human readable report; one block per tool
pub fn render_dependency_report(statuses: &[ToolStatus]) -> String {
    let mut report = String::new();
    for status in statuses {
        match &status.path {
            Some(path) => {
                report.push_str(&format!("✅ {} found at {}", status.name, path.display()));
                if let Some(version) = status.version.as_deref().filter(|v| !v.is_empty()) {
                    report.push_str(&format!(" ({})", version));
                }
                report.push('\n');
            }
            None => {
                report.push_str(&format!("❌ {} not found\n", status.name));
                report.push_str(&format!("   install: {}\n", status.install_hint));
            }
        }
    }
    report
}

/// Remove temporary download files directly inside `folder`
pub fn cleanup_folder(folder: &Path) -> AppResult<Vec<PathBuf>> {
    if !folder.is_dir() {
        return Err(AppError::System(format!(
            "Download folder does not exist: {}",
            folder.display()
        )));
    }
    let removed = cleanup_download_folder(folder);
    if removed.is_empty() {
        info!("No temporary files in {}", folder.display());
    } else {
        warn!("Removed {} temporary file(s) from {}", removed.len(), folder.display());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_report_lists_missing_tool_with_hint() {
        let statuses = vec![
            ToolStatus {
                name: "yt-dlp",
                path: Some(PathBuf::from("/usr/bin/yt-dlp")),
                version: Some("2024.08.06".into()),
                install_hint: "pip".into(),
            },
            ToolStatus {
                name: "ffmpeg",
                path: None,
                version: None,
                install_hint: "apt install ffmpeg".into(),
            },
        ];
        let report = render_dependency_report(&statuses);
        assert!(report.contains("✅ yt-dlp found at /usr/bin/yt-dlp (2024.08.06)"));
        assert!(report.contains("❌ ffmpeg not found"));
        assert!(report.contains("install: apt install ffmpeg"));
        assert!(!statuses[1].is_available());
    }

    #[test]
    fn test_cleanup_folder_removes_only_temporary_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"done").unwrap();
        std::fs::write(dir.path().join("clip.f137.mp4.part"), b"x").unwrap();
        std::fs::write(dir.path().join("clip.f137.mp4.ytdl"), b"x").unwrap();

        let removed = cleanup_folder(dir.path()).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("clip.mp4").exists());
    }

    #[test]
    fn test_cleanup_missing_folder_is_error() {
        let dir = tempdir().unwrap();
        assert!(cleanup_folder(&dir.path().join("absent")).is_err());
    }

    #[tokio::test]
    async fn test_version_of_missing_binary_fails() {
        assert!(tool_version(Path::new("/nonexistent/tool"), "--version").await.is_err());
    }
}
