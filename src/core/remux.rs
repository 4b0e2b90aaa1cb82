//! Remux / merge step
//!
//! Combines the fetched streams into the requested container through an
//! external ffmpeg process. Success is exit code 0; anything else carries
//! the tail of ffmpeg's stderr.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::models::{AppError, AppResult, OutputFormat};

pub const FFMPEG_BINARY: &str = "ffmpeg";

/// mp3 bitrate when the job does not ask for one
pub const DEFAULT_MP3_BITRATE: u32 = 192;

const STDERR_TAIL_LINES: usize = 5;

/// Inputs and target of one remux invocation
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSpec {
    /// Video first, then audio
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub format: OutputFormat,
    /// kbps
    pub audio_bitrate: Option<u32>,
    /// Strip the audio track of a combined input
    pub drop_audio: bool,
}

#[async_trait]
pub trait Remuxer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn remux(&self, spec: &MergeSpec) -> AppResult<()>;
}

/// ffmpeg on `PATH`, if any
pub fn check_ffmpeg() -> Option<PathBuf> {
    which::which(FFMPEG_BINARY).ok()
}

/// How to get ffmpeg on this platform
pub fn install_hint() -> String {
    let manual = "or download it from https://ffmpeg.org/download.html";
    match std::env::consts::OS {
        "windows" if which::which("winget").is_ok() => {
            format!("winget install Gyan.FFmpeg.Essentials -e ({})", manual)
        }
        "windows" if which::which("choco").is_ok() => format!("choco install ffmpeg -y ({})", manual),
        "macos" if which::which("brew").is_ok() => format!("brew install ffmpeg ({})", manual),
        "macos" => format!("install Homebrew from https://brew.sh/ and run `brew install ffmpeg`, {}", manual),
        "linux" if which::which("apt").is_ok() => {
            format!("sudo apt update && sudo apt install -y ffmpeg ({})", manual)
        }
        "linux" if which::which("dnf").is_ok() => format!("sudo dnf install -y ffmpeg ({})", manual),
        "linux" if which::which("pacman").is_ok() => {
            format!("sudo pacman -S --noconfirm ffmpeg ({})", manual)
        }
        _ => format!("install ffmpeg with your package manager, {}", manual),
    }
}

pub struct FfmpegRemuxer {
    binary: PathBuf,
}

impl FfmpegRemuxer {
    pub fn locate() -> AppResult<Self> {
        let binary = check_ffmpeg().ok_or_else(|| {
            AppError::System(format!("{} not found in PATH: {}", FFMPEG_BINARY, install_hint()))
        })?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn build_args(spec: &MergeSpec) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for input in &spec.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().into_owned());
        }

        let split = spec.inputs.len() > 1;
        let push = |args: &mut Vec<String>, items: &[&str]| {
            args.extend(items.iter().map(|s| s.to_string()));
        };

        match spec.format {
            OutputFormat::Mp3 => {
                let bitrate = spec.audio_bitrate.unwrap_or(DEFAULT_MP3_BITRATE);
                push(&mut args, &["-vn", "-c:a", "libmp3lame", "-b:a"]);
                args.push(format!("{}k", bitrate));
            }
            OutputFormat::Avi => {
                if split {
                    push(&mut args, &["-map", "0:v:0", "-map", "1:a:0"]);
                }
                push(&mut args, &["-c:v", "mpeg4", "-q:v", "3"]);
                if spec.drop_audio {
                    args.push("-an".to_string());
                } else {
                    push(&mut args, &["-c:a", "libmp3lame"]);
                    if let Some(bitrate) = spec.audio_bitrate {
                        args.push("-b:a".to_string());
                        args.push(format!("{}k", bitrate));
                    }
                }
            }
            _ if spec.drop_audio || !spec.format.needs_audio() => {
                push(&mut args, &["-map", "0:v:0", "-an", "-c:v", "copy"]);
            }
            _ => {
                if split {
                    push(&mut args, &["-map", "0:v:0", "-map", "1:a:0"]);
                }
                push(&mut args, &["-c", "copy"]);
            }
        }

        args.push(spec.output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    fn name(&self) -> &'static str {
        FFMPEG_BINARY
    }

    async fn remux(&self, spec: &MergeSpec) -> AppResult<()> {
        let args = Self::build_args(spec);
        debug!("Running ffmpeg {:?}", args);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AppError::Merge(format!("Failed to start {}: {}", FFMPEG_BINARY, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join(" | ");
            let message = if tail.is_empty() {
                format!("{} exited with {}", FFMPEG_BINARY, output.status)
            } else {
                tail
            };
            return Err(AppError::Merge(message));
        }

        info!("🎞️ Remuxed {} input(s) into {}", spec.inputs.len(), spec.output.display());
        Ok(())
    }
}
