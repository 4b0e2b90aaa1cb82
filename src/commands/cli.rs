//! Command line surface

use clap::Parser;
use std::path::PathBuf;

use crate::core::models::{OutputFormat, Resolution};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "media-dl",
    version,
    about = "Download media with yt-dlp, pick formats and remux with ffmpeg"
)]
pub struct Cli {
    /// Terminal mode (the terminal front end is always used)
    #[arg(short = 'c', long = "cli")]
    pub cli: bool,

    /// Media URL; asked for on a terminal when omitted
    pub url: Option<String>,

    /// mp4, mp4-video-only, mp3, avi or mkv
    #[arg(short, long)]
    pub format: Option<OutputFormat>,

    /// Maximum video height: best, 1080, 720, 480, 360 ...
    #[arg(short, long)]
    pub resolution: Option<Resolution>,

    /// Audio bitrate in kbps (320, 256, 192, 128)
    #[arg(short, long, value_parser = parse_bitrate)]
    pub bitrate: Option<u32>,

    /// Output file name without extension
    #[arg(short = 'n', long)]
    pub filename: Option<String>,

    /// Download folder; defaults to the configured one
    #[arg(short = 'd', long)]
    pub folder: Option<PathBuf>,

    /// Raw yt-dlp arguments: one quoted string or several values
    #[arg(short = 'a', long = "ytdlp-args", num_args = 0.., allow_hyphen_values = true)]
    pub ytdlp_args: Vec<String>,

    /// Config file to use instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Report whether yt-dlp and ffmpeg are installed, then exit
    #[arg(long)]
    pub check_deps: bool,

    /// Remove temporary files from the download folder, then exit
    #[arg(long)]
    pub cleanup: bool,

    /// Print title and size of the URL without downloading
    #[arg(long)]
    pub info: bool,
}

fn parse_bitrate(value: &str) -> Result<u32, String> {
    let trimmed = value.trim().to_lowercase();
    let digits = trimmed.strip_suffix('k').unwrap_or(&trimmed);
    match digits.parse::<u32>() {
        Ok(kbps) if kbps > 0 => Ok(kbps),
        _ => Err(format!("invalid bitrate '{}' (expected kbps such as 192)", value)),
    }
}

/// A single value is split shell-style; several values are taken as given.
pub fn parse_ytdlp_args(values: &[String]) -> Vec<String> {
    match values {
        [] => Vec::new(),
        [single] => shlex::split(single).unwrap_or_else(|| vec![single.clone()]),
        many => many.to_vec(),
    }
}

/// Take `-o` / `--output` out of the passthrough arguments. The last one
/// wins; the rest are returned unchanged.
pub fn split_output_template(args: Vec<String>) -> (Vec<String>, Option<String>) {
    let mut rest = Vec::with_capacity(args.len());
    let mut template = None;
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "-o" || arg == "--output" {
            match iter.next() {
                Some(value) => template = Some(value),
                None => rest.push(arg),
            }
        } else if let Some(value) = arg.strip_prefix("--output=") {
            template = Some(value.to_string());
        } else {
            rest.push(arg);
        }
    }
    (rest, template)
}
