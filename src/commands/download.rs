//! Download command
//!
//! Terminal front end: gathers options (flags, then prompts), submits one job
//! to the pool and renders its events until the job reaches a terminal state.

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::commands::cli::{parse_ytdlp_args, split_output_template, Cli};
use crate::commands::prompt::{ask_bitrate, ask_format, ask_line, ask_resolution};
use crate::commands::system::{check_dependencies, cleanup_folder, render_dependency_report};
use crate::core::config::{AppConfig, ConfigStore};
use crate::core::extraction::{ExtractionAdapter, RequestOptions};
use crate::core::models::{JobRequest, JobState, OutputFormat, Resolution};
use crate::core::network_probe::NetworkProbe;
use crate::core::pool::PoolEvent;
use crate::core::remux::{self, FfmpegRemuxer, FFMPEG_BINARY};
use crate::core::runtime::{spawn_pool, PoolSettings};
use crate::core::ytdlp::YtDlpBackend;
use crate::utils::file_utils::format_file_size;
use crate::utils::validation::validate_url;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Format, resolution and bitrate after flags and prompts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Choices {
    pub format: OutputFormat,
    pub resolution: Resolution,
    pub bitrate: Option<u32>,
}

/// Fill in options missing from the command line. Prompts only when
/// `interactive`; resolution is not asked for mp3, bitrate not for
/// video-only mp4.
pub fn gather_choices<R: BufRead, W: Write>(
    cli: &Cli,
    interactive: bool,
    input: &mut R,
    output: &mut W,
) -> io::Result<Choices> {
    let format = match cli.format {
        Some(format) => Some(format),
        None if interactive => ask_format(input, output)?,
        None => None,
    }
    .unwrap_or(OutputFormat::Mp4WithAudio);

    let resolution = match cli.resolution {
        Some(resolution) => Some(resolution),
        None if interactive && format != OutputFormat::Mp3 => ask_resolution(input, output)?,
        None => None,
    }
    .unwrap_or_default();

    let bitrate = match cli.bitrate {
        Some(bitrate) => Some(bitrate),
        None if interactive && format != OutputFormat::Mp4WithoutAudio => ask_bitrate(input, output)?,
        None => None,
    };

    Ok(Choices {
        format,
        resolution,
        bitrate,
    })
}

/// Renders pool events for a single job on a progress bar
pub struct ProgressView {
    job_id: String,
    bar: ProgressBar,
}

impl ProgressView {
    pub fn new(job_id: String, bar: ProgressBar) -> Self {
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
        );
        Self { job_id, bar }
    }

    /// Apply one event; returns the exit code once the job is over
    pub fn apply(&mut self, event: PoolEvent) -> Option<i32> {
        if event.job_id().is_some_and(|id| id != self.job_id) {
            return None;
        }

        match event {
            PoolEvent::JobResolved { title, filesize, .. } => {
                if let Some(size) = filesize {
                    self.bar.set_length(size);
                }
                self.bar.println(format!("Title: {} ({})", title, format_file_size(filesize)));
                self.bar.set_message(title);
            }
            PoolEvent::JobStateChanged { state, .. } => match state {
                JobState::Paused => self.bar.set_message("paused"),
                JobState::Merging => self.bar.set_message("merging"),
                _ => {}
            },
            PoolEvent::JobProgress { progress, .. } => {
                if let Some(total) = progress.bytes_total {
                    self.bar.set_length(total);
                }
                self.bar.set_position(progress.bytes_done);
            }
            PoolEvent::JobCompleted { output_path, .. } => {
                self.bar.finish_with_message("done");
                println!("Download finished: {}", output_path.display());
                return Some(EXIT_OK);
            }
            PoolEvent::JobFailed { error, .. } => {
                self.bar.abandon_with_message("failed");
                eprintln!("Download failed: {}", error);
                return Some(EXIT_FAILURE);
            }
            PoolEvent::JobCancelled { .. } => {
                self.bar.abandon_with_message("cancelled");
                eprintln!("Download cancelled.");
                return Some(EXIT_INTERRUPTED);
            }
            PoolEvent::JobQueued { .. } | PoolEvent::JobHeld { .. } | PoolEvent::OverallProgress { .. } => {}
        }
        None
    }
}

/// yt-dlp passthrough arguments with the output template taken out
pub fn passthrough_args(cli: &Cli) -> (Vec<String>, Option<String>) {
    split_output_template(parse_ytdlp_args(&cli.ytdlp_args))
}

/// Options for the `--info` preview; an output template has no meaning there
pub fn preview_options(config: &AppConfig, cli: &Cli) -> RequestOptions {
    let (extra_args, _template) = passthrough_args(cli);
    RequestOptions::from_config(config).with_extra_args(extra_args)
}

async fn open_config(cli: &Cli) -> anyhow::Result<ConfigStore> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => ConfigStore::default_path()?,
    };
    let probe = NetworkProbe::new()?;
    ConfigStore::load_or_create(path.clone(), &probe)
        .await
        .with_context(|| format!("Failed to load config {}", path.display()))
}

/// Run the terminal front end; returns the process exit code
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    if !cli.cli {
        info!("No graphical front end in this build, using terminal mode");
    }

    if cli.check_deps {
        let statuses = check_dependencies().await;
        print!("{}", render_dependency_report(&statuses));
        let all_found = statuses.iter().all(|s| s.is_available());
        return Ok(if all_found { EXIT_OK } else { EXIT_FAILURE });
    }

    let store = open_config(&cli).await?;
    let folder: PathBuf = match &cli.folder {
        Some(folder) => folder.clone(),
        None => store.get_download_folder()?,
    };

    if cli.cleanup {
        let removed = cleanup_folder(&folder)?;
        for path in &removed {
            println!("Removed {}", path.display());
        }
        println!("{} temporary file(s) removed from {}", removed.len(), folder.display());
        return Ok(EXIT_OK);
    }

    let interactive = io::stdin().is_terminal();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();

    let url = match cli.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => url.to_string(),
        None if interactive => ask_line(&mut input, &mut output, "Video URL: ")?.unwrap_or_default(),
        None => String::new(),
    };
    if url.is_empty() {
        eprintln!("No URL provided, aborting.");
        return Ok(EXIT_USAGE);
    }
    if let Err(err) = validate_url(&url) {
        eprintln!("{}", err);
        return Ok(EXIT_USAGE);
    }

    let backend = match YtDlpBackend::locate() {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            eprintln!("{}", err);
            return Ok(EXIT_FAILURE);
        }
    };
    let config = store.config();

    if cli.info {
        let adapter = ExtractionAdapter::new(backend);
        let summary = adapter.describe(&url, &preview_options(&config, &cli)).await?;
        println!("Title: {}", summary.title);
        println!("Size: {}", summary.size_label);
        if let Some(thumbnail) = summary.thumbnail {
            println!("Thumbnail: {}", thumbnail);
        }
        return Ok(EXIT_OK);
    }

    let choices = gather_choices(&cli, interactive, &mut input, &mut output)?;
    drop(input);

    let (extra_args, template) = passthrough_args(&cli);
    let filename = cli.filename.as_deref().map(str::trim).filter(|n| !n.is_empty()).map(String::from);

    println!("Starting download with options:");
    println!("  URL: {}", url);
    println!("  Folder: {}", folder.display());
    println!("  Format: {}", choices.format);
    if choices.format != OutputFormat::Mp3 {
        println!("  Resolution: {}", choices.resolution);
    }
    if let Some(bitrate) = choices.bitrate {
        println!("  Bitrate: {} kbps", bitrate);
    }
    if let Some(name) = &filename {
        println!("  Filename: {}", name);
    }
    if !extra_args.is_empty() {
        println!("  Extra yt-dlp args: {}", extra_args.join(" "));
    }

    let ffmpeg = remux::check_ffmpeg().unwrap_or_else(|| {
        warn!("{} not found in PATH, merging will fail: {}", FFMPEG_BINARY, remux::install_hint());
        PathBuf::from(FFMPEG_BINARY)
    });
    let remuxer = Arc::new(FfmpegRemuxer::with_binary(ffmpeg));

    let (handle, mut events) = spawn_pool(backend, remuxer, PoolSettings::from_config(&config));
    let request = JobRequest::new(url, choices.format, folder)
        .with_resolution(choices.resolution)
        .with_bitrate(choices.bitrate)
        .with_filename(filename)
        .with_output_template(template)
        .with_extra_args(extra_args);

    let job_id = match handle.submit(request).await {
        Ok(id) => id,
        Err(err) => {
            eprintln!("{}", err);
            let _ = handle.shutdown().await;
            return Ok(EXIT_USAGE);
        }
    };

    let mut view = ProgressView::new(job_id, ProgressBar::new(0));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let code = loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("\nInterrupted, cancelling...");
                if let Err(err) = handle.cancel_all().await {
                    warn!("Cancel failed: {}", err);
                }
            }
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(code) = view.apply(event) {
                        break code;
                    }
                }
                None => break EXIT_FAILURE,
            },
        }
    };

    if let Err(err) = handle.shutdown().await {
        warn!("Pool shutdown: {}", err);
    }
    Ok(if interrupted { EXIT_INTERRUPTED } else { code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobProgress;
    use clap::Parser;
    use std::io::Cursor;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["media-dl"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn gather(cli: &Cli, interactive: bool, answers: &str) -> Choices {
        let mut input = Cursor::new(answers.as_bytes().to_vec());
        let mut output = Vec::new();
        gather_choices(cli, interactive, &mut input, &mut output).unwrap()
    }

    #[test]
    fn test_defaults_without_terminal() {
        let choices = gather(&cli(&["https://media.test/v"]), false, "");
        assert_eq!(choices.format, OutputFormat::Mp4WithAudio);
        assert_eq!(choices.resolution, Resolution::Best);
        assert_eq!(choices.bitrate, None);
    }

    #[test]
    fn test_mp3_skips_resolution_prompt() {
        // format 3 = mp3, then the bitrate menu: 1 = 320
        let choices = gather(&cli(&["u"]), true, "3\n1\n");
        assert_eq!(choices.format, OutputFormat::Mp3);
        assert_eq!(choices.resolution, Resolution::Best);
        assert_eq!(choices.bitrate, Some(320));
    }

    #[test]
    fn test_video_only_skips_bitrate_prompt() {
        let choices = gather(&cli(&["u", "-f", "mp4-video-only"]), true, "3\n");
        assert_eq!(choices.resolution, Resolution::MaxHeight(720));
        assert_eq!(choices.bitrate, None);
    }

    #[test]
    fn test_flags_win_over_prompts() {
        let choices = gather(&cli(&["u", "-f", "mkv", "-r", "480", "-b", "128"]), true, "");
        assert_eq!(
            choices,
            Choices {
                format: OutputFormat::Mkv,
                resolution: Resolution::MaxHeight(480),
                bitrate: Some(128),
            }
        );
    }

    #[test]
    fn test_preview_drops_output_template() {
        let cli = cli(&["u", "--info", "-a", "--limit-rate 1M -o '%(id)s.%(ext)s'"]);
        let (extra_args, template) = passthrough_args(&cli);
        assert_eq!(extra_args, vec!["--limit-rate", "1M"]);
        assert_eq!(template.as_deref(), Some("%(id)s.%(ext)s"));

        let config = AppConfig {
            download_folder: PathBuf::from("downloads"),
            concurrent_fragment_downloads: 4,
            http_chunk_size: 10_485_760,
            max_parallel_jobs: None,
        };
        let options = preview_options(&config, &cli);
        assert_eq!(options.concurrent_fragments, Some(4));
        assert_eq!(options.extra_args, vec!["--limit-rate", "1M"]);
    }

    #[test]
    fn test_progress_view_exit_codes() {
        let mut view = ProgressView::new("job".into(), ProgressBar::hidden());
        assert_eq!(
            view.apply(PoolEvent::JobProgress {
                job_id: "job".into(),
                progress: JobProgress::new(10, Some(100)),
            }),
            None
        );
        assert_eq!(
            view.apply(PoolEvent::JobFailed {
                job_id: "other".into(),
                error: "x".into(),
            }),
            None
        );
        assert_eq!(
            view.apply(PoolEvent::JobCancelled { job_id: "job".into() }),
            Some(EXIT_INTERRUPTED)
        );

        let mut view = ProgressView::new("job".into(), ProgressBar::hidden());
        assert_eq!(
            view.apply(PoolEvent::JobFailed {
                job_id: "job".into(),
                error: "boom".into(),
            }),
            Some(EXIT_FAILURE)
        );
    }
}
