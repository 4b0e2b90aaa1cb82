//! yt-dlp subprocess backend
//!
//! Resolution runs `yt-dlp -J`; each stream transfer runs a separate
//! `yt-dlp -f <selector>` whose progress is printed through a fixed
//! template and parsed line by line. Pausing stops the child; the next run
//! continues from the `.part` file the previous one left behind.

use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::control::JobControl;
use crate::core::extraction::{FetchRequest, MediaBackend, RequestOptions};
use crate::core::models::{AppError, AppResult, FormatInfo};
use crate::utils::file_utils::is_temporary_file;

pub const YTDLP_BINARY: &str = "yt-dlp";
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

const PROGRESS_MARKER: &str = "MEDIA_DL_PROGRESS";
const PATH_MARKER: &str = "MEDIA_DL_PATH=";
const STDERR_TAIL_LINES: usize = 20;

/// Locate yt-dlp on `PATH`
pub fn locate_binary() -> Option<PathBuf> {
    which::which(YTDLP_BINARY).ok()
}

pub struct YtDlpBackend {
    binary: PathBuf,
    socket_timeout: Duration,
}

impl YtDlpBackend {
    /// Backend for the yt-dlp found on `PATH`
    pub fn locate() -> AppResult<Self> {
        let binary = locate_binary().ok_or_else(|| {
            AppError::System(format!(
                "{} not found in PATH (install it with `pip install -U yt-dlp`)",
                YTDLP_BINARY
            ))
        })?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
        }
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `yt-dlp --version`
    pub async fn version(&self) -> AppResult<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(AppError::System(format!(
                "{} --version exited with {}",
                self.binary.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn common_args(&self, options: &RequestOptions) -> Vec<String> {
        let mut args = vec![
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--socket-timeout".to_string(),
            self.socket_timeout.as_secs().max(1).to_string(),
        ];
        for (name, value) in &options.headers {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }
        args
    }

    pub fn resolve_args(&self, url: &str, options: &RequestOptions) -> Vec<String> {
        let mut args = vec!["-J".to_string()];
        args.extend(self.common_args(options));
        args.extend(options.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    pub fn fetch_args(&self, request: &FetchRequest, options: &RequestOptions) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            request.selector.clone(),
            "-o".to_string(),
            format!("{}.%(ext)s", escape_template(&request.output_stem.to_string_lossy())),
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            format!(
                "download:{} %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s",
                PROGRESS_MARKER
            ),
            "--print".to_string(),
            format!("after_move:{}%(filepath)s", PATH_MARKER),
        ];
        args.extend(self.common_args(options));
        if let Some(fragments) = options.concurrent_fragments {
            args.push("--concurrent-fragments".to_string());
            args.push(fragments.to_string());
        }
        if let Some(chunk) = options.http_chunk_size {
            args.push("--http-chunk-size".to_string());
            args.push(chunk.to_string());
        }
        args.extend(options.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// One run of the child
    async fn run_fetch(
        &self,
        args: &[String],
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
        control: &JobControl,
    ) -> AppResult<FetchRun> {
        let mut child = self
            .command(args)
            .spawn()
            .map_err(|e| AppError::Download(format!("Failed to start {}: {}", YTDLP_BINARY, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Download("Failed to capture yt-dlp stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Download("Failed to capture yt-dlp stderr".into()))?;

        let (tx, mut rx) = mpsc::channel::<ToolLine>(16);
        spawn_line_reader(stdout, tx.clone(), ToolLine::Out);
        spawn_line_reader(stderr, tx, ToolLine::Err);

        let mut final_path = None;
        let mut tail = StderrTail::default();

        loop {
            tokio::select! {
                _ = control.cancelled() => {
                    stop_child(&mut child).await;
                    return Err(AppError::Cancelled);
                }
                _ = control.paused() => {
                    debug!("Stopping yt-dlp for pause");
                    stop_child(&mut child).await;
                    return Ok(FetchRun::Suspended);
                }
                line = rx.recv() => match line {
                    Some(ToolLine::Out(text)) => {
                        if let Some((done, total)) = parse_progress_line(&text) {
                            on_progress(done, total);
                        } else if let Some(path) = parse_final_path(&text) {
                            final_path = Some(path);
                        } else if !text.trim().is_empty() {
                            debug!("[yt-dlp] {}", text);
                        }
                    }
                    Some(ToolLine::Err(text)) => tail.push(text),
                    None => break,
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AppError::Download(format!("Failed to wait for yt-dlp: {}", e)))?;
        if !status.success() {
            return Err(AppError::Download(tail.summary(status)));
        }
        Ok(FetchRun::Finished(final_path))
    }
}

#[async_trait]
impl MediaBackend for YtDlpBackend {
    fn name(&self) -> &'static str {
        YTDLP_BINARY
    }

    async fn resolve(&self, url: &str, options: &RequestOptions) -> AppResult<FormatInfo> {
        let args = self.resolve_args(url, options);
        debug!("Resolving {} with {:?}", url, args);

        let output = self
            .command(&args)
            .output()
            .await
            .map_err(|e| AppError::Extraction(format!("Failed to start {}: {}", YTDLP_BINARY, e)))?;

        if !output.status.success() {
            let mut tail = StderrTail::default();
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                tail.push(line.to_string());
            }
            return Err(AppError::Extraction(tail.summary(output.status)));
        }

        let info: FormatInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::Extraction(format!("Unreadable yt-dlp metadata: {}", e)))?;
        info!(
            "🔎 Resolved '{}' ({} formats) from {}",
            info.title,
            info.formats.len(),
            url
        );
        Ok(info)
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        options: &RequestOptions,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
        control: &JobControl,
    ) -> AppResult<PathBuf> {
        let args = self.fetch_args(request, options);
        debug!("Fetching {} with {:?}", request.selector, args);

        loop {
            control.checkpoint().await?;
            if let FetchRun::Finished(reported) = self.run_fetch(&args, on_progress, control).await? {
                return reported
                    .filter(|path| path.exists())
                    .or_else(|| locate_output(&request.output_stem))
                    .ok_or_else(|| {
                        AppError::Download(format!(
                            "yt-dlp finished without producing {}.*",
                            request.output_stem.display()
                        ))
                    });
            }
        }
    }
}

enum FetchRun {
    /// Exited successfully, with the path it printed if any
    Finished(Option<PathBuf>),
    /// Stopped because the job was paused
    Suspended,
}

enum ToolLine {
    Out(String),
    Err(String),
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<ToolLine>, wrap: fn(String) -> ToolLine)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(wrap(line)).await.is_err() {
                break;
            }
        }
    });
}

async fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to stop yt-dlp: {}", e);
    }
}

/// Last lines of the tool's stderr, for error messages
#[derive(Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if line.trim().is_empty() {
            return;
        }
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn summary(&self, status: ExitStatus) -> String {
        let errors: Vec<&str> = self
            .lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| l.starts_with("ERROR:") || l.contains("HTTP Error"))
            .collect();
        if !errors.is_empty() {
            return errors.join(" | ");
        }
        match self.lines.back() {
            Some(last) => last.trim().to_string(),
            None => format!("{} exited with {}", YTDLP_BINARY, status),
        }
    }
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^MEDIA_DL_PROGRESS\s+(\S+)\s+(\S+)\s+(\S+)\s*$")
            .expect("progress pattern is valid")
    })
}

fn parse_number(value: &str) -> Option<u64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

/// `(downloaded, total)` from a progress-template line; the exact total
/// wins over the estimate.
pub fn parse_progress_line(line: &str) -> Option<(u64, Option<u64>)> {
    let caps = progress_regex().captures(line.trim())?;
    let done = parse_number(&caps[1])?;
    let total = parse_number(&caps[2]).or_else(|| parse_number(&caps[3]));
    Some((done, total))
}

pub fn parse_final_path(line: &str) -> Option<PathBuf> {
    line.trim()
        .strip_prefix(PATH_MARKER)
        .filter(|p| !p.is_empty() && *p != "NA")
        .map(PathBuf::from)
}

/// `%` is the template metacharacter
pub fn escape_template(value: &str) -> String {
    value.replace('%', "%%")
}

/// A finished file named `<stem>.<ext>` next to `stem`
fn locate_output(stem: &Path) -> Option<PathBuf> {
    let dir = stem.parent()?;
    let prefix = format!("{}.", stem.file_name()?.to_string_lossy());
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            path.is_file()
                && name.starts_with(&prefix)
                && !name[prefix.len()..].contains('.')
                && !is_temporary_file(&name)
        })
}
