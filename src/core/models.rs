//! Core data models for the media downloader

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Output kinds a job can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Mp4WithAudio,
    Mp4WithoutAudio,
    Mp3,
    Avi,
    Mkv,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Mp4WithAudio,
        OutputFormat::Mp4WithoutAudio,
        OutputFormat::Mp3,
        OutputFormat::Avi,
        OutputFormat::Mkv,
    ];

    /// Label shown in prompts and summaries
    pub fn label(&self) -> &'static str {
        match self {
            OutputFormat::Mp4WithAudio => "mp4 (with Audio)",
            OutputFormat::Mp4WithoutAudio => "mp4 (without Audio)",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Avi => "avi",
            OutputFormat::Mkv => "mkv",
        }
    }

    /// Container extension of the final file
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4WithAudio | OutputFormat::Mp4WithoutAudio => "mp4",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Avi => "avi",
            OutputFormat::Mkv => "mkv",
        }
    }

    pub fn needs_video(&self) -> bool {
        !matches!(self, OutputFormat::Mp3)
    }

    pub fn needs_audio(&self) -> bool {
        !matches!(self, OutputFormat::Mp4WithoutAudio)
    }

    pub fn audio_only(&self) -> bool {
        matches!(self, OutputFormat::Mp3)
    }

    /// Formats whose final file is always written by the remux tool
    /// (codec conversion, not only container copy).
    pub fn always_remux(&self) -> bool {
        matches!(self, OutputFormat::Mp3 | OutputFormat::Avi)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "mp4 (with audio)" | "mp4" | "mp4-audio" | "mp4-with-audio" | "mp4_with_audio" => {
                Ok(OutputFormat::Mp4WithAudio)
            }
            "mp4 (without audio)"
            | "mp4-video-only"
            | "mp4-without-audio"
            | "mp4_without_audio"
            | "mp4-no-audio"
            | "video-only" => Ok(OutputFormat::Mp4WithoutAudio),
            "mp3" | "audio" => Ok(OutputFormat::Mp3),
            "avi" => Ok(OutputFormat::Avi),
            "mkv" => Ok(OutputFormat::Mkv),
            _ => Err(AppError::Parse(format!(
                "Unsupported format '{}' (expected one of: mp4, mp4-video-only, mp3, avi, mkv)",
                s.trim()
            ))),
        }
    }
}

/// Requested maximum video height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    Best,
    MaxHeight(u32),
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Best => f.write_str("best"),
            Resolution::MaxHeight(height) => write!(f, "{}", height),
        }
    }
}

impl FromStr for Resolution {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        if normalized == "best" {
            return Ok(Resolution::Best);
        }

        let digits = normalized.strip_suffix('p').unwrap_or(&normalized);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Ok(Resolution::MaxHeight(height)),
            _ => Err(AppError::Parse(format!(
                "Invalid resolution '{}' (expected 'best' or a height such as 720)",
                s.trim()
            ))),
        }
    }
}

/// Choices offered by the interactive prompt
pub const RESOLUTION_CHOICES: [&str; 5] = ["best", "1080", "720", "480", "360"];
pub const BITRATE_CHOICES: [u32; 4] = [320, 256, 192, 128];

/// Job lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Resolving,
    Downloading,
    Paused,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// States in which a worker is bound to the job and holds a pool slot
    pub fn occupies_slot(&self) -> bool {
        matches!(
            self,
            JobState::Resolving | JobState::Downloading | JobState::Paused | JobState::Merging
        )
    }

    /// Permitted lifecycle edges. Cancellation is accepted from every
    /// non-terminal state; a download that needs no remux completes directly.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Queued, Resolving)
                | (Queued, Cancelled)
                | (Resolving, Downloading)
                | (Resolving, Failed)
                | (Resolving, Cancelled)
                | (Downloading, Paused)
                | (Downloading, Merging)
                | (Downloading, Completed)
                | (Downloading, Cancelled)
                | (Downloading, Failed)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Merging, Completed)
                | (Merging, Failed)
                | (Merging, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Resolving => "resolving",
            JobState::Downloading => "downloading",
            JobState::Paused => "paused",
            JobState::Merging => "merging",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Byte-level progress of a single job
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    /// 0.0 - 100.0
    pub percent: f64,
}

impl JobProgress {
    pub fn new(bytes_done: u64, bytes_total: Option<u64>) -> Self {
        let percent = match bytes_total {
            Some(total) if total > 0 => (bytes_done as f64 / total as f64 * 100.0).clamp(0.0, 100.0),
            _ => 0.0,
        };
        Self {
            bytes_done,
            bytes_total,
            percent,
        }
    }

    pub fn complete(bytes: u64) -> Self {
        Self {
            bytes_done: bytes,
            bytes_total: Some(bytes),
            percent: 100.0,
        }
    }

    /// Merge a newer reading without ever moving backwards
    pub fn advance(&mut self, next: JobProgress) -> bool {
        if next.bytes_done < self.bytes_done && next.percent <= self.percent {
            return false;
        }
        let changed = next.bytes_done != self.bytes_done || next.bytes_total != self.bytes_total;
        self.bytes_done = self.bytes_done.max(next.bytes_done);
        if next.bytes_total.is_some() {
            self.bytes_total = next.bytes_total;
        }
        self.percent = self.percent.max(next.percent);
        changed
    }
}

/// A download as requested by a front end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub url: String,
    pub format: OutputFormat,
    pub resolution: Resolution,
    /// Audio bitrate in kbps
    pub bitrate: Option<u32>,
    pub destination: PathBuf,
    /// Base name without extension
    pub filename: Option<String>,
    /// yt-dlp style output template (`%(title)s.%(ext)s`)
    pub output_template: Option<String>,
    pub extra_args: Vec<String>,
}

impl JobRequest {
    pub fn new(url: impl Into<String>, format: OutputFormat, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            format,
            resolution: Resolution::Best,
            bitrate: None,
            destination: destination.into(),
            filename: None,
            output_template: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_bitrate(mut self, bitrate: Option<u32>) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename;
        self
    }

    pub fn with_output_template(mut self, template: Option<String>) -> Self {
        self.output_template = template;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

/// Job record owned by the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub url: String,
    pub chosen_format: OutputFormat,
    pub resolution: Resolution,
    pub bitrate: Option<u32>,
    pub destination_path: PathBuf,
    pub filename: Option<String>,
    pub output_template: Option<String>,
    pub raw_passthrough_args: Vec<String>,
    pub state: JobState,
    pub progress: JobProgress,
    pub error: Option<String>,

    /// Filled in once the media has been resolved
    pub title: Option<String>,
    pub filesize: Option<u64>,
    /// Final file, set on completion
    pub output_path: Option<PathBuf>,
    /// Queued job taken out of the dispatch queue by a pause command
    pub on_hold: bool,

    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl DownloadJob {
    pub fn from_request(id: String, request: &JobRequest) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            url: request.url.clone(),
            chosen_format: request.format,
            resolution: request.resolution,
            bitrate: request.bitrate,
            destination_path: request.destination.clone(),
            filename: request.filename.clone(),
            output_template: request.output_template.clone(),
            raw_passthrough_args: request.extra_args.clone(),
            state: JobState::Queued,
            progress: JobProgress::default(),
            error: None,
            title: None,
            filesize: None,
            output_path: None,
            on_hold: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_request(&self) -> JobRequest {
        JobRequest {
            url: self.url.clone(),
            format: self.chosen_format,
            resolution: self.resolution,
            bitrate: self.bitrate,
            destination: self.destination_path.clone(),
            filename: self.filename.clone(),
            output_template: self.output_template.clone(),
            extra_args: self.raw_passthrough_args.clone(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

/// Aggregate progress over the whole pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallProgress {
    /// Bytes of jobs currently bound to a worker
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    /// Mean percentage of every job that was not cancelled
    pub average_percent: f64,
    pub active_jobs: usize,
}

/// Media metadata returned by the extraction tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatDescriptor>,
}

impl FormatInfo {
    pub fn size_estimate(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

/// One downloadable stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    /// Audio bitrate in kbps
    #[serde(default)]
    pub abr: Option<f64>,
    /// Total bitrate in kbps
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub filesize_approx: Option<u64>,
}

impl FormatDescriptor {
    pub fn has_video(&self) -> bool {
        match self.vcodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.height.is_some(),
        }
    }

    pub fn has_audio(&self) -> bool {
        match self.acodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            // generic extractors leave both codecs blank on muxed streams
            None => self.vcodec.is_none(),
        }
    }

    pub fn size_estimate(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

fn lenient_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64))
}

/// Application error types

#[derive(Debug, thiserror::Error)]

pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network probe error: {0}")]
    Probe(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("System error: {0}")]
    System(String),
}

impl AppError {
    /// HTTP 403 / "forbidden" reported by the extraction tool or a direct request
    pub fn is_forbidden(&self) -> bool {
        match self {
            AppError::Extraction(message) | AppError::Download(message) => {
                let lowered = message.to_lowercase();
                lowered.contains("403") || lowered.contains("forbidden")
            }
            AppError::Network(err) => err.status() == Some(reqwest::StatusCode::FORBIDDEN),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

/// Result type alias for application operations

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing_accepts_labels_and_aliases() {
        assert_eq!(
            "mp4 (with Audio)".parse::<OutputFormat>().unwrap(),
            OutputFormat::Mp4WithAudio
        );
        assert_eq!(
            "MP4 (without Audio)".parse::<OutputFormat>().unwrap(),
            OutputFormat::Mp4WithoutAudio
        );
        assert_eq!("mp4".parse::<OutputFormat>().unwrap(), OutputFormat::Mp4WithAudio);
        assert_eq!(" MKV ".parse::<OutputFormat>().unwrap(), OutputFormat::Mkv);
        assert!("flv".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_format_properties() {
        assert_eq!(OutputFormat::Mp4WithoutAudio.extension(), "mp4");
        assert!(!OutputFormat::Mp4WithoutAudio.needs_audio());
        assert!(OutputFormat::Mp3.audio_only());
        assert!(!OutputFormat::Mp3.needs_video());
        assert!(OutputFormat::Avi.always_remux());
        assert!(!OutputFormat::Mkv.always_remux());
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!("best".parse::<Resolution>().unwrap(), Resolution::Best);
        assert_eq!("720".parse::<Resolution>().unwrap(), Resolution::MaxHeight(720));
        assert_eq!("1080p".parse::<Resolution>().unwrap(), Resolution::MaxHeight(1080));
        assert!("0".parse::<Resolution>().is_err());
        assert!("hd".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(JobState::Queued.can_transition_to(JobState::Resolving));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Downloading.can_transition_to(JobState::Paused));
        assert!(JobState::Paused.can_transition_to(JobState::Downloading));
        assert!(JobState::Merging.can_transition_to(JobState::Failed));

        assert!(!JobState::Queued.can_transition_to(JobState::Downloading));
        assert!(!JobState::Resolving.can_transition_to(JobState::Paused));
        assert!(!JobState::Completed.can_transition_to(JobState::Downloading));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Queued));
    }

    #[test]
    fn test_progress_never_moves_backwards() {
        let mut progress = JobProgress::new(500, Some(1000));
        assert_eq!(progress.percent, 50.0);

        assert!(!progress.advance(JobProgress::new(200, Some(1000))));
        assert_eq!(progress.bytes_done, 500);

        assert!(progress.advance(JobProgress::new(750, Some(1000))));
        assert_eq!(progress.bytes_done, 750);
        assert_eq!(progress.percent, 75.0);
    }

    #[test]
    fn test_forbidden_detection() {
        assert!(AppError::Extraction("HTTP Error 403: Forbidden".into()).is_forbidden());
        assert!(AppError::Download("server said FORBIDDEN".into()).is_forbidden());
        assert!(!AppError::Extraction("HTTP Error 404: Not Found".into()).is_forbidden());
        assert!(!AppError::Cancelled.is_forbidden());
    }

    #[test]
    fn test_format_info_from_tool_json() {
        let json = r#"{
            "id": "abc",
            "title": "Clip",
            "thumbnail": "https://img.test/t.jpg",
            "filesize_approx": 1048576.0,
            "formats": [
                {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus", "abr": 160.2},
                {"format_id": "137", "ext": "mp4", "height": 1080, "vcodec": "avc1", "acodec": "none", "filesize": null}
            ]
        }"#;

        let info: FormatInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.title, "Clip");
        assert_eq!(info.size_estimate(), Some(1_048_576));
        assert_eq!(info.formats.len(), 2);
        assert!(info.formats[0].has_audio());
        assert!(!info.formats[0].has_video());
        assert!(info.formats[1].has_video());
        assert!(!info.formats[1].has_audio());
    }
}
