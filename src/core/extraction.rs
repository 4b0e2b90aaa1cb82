//! Extraction adapter
//!
//! [`MediaBackend`] is the seam to the external extraction tool. The
//! [`ExtractionAdapter`] wraps a backend with the retry policy shared by
//! every caller: a 403 is retried exactly once with alternate headers.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::AppConfig;
use crate::core::control::JobControl;
use crate::core::models::{AppError, AppResult, FormatInfo};
use crate::utils::file_utils::format_file_size;

/// Headers some embedded players insist on, sent only after a 403
pub fn alternate_headers() -> Vec<(String, String)> {
    vec![
        ("User-Agent".to_string(), "Mozilla/5.0".to_string()),
        ("Origin".to_string(), "https://player.videasy.net".to_string()),
        ("Referer".to_string(), "https://player.videasy.net/".to_string()),
    ]
}

/// Per-call options handed to the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub concurrent_fragments: Option<u32>,
    pub http_chunk_size: Option<u64>,
    /// Opaque arguments for the tool, appended as given
    pub extra_args: Vec<String>,
    /// Set once the alternate headers are in use
    pub alternate_headers: bool,
}

impl RequestOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrent_fragments: Some(config.concurrent_fragment_downloads),
            http_chunk_size: Some(config.http_chunk_size),
            ..Self::default()
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Copy of these options carrying the alternate headers. Headers with
    /// the same name are replaced.
    pub fn with_alternate_headers(&self) -> Self {
        let mut next = self.clone();
        for (name, value) in alternate_headers() {
            next.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            next.headers.push((name, value));
        }
        next.alternate_headers = true;
        next
    }
}

/// One stream transfer
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    /// Format id or selector expression understood by the tool
    pub selector: String,
    /// Destination path without extension; the tool appends the real one
    pub output_stem: PathBuf,
    /// Extension the stream is expected to have, if known
    pub ext: Option<String>,
    pub expected_size: Option<u64>,
}

/// External extraction tool
#[async_trait]
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metadata and stream descriptors for `url`
    async fn resolve(&self, url: &str, options: &RequestOptions) -> AppResult<FormatInfo>;

    /// Transfer one stream and return the file it produced.
    ///
    /// `on_progress` receives `(bytes_done, bytes_total)`; `control` must be
    /// honoured at every step boundary.
    async fn fetch(
        &self,
        request: &FetchRequest,
        options: &RequestOptions,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
        control: &JobControl,
    ) -> AppResult<PathBuf>;
}

/// Short description for previews
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSummary {
    pub title: String,
    pub thumbnail: Option<String>,
    pub size_label: String,
}

/// Backend plus retry policy
#[derive(Clone)]
pub struct ExtractionAdapter {
    backend: Arc<dyn MediaBackend>,
}

impl ExtractionAdapter {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Resolve formats. If the first attempt is refused with a 403 the call
    /// is repeated once with the alternate headers, and `options` keeps
    /// them for the fetches that follow.
    pub async fn resolve(&self, url: &str, options: &mut RequestOptions) -> AppResult<FormatInfo> {
        match self.backend.resolve(url, options).await {
            Ok(info) => Ok(info),
            Err(err) if err.is_forbidden() && !options.alternate_headers => {
                warn!("🔒 {} refused {} ({}), retrying with alternate headers", self.backend.name(), url, err);
                let retry = options.with_alternate_headers();
                let info = self
                    .backend
                    .resolve(url, &retry)
                    .await
                    .map_err(as_extraction_error)?;
                *options = retry;
                info!("Alternate headers accepted for {}", url);
                Ok(info)
            }
            Err(err) => Err(as_extraction_error(err)),
        }
    }

    /// Fetch one stream with the same single 403 retry, unless the
    /// alternate headers are already in use.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        options: &mut RequestOptions,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
        control: &JobControl,
    ) -> AppResult<PathBuf> {
        match self.backend.fetch(request, options, on_progress, control).await {
            Ok(path) => Ok(path),
            Err(err) if err.is_forbidden() && !options.alternate_headers => {
                warn!("🔒 Stream {} refused ({}), retrying with alternate headers", request.selector, err);
                let retry = options.with_alternate_headers();
                let path = self
                    .backend
                    .fetch(request, &retry, on_progress, control)
                    .await
                    .map_err(as_download_error)?;
                *options = retry;
                Ok(path)
            }
            Err(err) => Err(as_download_error(err)),
        }
    }

    /// Title, thumbnail and a readable size for a quick preview
    pub async fn describe(&self, url: &str, options: &RequestOptions) -> AppResult<MediaSummary> {
        let mut options = options.clone();
        let info = self.resolve(url, &mut options).await?;
        Ok(MediaSummary {
            title: info.title.clone(),
            thumbnail: info.thumbnail.clone().filter(|t| !t.is_empty()),
            size_label: format_file_size(info.size_estimate()),
        })
    }
}

fn as_extraction_error(err: AppError) -> AppError {
    match err {
        AppError::Cancelled | AppError::Extraction(_) => err,
        AppError::Download(message) | AppError::System(message) | AppError::Parse(message) => {
            AppError::Extraction(message)
        }
        other => AppError::Extraction(other.to_string()),
    }
}

fn as_download_error(err: AppError) -> AppError {
    match err {
        AppError::Cancelled | AppError::Download(_) => err,
        AppError::Extraction(message) | AppError::System(message) => AppError::Download(message),
        other => AppError::Download(other.to_string()),
    }
}
