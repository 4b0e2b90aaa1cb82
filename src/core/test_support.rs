//! In-process stand-ins for the extraction and remux tools, shared by the
//! unit and integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::core::control::JobControl;
use crate::core::extraction::{FetchRequest, MediaBackend, RequestOptions};
use crate::core::models::{AppError, AppResult, DownloadJob, FormatDescriptor, FormatInfo};
use crate::core::remux::{MergeSpec, Remuxer};
use crate::core::runtime::PoolHandle;

fn descriptor(id: &str, ext: &str, height: Option<u32>, vcodec: &str, acodec: &str) -> FormatDescriptor {
    FormatDescriptor {
        format_id: id.to_string(),
        ext: Some(ext.to_string()),
        height,
        vcodec: Some(vcodec.to_string()),
        acodec: Some(acodec.to_string()),
        ..FormatDescriptor::default()
    }
}

/// Metadata with a 1080p video-only stream, a 720p muxed stream and two
/// audio-only streams (`140` m4a at 128k, `251` webm at 160k).
pub fn sample_info(title: &str) -> FormatInfo {
    let mut video = descriptor("137", "mp4", Some(1080), "avc1.640028", "none");
    video.tbr = Some(4000.0);
    let mut muxed = descriptor("22", "mp4", Some(720), "avc1.64001F", "mp4a.40.2");
    muxed.tbr = Some(1500.0);
    let mut m4a = descriptor("140", "m4a", None, "none", "mp4a.40.2");
    m4a.abr = Some(128.0);
    let mut opus = descriptor("251", "webm", None, "none", "opus");
    opus.abr = Some(160.0);

    FormatInfo {
        id: "stub123".to_string(),
        title: title.to_string(),
        thumbnail: None,
        filesize: None,
        filesize_approx: None,
        ext: Some("mp4".to_string()),
        formats: vec![video, muxed, m4a, opus],
    }
}

/// Backend that writes chunks of filler bytes to `<stem>.<ext>.part`,
/// honouring the job control between chunks.
pub struct StubBackend {
    info: FormatInfo,
    chunks: usize,
    chunk_size: usize,
    step_delay: Duration,
    resolve_delay: Duration,
    forbidden_resolves: AtomicUsize,
    forbidden_fetches: AtomicUsize,
    resolve_failure: Option<String>,
    failing_urls: Vec<String>,
    resolve_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    resolve_headers: Mutex<Vec<Vec<(String, String)>>>,
    resolve_order: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl StubBackend {
    pub fn new(info: FormatInfo) -> Self {
        Self {
            info,
            chunks: 4,
            chunk_size: 1024,
            step_delay: Duration::ZERO,
            resolve_delay: Duration::ZERO,
            forbidden_resolves: AtomicUsize::new(0),
            forbidden_fetches: AtomicUsize::new(0),
            resolve_failure: None,
            failing_urls: Vec::new(),
            resolve_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            resolve_headers: Mutex::new(Vec::new()),
            resolve_order: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_chunks(mut self, chunks: usize, chunk_size: usize) -> Self {
        self.chunks = chunks;
        self.chunk_size = chunk_size;
        self
    }

    /// Sleep after every chunk
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = delay;
        self
    }

    /// Refuse the next `n` resolves with a 403
    pub fn forbid_resolves(self, n: usize) -> Self {
        self.forbidden_resolves.store(n, Ordering::SeqCst);
        self
    }

    /// Refuse the next `n` fetches with a 403
    pub fn forbid_fetches(self, n: usize) -> Self {
        self.forbidden_fetches.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_resolve(mut self, message: &str) -> Self {
        self.resolve_failure = Some(message.to_string());
        self
    }

    /// Fetches of URLs containing `pattern` fail after the first chunk
    pub fn failing_url(mut self, pattern: &str) -> Self {
        self.failing_urls.push(pattern.to_string());
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn resolve_headers(&self) -> Vec<Vec<(String, String)>> {
        self.resolve_headers.lock().clone()
    }

    /// URLs in the order they were first resolved
    pub fn resolve_order(&self) -> Vec<String> {
        self.resolve_order.lock().clone()
    }

    /// Highest number of fetches seen running at the same time
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn current_concurrency(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn resolve(&self, url: &str, options: &RequestOptions) -> AppResult<FormatInfo> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.resolve_headers.lock().push(options.headers.clone());
        {
            let mut order = self.resolve_order.lock();
            if !order.iter().any(|seen| seen == url) {
                order.push(url.to_string());
            }
        }

        if !self.resolve_delay.is_zero() {
            tokio::time::sleep(self.resolve_delay).await;
        }
        if Self::take_one(&self.forbidden_resolves) {
            return Err(AppError::Extraction("HTTP Error 403: Forbidden".into()));
        }
        if let Some(message) = &self.resolve_failure {
            return Err(AppError::Extraction(message.clone()));
        }
        Ok(self.info.clone())
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        _options: &RequestOptions,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
        control: &JobControl,
    ) -> AppResult<PathBuf> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.forbidden_fetches) {
            return Err(AppError::Download("HTTP Error 403: Forbidden".into()));
        }
        let _active = ActiveGuard::enter(&self.active, &self.max_active);

        let ext = request.ext.clone().unwrap_or_else(|| "bin".to_string());
        let target = PathBuf::from(format!("{}.{}", request.output_stem.display(), ext));
        let part = PathBuf::from(format!("{}.part", target.display()));
        let fails = self.failing_urls.iter().any(|p| request.url.contains(p));
        let total = (self.chunks * self.chunk_size) as u64;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part)
            .await?;
        let mut written = file.metadata().await?.len();
        let chunk = vec![7u8; self.chunk_size];

        while written < total {
            control.checkpoint().await?;
            file.write_all(&chunk).await?;
            written += self.chunk_size as u64;
            on_progress(written, Some(total));

            if fails {
                file.flush().await?;
                return Err(AppError::Download(
                    "HTTP Error 500: Internal Server Error".into(),
                ));
            }
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part, &target).await?;
        Ok(target)
    }
}

/// Remuxer that concatenates its inputs into the output file
#[derive(Default)]
pub struct StubRemuxer {
    failure: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    specs: Mutex<Vec<MergeSpec>>,
}

impl StubRemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Take this long per merge
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn specs(&self) -> Vec<MergeSpec> {
        self.specs.lock().clone()
    }
}

#[async_trait]
impl Remuxer for StubRemuxer {
    fn name(&self) -> &'static str {
        "stub-remux"
    }

    async fn remux(&self, spec: &MergeSpec) -> AppResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().push(spec.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(message) = &self.failure {
            // leave a half-written output behind, like an interrupted encoder
            tokio::fs::write(&spec.output, b"partial").await?;
            return Err(AppError::Merge(message.clone()));
        }

        let mut merged = Vec::new();
        for input in &spec.inputs {
            merged.extend(tokio::fs::read(input).await?);
        }
        tokio::fs::write(&spec.output, merged).await?;
        Ok(())
    }
}

/// Poll the pool until `check` holds for the job, panicking after 5s
pub async fn wait_for_job<F>(handle: &PoolHandle, job_id: &str, check: F) -> DownloadJob
where
    F: Fn(&DownloadJob) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = handle.job(job_id).await.expect("job exists");
        if check(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {} (state {}, {} bytes)",
            job_id,
            job.state,
            job.progress.bytes_done
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_terminal(handle: &PoolHandle, job_id: &str) -> DownloadJob {
    wait_for_job(handle, job_id, |job| job.state.is_terminal()).await
}

/// File names directly inside `dir`, sorted
pub fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
