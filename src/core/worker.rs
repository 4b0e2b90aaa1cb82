//! Download worker
//!
//! One worker runs one job from resolution to its terminal state. It never
//! touches the pool's tables; everything it learns flows back as
//! [`WorkerReport`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::control::JobControl;
use crate::core::extraction::{ExtractionAdapter, FetchRequest, RequestOptions};
use crate::core::format_selector::{select_streams, StreamKind};
use crate::core::models::{AppError, AppResult, JobProgress, JobRequest, JobState};
use crate::core::naming::{output_name, NameRegistry};
use crate::core::remux::{MergeSpec, Remuxer};
use crate::utils::file_utils::{ensure_dir_exists, remove_files_with_stem, remove_if_exists};

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(PathBuf),
    Failed(String),
    Cancelled,
}

/// Worker to pool messages
#[derive(Debug, Clone)]
pub enum WorkerReport {
    State {
        job_id: String,
        state: JobState,
    },
    Progress {
        job_id: String,
        progress: JobProgress,
    },
    Resolved {
        job_id: String,
        title: String,
        filesize: Option<u64>,
    },
    Finished {
        job_id: String,
        outcome: JobOutcome,
    },
}

/// Collaborators shared by every worker of a pool
#[derive(Clone)]
pub struct WorkerContext {
    pub adapter: ExtractionAdapter,
    pub remuxer: Arc<dyn Remuxer>,
    pub names: NameRegistry,
    pub options: RequestOptions,
    pub reports: mpsc::UnboundedSender<WorkerReport>,
}

/// Files a job may leave behind if it does not complete
#[derive(Debug, Default)]
struct Leftovers {
    dir: PathBuf,
    intermediate_stems: Vec<String>,
    output: Option<PathBuf>,
}

impl Leftovers {
    fn discard(&self, keep_intermediates: bool) {
        if !keep_intermediates {
            for stem in &self.intermediate_stems {
                for removed in remove_files_with_stem(&self.dir, stem) {
                    debug!("Removed {}", removed.display());
                }
            }
        }
        if let Some(output) = &self.output {
            remove_if_exists(output);
        }
    }
}

pub struct DownloadWorker {
    job_id: String,
    request: JobRequest,
    ctx: WorkerContext,
    control: JobControl,
}

impl DownloadWorker {
    pub fn new(job_id: String, request: JobRequest, ctx: WorkerContext, control: JobControl) -> Self {
        let reports = ctx.reports.clone();
        let listener_id = job_id.clone();
        let control = control.with_hold_listener(move |held| {
            let state = if held {
                JobState::Paused
            } else {
                JobState::Downloading
            };
            let _ = reports.send(WorkerReport::State {
                job_id: listener_id.clone(),
                state,
            });
        });

        Self {
            job_id,
            request,
            ctx,
            control,
        }
    }

    /// Run the job to completion. The slot stays with the pool, which frees
    /// it after recording the terminal state.
    pub async fn run(self) {
        let mut leftovers = Leftovers::default();
        let outcome = match self.execute(&mut leftovers).await {
            Ok(path) => {
                info!("✅ Download completed: {} -> {}", self.job_id, path.display());
                JobOutcome::Completed(path)
            }
            Err(AppError::Cancelled) => {
                leftovers.discard(false);
                info!("🚫 Cancelled download: {}", self.job_id);
                JobOutcome::Cancelled
            }
            Err(err @ AppError::Merge(_)) => {
                leftovers.discard(true);
                error!("❌ Merge failed: {} - {}", self.job_id, err);
                JobOutcome::Failed(err.to_string())
            }
            Err(err) => {
                leftovers.discard(false);
                error!("❌ Download failed: {} - {}", self.job_id, err);
                JobOutcome::Failed(err.to_string())
            }
        };

        self.report(WorkerReport::Finished {
            job_id: self.job_id.clone(),
            outcome,
        });
    }

    fn report(&self, report: WorkerReport) {
        if self.ctx.reports.send(report).is_err() {
            warn!("Pool stopped listening to worker {}", self.job_id);
        }
    }

    fn report_state(&self, state: JobState) {
        self.report(WorkerReport::State {
            job_id: self.job_id.clone(),
            state,
        });
    }

    async fn execute(&self, leftovers: &mut Leftovers) -> AppResult<PathBuf> {
        let request = &self.request;
        let format = request.format;

        self.report_state(JobState::Resolving);
        let mut options = self.ctx.options.clone();
        options.extra_args.extend(request.extra_args.iter().cloned());

        let info = tokio::select! {
            _ = self.control.cancelled() => return Err(AppError::Cancelled),
            resolved = self.ctx.adapter.resolve(&request.url, &mut options) => resolved?,
        };
        self.report(WorkerReport::Resolved {
            job_id: self.job_id.clone(),
            title: info.title.clone(),
            filesize: info.size_estimate(),
        });

        let plan = select_streams(&info, format, request.resolution, request.bitrate);
        if let Some(stream) = plan.streams.first().filter(|_| plan.fallback) {
            info!(
                "No matching stream descriptors for {}, using selector '{}'",
                request.url, stream.selector
            );
        }

        let ext = format.extension();
        let name = output_name(
            &request.destination,
            request.filename.as_deref(),
            request.output_template.as_deref(),
            &info.title,
            &info.id,
            ext,
        );
        ensure_dir_exists(&name.dir)?;
        let reservation = self.ctx.names.reserve(&name.dir, &name.stem, ext);
        let output = reservation.path().to_path_buf();
        let stem = reservation.stem();
        leftovers.dir = reservation.dir().to_path_buf();
        leftovers.output = Some(output.clone());

        self.report_state(JobState::Downloading);

        let mut completed = 0u64;
        let mut fetched = Vec::with_capacity(plan.streams.len());
        for stream in &plan.streams {
            self.control.checkpoint().await?;

            let intermediate = format!("{}.f{}", stem, stream.label);
            leftovers.intermediate_stems.push(intermediate.clone());
            let fetch = FetchRequest {
                url: request.url.clone(),
                selector: stream.selector.clone(),
                output_stem: leftovers.dir.join(&intermediate),
                ext: stream.ext.clone(),
                expected_size: stream.filesize,
            };

            let base = completed;
            let planned_total = plan.estimated_total;
            let reports = self.ctx.reports.clone();
            let job_id = self.job_id.clone();
            let on_progress = move |done: u64, stream_total: Option<u64>| {
                let total = planned_total.or(stream_total.map(|t| base + t));
                let _ = reports.send(WorkerReport::Progress {
                    job_id: job_id.clone(),
                    progress: JobProgress::new(base + done, total),
                });
            };

            let path = self
                .ctx
                .adapter
                .fetch(&fetch, &mut options, &on_progress, &self.control)
                .await?;
            completed += file_len(&path).await.or(stream.filesize).unwrap_or(0);
            debug!("Fetched stream {} to {}", stream.selector, path.display());
            fetched.push(path);
        }

        self.control.seal();
        self.control.checkpoint().await?;

        if plan.needs_merge(format) {
            self.report_state(JobState::Merging);
            let spec = MergeSpec {
                inputs: fetched.clone(),
                output: output.clone(),
                format,
                audio_bitrate: request.bitrate,
                drop_audio: !format.needs_audio()
                    && plan.streams.iter().any(|s| s.kind == StreamKind::Combined),
            };
            tokio::select! {
                _ = self.control.cancelled() => return Err(AppError::Cancelled),
                merged = self.ctx.remuxer.remux(&spec) => merged?,
            }
            for path in &fetched {
                remove_if_exists(path);
            }
        } else if let Some(single) = fetched.first() {
            tokio::fs::rename(single, &output).await?;
        }

        let size = file_len(&output).await.unwrap_or(completed);
        self.report(WorkerReport::Progress {
            job_id: self.job_id.clone(),
            progress: JobProgress::complete(size),
        });

        *leftovers = Leftovers::default();
        drop(reservation);
        Ok(output)
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}
