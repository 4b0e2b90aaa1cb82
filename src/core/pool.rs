//! Worker pool
//!
//! Owns the job table, the FIFO dispatch queue and the slot semaphore. All
//! mutation happens on the runtime task that owns the pool; workers only
//! send [`WorkerReport`]s back, which are applied here in arrival order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::PARALLEL_JOB_BOUNDS;
use crate::core::control::{job_control, JobControlHandle};
use crate::core::extraction::{ExtractionAdapter, RequestOptions};
use crate::core::models::{
    AppError, AppResult, DownloadJob, JobProgress, JobRequest, JobState, OverallProgress,
};
use crate::core::naming::NameRegistry;
use crate::core::remux::Remuxer;
use crate::core::worker::{DownloadWorker, JobOutcome, WorkerContext, WorkerReport};
use crate::utils::validation::validate_url;

/// Events published to front ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PoolEvent {
    JobQueued {
        job_id: String,
        url: String,
    },
    JobHeld {
        job_id: String,
    },
    JobStateChanged {
        job_id: String,
        state: JobState,
    },
    JobResolved {
        job_id: String,
        title: String,
        filesize: Option<u64>,
    },
    JobProgress {
        job_id: String,
        progress: JobProgress,
    },
    OverallProgress {
        progress: OverallProgress,
    },
    JobCompleted {
        job_id: String,
        output_path: PathBuf,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    JobCancelled {
        job_id: String,
    },
}

impl PoolEvent {
    /// Progress events may be coalesced or dropped under backpressure;
    /// everything else is a lifecycle event.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            PoolEvent::JobProgress { .. } | PoolEvent::OverallProgress { .. }
        )
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            PoolEvent::JobQueued { job_id, .. }
            | PoolEvent::JobHeld { job_id }
            | PoolEvent::JobStateChanged { job_id, .. }
            | PoolEvent::JobResolved { job_id, .. }
            | PoolEvent::JobProgress { job_id, .. }
            | PoolEvent::JobCompleted { job_id, .. }
            | PoolEvent::JobFailed { job_id, .. }
            | PoolEvent::JobCancelled { job_id } => Some(job_id),
            PoolEvent::OverallProgress { .. } => None,
        }
    }
}

struct ActiveWorker {
    handle: JoinHandle<()>,
    control: JobControlHandle,
    slot: OwnedSemaphorePermit,
}

pub struct WorkerPool {
    jobs: HashMap<String, DownloadJob>,
    /// Submission order, for snapshots
    order: Vec<String>,
    queue: VecDeque<String>,
    active: HashMap<String, ActiveWorker>,
    slots: Arc<Semaphore>,
    capacity: usize,
    /// Permits still to be retired after a shrink
    slot_debt: usize,
    context: WorkerContext,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl WorkerPool {
    pub fn new(
        adapter: ExtractionAdapter,
        remuxer: Arc<dyn Remuxer>,
        options: RequestOptions,
        capacity: usize,
        reports: mpsc::UnboundedSender<WorkerReport>,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            queue: VecDeque::new(),
            active: HashMap::new(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            slot_debt: 0,
            context: WorkerContext {
                adapter,
                remuxer,
                names: NameRegistry::new(),
                options,
                reports,
            },
            events,
        }
    }

    fn emit(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            debug!("No event listener attached to the pool");
        }
    }

    fn emit_overall(&self) {
        self.emit(PoolEvent::OverallProgress {
            progress: self.overall_progress(),
        });
    }

    fn job_mut(&mut self, job_id: &str) -> AppResult<&mut DownloadJob> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::Download(format!("Job not found: {}", job_id)))
    }

    /// Add a job to the tail of the queue and start it if a slot is free
    pub fn submit(&mut self, request: JobRequest) -> AppResult<String> {
        validate_url(&request.url)?;

        let job_id = Uuid::new_v4().to_string();
        let job = DownloadJob::from_request(job_id.clone(), &request);
        info!("Queued job {} for {} as {}", job_id, request.url, request.format);

        self.jobs.insert(job_id.clone(), job);
        self.order.push(job_id.clone());
        self.queue.push_back(job_id.clone());
        self.emit(PoolEvent::JobQueued {
            job_id: job_id.clone(),
            url: request.url,
        });

        self.dispatch();
        Ok(job_id)
    }

    /// Start queued jobs while slots are free. Returns how many started.
    pub fn dispatch(&mut self) -> usize {
        let mut started = 0;
        while let Some(job_id) = self.queue.front().cloned() {
            let runnable = self
                .jobs
                .get(&job_id)
                .map(|job| job.state == JobState::Queued && !job.on_hold)
                .unwrap_or(false);
            if !runnable {
                self.queue.pop_front();
                continue;
            }

            let slot = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.queue.pop_front();

            let request = match self.jobs.get(&job_id) {
                Some(job) => job.to_request(),
                None => continue,
            };
            let (control_handle, control) = job_control();
            let worker = DownloadWorker::new(job_id.clone(), request, self.context.clone(), control);
            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            info!(
                "🔄 Started download: {} via {} ({} active, {} queued)",
                job_id,
                self.context.adapter.backend_name(),
                self.active_count() + 1,
                self.queued_count()
            );
            self.active.insert(
                job_id,
                ActiveWorker {
                    handle,
                    control: control_handle,
                    slot,
                },
            );
            started += 1;
        }
        started
    }

    pub fn pause(&mut self, job_id: &str) -> AppResult<()> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| AppError::Download(format!("Job not found: {}", job_id)))?;
        if job.state.is_terminal() {
            return Err(AppError::Download(format!(
                "Job {} is already {}",
                job_id, job.state
            )));
        }

        if let Some(active) = self.active.get(job_id) {
            if job.state == JobState::Merging {
                return Err(AppError::Download(format!(
                    "Job {} is merging and cannot be paused",
                    job_id
                )));
            }
            if !active.control.pause() {
                return Err(AppError::Download(format!(
                    "Job {} is finishing and cannot be paused",
                    job_id
                )));
            }
            info!("⏸️ Paused download: {}", job_id);
            return Ok(());
        }

        if job.on_hold {
            return Ok(());
        }
        self.queue.retain(|queued| queued != job_id);
        let job = self.job_mut(job_id)?;
        job.on_hold = true;
        job.touch();
        info!("⏸️ Held queued job: {}", job_id);
        self.emit(PoolEvent::JobHeld {
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    pub fn resume(&mut self, job_id: &str) -> AppResult<()> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| AppError::Download(format!("Job not found: {}", job_id)))?;
        if job.state.is_terminal() {
            return Err(AppError::Download(format!(
                "Job {} is already {}",
                job_id, job.state
            )));
        }

        if let Some(active) = self.active.get(job_id) {
            active.control.resume();
            info!("▶️ Resumed download: {}", job_id);
            return Ok(());
        }

        if !job.on_hold {
            return Ok(());
        }
        let job = self.job_mut(job_id)?;
        job.on_hold = false;
        job.touch();
        let url = job.url.clone();
        self.queue.push_back(job_id.to_string());
        info!("▶️ Re-queued job: {}", job_id);
        self.emit(PoolEvent::JobQueued {
            job_id: job_id.to_string(),
            url,
        });
        self.dispatch();
        Ok(())
    }

    pub fn cancel(&mut self, job_id: &str) -> AppResult<()> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| AppError::Download(format!("Job not found: {}", job_id)))?;
        if job.state.is_terminal() {
            return Err(AppError::Download(format!(
                "Job {} is already {}",
                job_id, job.state
            )));
        }

        if let Some(active) = self.active.get(job_id) {
            active.control.cancel();
            debug!("Cancellation requested for {}", job_id);
            return Ok(());
        }

        self.queue.retain(|queued| queued != job_id);
        let job = self.job_mut(job_id)?;
        job.state = JobState::Cancelled;
        job.on_hold = false;
        job.touch();
        info!("🚫 Cancelled queued job: {}", job_id);
        self.emit(PoolEvent::JobStateChanged {
            job_id: job_id.to_string(),
            state: JobState::Cancelled,
        });
        self.emit(PoolEvent::JobCancelled {
            job_id: job_id.to_string(),
        });
        self.emit_overall();
        Ok(())
    }

    fn live_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.jobs
                    .get(*id)
                    .map(|job| !job.state.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Pause every job that can be paused; returns how many accepted it
    pub fn pause_all(&mut self) -> usize {
        self.live_ids()
            .iter()
            .filter(|id| self.pause(id).is_ok())
            .count()
    }

    pub fn resume_all(&mut self) -> usize {
        self.live_ids()
            .iter()
            .filter(|id| self.resume(id).is_ok())
            .count()
    }

    pub fn cancel_all(&mut self) -> usize {
        // Queued jobs first, so freed slots do not start them.
        let (queued, running): (Vec<String>, Vec<String>) = self
            .live_ids()
            .into_iter()
            .partition(|id| !self.active.contains_key(id));
        queued
            .iter()
            .chain(running.iter())
            .filter(|id| self.cancel(id).is_ok())
            .count()
    }

    /// Change the number of slots. Running jobs are never interrupted; a
    /// smaller pool takes effect as they finish.
    pub fn set_concurrency(&mut self, slots: usize) -> AppResult<usize> {
        if !PARALLEL_JOB_BOUNDS.contains(&slots) {
            return Err(AppError::Config(format!(
                "parallel jobs must be within {}..={}, got {}",
                PARALLEL_JOB_BOUNDS.start(),
                PARALLEL_JOB_BOUNDS.end(),
                slots
            )));
        }

        if slots > self.capacity {
            let grow = slots - self.capacity;
            let repaid = grow.min(self.slot_debt);
            self.slot_debt -= repaid;
            self.slots.add_permits(grow - repaid);
        } else if slots < self.capacity {
            let mut surplus = self.capacity - slots;
            while surplus > 0 {
                match self.slots.clone().try_acquire_owned() {
                    Ok(idle) => idle.forget(),
                    Err(_) => break,
                }
                surplus -= 1;
            }
            // busy slots are retired as their jobs finish
            self.slot_debt += surplus;
        }
        info!("Worker slots: {} -> {}", self.capacity, slots);
        self.capacity = slots;
        self.dispatch();
        Ok(slots)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued and nothing running
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty()
    }

    pub fn job(&self, job_id: &str) -> Option<DownloadJob> {
        self.jobs.get(job_id).cloned()
    }

    /// All jobs in submission order
    pub fn snapshot(&self) -> Vec<DownloadJob> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id).cloned())
            .collect()
    }

    pub fn overall_progress(&self) -> OverallProgress {
        let mut bytes_done = 0u64;
        let mut bytes_total = Some(0u64);
        let mut percent_sum = 0.0;
        let mut counted = 0usize;

        for job in self.jobs.values() {
            if job.state.occupies_slot() {
                bytes_done += job.progress.bytes_done;
                bytes_total = match (bytes_total, job.progress.bytes_total) {
                    (Some(sum), Some(total)) => Some(sum + total),
                    _ => None,
                };
            }
            match job.state {
                JobState::Cancelled => {}
                JobState::Completed => {
                    percent_sum += 100.0;
                    counted += 1;
                }
                _ => {
                    percent_sum += job.progress.percent;
                    counted += 1;
                }
            }
        }

        if bytes_done == 0 && bytes_total == Some(0) {
            bytes_total = None;
        }

        OverallProgress {
            bytes_done,
            bytes_total,
            average_percent: if counted == 0 {
                0.0
            } else {
                percent_sum / counted as f64
            },
            active_jobs: self.active.len(),
        }
    }

    /// Fold a worker report into the job table
    pub fn apply_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::State { job_id, state } => self.transition(&job_id, state),
            WorkerReport::Progress { job_id, progress } => {
                let changed = match self.jobs.get_mut(&job_id) {
                    Some(job) if !job.state.is_terminal() => job.progress.advance(progress),
                    Some(_) => false,
                    None => {
                        warn!("Received progress for unknown job {}", job_id);
                        false
                    }
                };
                if changed {
                    if let Some(job) = self.jobs.get(&job_id) {
                        self.emit(PoolEvent::JobProgress {
                            job_id: job_id.clone(),
                            progress: job.progress,
                        });
                    }
                    self.emit_overall();
                }
            }
            WorkerReport::Resolved {
                job_id,
                title,
                filesize,
            } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.title = Some(title.clone());
                    job.filesize = filesize;
                    job.touch();
                    self.emit(PoolEvent::JobResolved {
                        job_id,
                        title,
                        filesize,
                    });
                }
            }
            WorkerReport::Finished { job_id, outcome } => {
                self.finalize_job(&job_id, outcome);
                self.release_slot(&job_id);
                self.emit_overall();
                self.dispatch();
            }
        }
    }

    fn transition(&mut self, job_id: &str, next: JobState) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            warn!(
                "Received lifecycle event for unknown job {}; state will not be updated",
                job_id
            );
            return;
        };
        if job.state == next {
            return;
        }
        if !job.state.can_transition_to(next) {
            debug!("Ignoring {} -> {} for {}", job.state, next, job_id);
            return;
        }

        job.state = next;
        job.touch();
        self.emit(PoolEvent::JobStateChanged {
            job_id: job_id.to_string(),
            state: next,
        });
    }

    fn finalize_job(&mut self, job_id: &str, outcome: JobOutcome) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            warn!(
                "Received lifecycle event for unknown job {}; state will not be updated",
                job_id
            );
            return;
        };

        let next = match &outcome {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
        };
        if !job.state.can_transition_to(next) {
            warn!("Forcing {} -> {} for {}", job.state, next, job_id);
        }
        job.state = next;
        job.on_hold = false;
        job.touch();

        let event = match outcome {
            JobOutcome::Completed(path) => {
                job.output_path = Some(path.clone());
                job.progress = JobProgress::complete(job.progress.bytes_done);
                PoolEvent::JobCompleted {
                    job_id: job_id.to_string(),
                    output_path: path,
                }
            }
            JobOutcome::Failed(error) => {
                job.error = Some(error.clone());
                PoolEvent::JobFailed {
                    job_id: job_id.to_string(),
                    error,
                }
            }
            JobOutcome::Cancelled => PoolEvent::JobCancelled {
                job_id: job_id.to_string(),
            },
        };

        self.emit(PoolEvent::JobStateChanged {
            job_id: job_id.to_string(),
            state: next,
        });
        self.emit(event);
    }

    /// Free the slot of a job that reached a terminal state, or retire it
    /// if the pool was shrunk while the job ran
    fn release_slot(&mut self, job_id: &str) {
        let Some(worker) = self.active.remove(job_id) else {
            debug!("No active worker recorded for {}", job_id);
            return;
        };
        if self.slot_debt > 0 {
            self.slot_debt -= 1;
            worker.slot.forget();
        }
    }

    /// Slots a new job could take right now
    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Cancel everything and wait for the workers to unwind
    pub async fn shutdown(&mut self) {
        let cancelled = self.cancel_all();
        debug!("Shutting down pool, {} job(s) cancelled", cancelled);

        let workers: Vec<(String, ActiveWorker)> = self.active.drain().collect();
        for (job_id, worker) in workers {
            if let Err(err) = worker.handle.await {
                warn!("Worker for {} ended abnormally: {}", job_id, err);
            }
        }
    }
}
