//! Download runtime command router.
//!
//! A single task owns the [`WorkerPool`]. Front ends talk to it through a
//! cloneable [`PoolHandle`]; workers talk to it through their report
//! channel. Both are serialized here, so the pool never needs a lock.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, trace};

use crate::core::config::AppConfig;
use crate::core::extraction::{ExtractionAdapter, MediaBackend, RequestOptions};
use crate::core::models::{AppError, AppResult, DownloadJob, JobRequest, OverallProgress};
use crate::core::pool::{PoolEvent, WorkerPool};
use crate::core::remux::Remuxer;
use crate::core::worker::WorkerReport;

pub const COMMAND_CAPACITY: usize = 256;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Commands understood by the runtime router.
#[derive(Debug)]
pub enum PoolCommand {
    Submit {
        request: JobRequest,
        respond_to: oneshot::Sender<AppResult<String>>,
    },
    Pause {
        job_id: String,
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    Resume {
        job_id: String,
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    Cancel {
        job_id: String,
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    PauseAll {
        respond_to: oneshot::Sender<AppResult<usize>>,
    },
    ResumeAll {
        respond_to: oneshot::Sender<AppResult<usize>>,
    },
    CancelAll {
        respond_to: oneshot::Sender<AppResult<usize>>,
    },
    Job {
        job_id: String,
        respond_to: oneshot::Sender<AppResult<DownloadJob>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<AppResult<Vec<DownloadJob>>>,
    },
    Overall {
        respond_to: oneshot::Sender<AppResult<OverallProgress>>,
    },
    SetConcurrency {
        slots: usize,
        respond_to: oneshot::Sender<AppResult<usize>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<AppResult<()>>,
    },
}

/// Handle exposed to front ends.
#[derive(Clone)]
pub struct PoolHandle {
    sender: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    pub fn new(sender: mpsc::Sender<PoolCommand>) -> Self {
        Self { sender }
    }

    async fn send_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<AppResult<T>>) -> PoolCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| AppError::System(format!("Download runtime unavailable: {}", e)))?;
        rx.await
            .map_err(|_| AppError::System("Download runtime dropped response".into()))?
    }

    pub async fn submit(&self, request: JobRequest) -> AppResult<String> {
        self.send_command(|tx| PoolCommand::Submit {
            request,
            respond_to: tx,
        })
        .await
    }

    pub async fn pause(&self, job_id: impl Into<String>) -> AppResult<()> {
        let job_id = job_id.into();
        self.send_command(|tx| PoolCommand::Pause {
            job_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn resume(&self, job_id: impl Into<String>) -> AppResult<()> {
        let job_id = job_id.into();
        self.send_command(|tx| PoolCommand::Resume {
            job_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn cancel(&self, job_id: impl Into<String>) -> AppResult<()> {
        let job_id = job_id.into();
        self.send_command(|tx| PoolCommand::Cancel {
            job_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn pause_all(&self) -> AppResult<usize> {
        self.send_command(|tx| PoolCommand::PauseAll { respond_to: tx })
            .await
    }

    pub async fn resume_all(&self) -> AppResult<usize> {
        self.send_command(|tx| PoolCommand::ResumeAll { respond_to: tx })
            .await
    }

    pub async fn cancel_all(&self) -> AppResult<usize> {
        self.send_command(|tx| PoolCommand::CancelAll { respond_to: tx })
            .await
    }

    pub async fn job(&self, job_id: impl Into<String>) -> AppResult<DownloadJob> {
        let job_id = job_id.into();
        self.send_command(|tx| PoolCommand::Job {
            job_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn snapshot(&self) -> AppResult<Vec<DownloadJob>> {
        self.send_command(|tx| PoolCommand::Snapshot { respond_to: tx })
            .await
    }

    pub async fn overall_progress(&self) -> AppResult<OverallProgress> {
        self.send_command(|tx| PoolCommand::Overall { respond_to: tx })
            .await
    }

    pub async fn set_concurrency(&self, slots: usize) -> AppResult<usize> {
        self.send_command(|tx| PoolCommand::SetConcurrency {
            slots,
            respond_to: tx,
        })
        .await
    }

    /// Cancel everything, wait for the workers and stop the router
    pub async fn shutdown(&self) -> AppResult<()> {
        self.send_command(|tx| PoolCommand::Shutdown { respond_to: tx })
            .await
    }
}

/// Pool sizing and per-request defaults
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub slots: usize,
    pub options: RequestOptions,
    /// Bound of the front-end event channel
    pub event_capacity: usize,
}

impl PoolSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            slots: config.worker_slots(),
            options: RequestOptions::from_config(config),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots.max(1);
        self
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            slots: 1,
            options: RequestOptions::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Spawn the router on the current tokio runtime. Returns the command
/// handle and the event stream for the front end.
pub fn spawn_pool(
    backend: Arc<dyn MediaBackend>,
    remuxer: Arc<dyn Remuxer>,
    settings: PoolSettings,
) -> (PoolHandle, mpsc::Receiver<PoolEvent>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::channel(settings.event_capacity.max(1));

    info!(
        "[RUNTIME] Starting pool with {} slot(s) on {}",
        settings.slots,
        backend.name()
    );
    let pool = WorkerPool::new(
        ExtractionAdapter::new(backend),
        remuxer,
        settings.options,
        settings.slots,
        report_tx,
        event_tx,
    );

    tokio::spawn(forward_events(event_rx, ui_tx));
    tokio::spawn(router_loop(pool, command_rx, report_rx));

    (PoolHandle::new(command_tx), ui_rx)
}

/// Copy pool events to the front end. Lifecycle events wait for room;
/// progress events are dropped when the front end lags.
async fn forward_events(mut events: mpsc::UnboundedReceiver<PoolEvent>, ui: mpsc::Sender<PoolEvent>) {
    let mut dropped = 0u64;
    while let Some(event) = events.recv().await {
        if event.is_progress() {
            match ui.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    trace!("Dropped progress event ({} so far)", dropped);
                }
                Err(TrySendError::Closed(_)) => break,
            }
        } else if ui.send(event).await.is_err() {
            break;
        }
    }
    debug!("Event forwarder stopped, {} progress event(s) dropped", dropped);
}

async fn router_loop(
    mut pool: WorkerPool,
    mut commands: mpsc::Receiver<PoolCommand>,
    mut reports: mpsc::UnboundedReceiver<WorkerReport>,
) {
    loop {
        tokio::select! {
            biased;
            Some(report) = reports.recv() => {
                pool.apply_report(report);
                if pool.is_idle() {
                    debug!("All submitted jobs settled");
                }
            }
            command = commands.recv() => match command {
                Some(PoolCommand::Shutdown { respond_to }) => {
                    shutdown(&mut pool, &mut reports).await;
                    let _ = respond_to.send(Ok(()));
                    break;
                }
                Some(command) => handle_command(&mut pool, command),
                None => {
                    shutdown(&mut pool, &mut reports).await;
                    break;
                }
            },
        }
    }
    debug!("Download runtime channel closed, exiting router loop");
}

async fn shutdown(pool: &mut WorkerPool, reports: &mut mpsc::UnboundedReceiver<WorkerReport>) {
    pool.shutdown().await;
    while let Ok(report) = reports.try_recv() {
        pool.apply_report(report);
    }
    info!("[RUNTIME] Pool stopped");
}

#[instrument(skip(pool, command), fields(?command))]
fn handle_command(pool: &mut WorkerPool, command: PoolCommand) {
    match command {
        PoolCommand::Submit {
            request,
            respond_to,
        } => {
            let _ = respond_to.send(pool.submit(request));
        }
        PoolCommand::Pause { job_id, respond_to } => {
            let _ = respond_to.send(pool.pause(&job_id));
        }
        PoolCommand::Resume { job_id, respond_to } => {
            let _ = respond_to.send(pool.resume(&job_id));
        }
        PoolCommand::Cancel { job_id, respond_to } => {
            let _ = respond_to.send(pool.cancel(&job_id));
        }
        PoolCommand::PauseAll { respond_to } => {
            let _ = respond_to.send(Ok(pool.pause_all()));
        }
        PoolCommand::ResumeAll { respond_to } => {
            let _ = respond_to.send(Ok(pool.resume_all()));
        }
        PoolCommand::CancelAll { respond_to } => {
            let _ = respond_to.send(Ok(pool.cancel_all()));
        }
        PoolCommand::Job { job_id, respond_to } => {
            let result = pool
                .job(&job_id)
                .ok_or_else(|| AppError::Download(format!("Job not found: {}", job_id)));
            let _ = respond_to.send(result);
        }
        PoolCommand::Snapshot { respond_to } => {
            let _ = respond_to.send(Ok(pool.snapshot()));
        }
        PoolCommand::Overall { respond_to } => {
            let _ = respond_to.send(Ok(pool.overall_progress()));
        }
        PoolCommand::SetConcurrency { slots, respond_to } => {
            let _ = respond_to.send(pool.set_concurrency(slots));
        }
        PoolCommand::Shutdown { respond_to } => {
            debug!("Shutdown is handled by the router loop");
            let _ = respond_to.send(Ok(()));
        }
    }
}
