//! Per-job pause and cancel tokens
//!
//! The pool keeps the [`JobControlHandle`]; the worker and the backend
//! share the [`JobControl`] and poll it at every chunk boundary.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::models::{AppError, AppResult};

type HoldListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Pool side: flips the tokens
#[derive(Debug, Clone)]
pub struct JobControlHandle {
    cancel: CancellationToken,
    pause_tx: Arc<watch::Sender<bool>>,
    sealed: Arc<Mutex<bool>>,
}

impl JobControlHandle {
    /// Request a hold. Returns `false` once the worker has sealed the job
    /// for its final step; the request is then ignored.
    pub fn pause(&self) -> bool {
        let sealed = self.sealed.lock();
        if *sealed {
            return false;
        }
        self.pause_tx.send_replace(true);
        true
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }
}

/// Worker side: observes the tokens
#[derive(Clone)]
pub struct JobControl {
    cancel: CancellationToken,
    pause_rx: watch::Receiver<bool>,
    sealed: Arc<Mutex<bool>>,
    on_hold: Option<HoldListener>,
}

/// Create a linked handle/observer pair
pub fn job_control() -> (JobControlHandle, JobControl) {
    let cancel = CancellationToken::new();
    let (pause_tx, pause_rx) = watch::channel(false);
    let sealed = Arc::new(Mutex::new(false));

    (
        JobControlHandle {
            cancel: cancel.clone(),
            pause_tx: Arc::new(pause_tx),
            sealed: sealed.clone(),
        },
        JobControl {
            cancel,
            pause_rx,
            sealed,
            on_hold: None,
        },
    )
}

impl JobControl {
    /// Called with `true` when a checkpoint starts holding, `false` when it
    /// lets the job continue.
    pub fn with_hold_listener(mut self, listener: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_hold = Some(Arc::new(listener));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    /// Refuse further pause requests. A pause accepted before the seal is
    /// still honoured by the next `checkpoint`.
    pub fn seal(&self) {
        *self.sealed.lock() = true;
    }

    /// Resolves once the job is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Resolves once the job is paused. Never resolves if the pool dropped
    /// the handle.
    pub async fn paused(&self) {
        let mut rx = self.pause_rx.clone();
        if rx.wait_for(|paused| *paused).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Waits until the pause flag clears. Returns `false` if the pool
    /// dropped the handle.
    pub async fn wait_resumed(&self) -> bool {
        let mut rx = self.pause_rx.clone();
        let resumed = rx.wait_for(|paused| !*paused).await.is_ok();
        resumed
    }

    /// Chunk boundary: fail with `Cancelled`, hold while paused, or pass.
    pub async fn checkpoint(&self) -> AppResult<()> {
        if self.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if !self.is_paused() {
            return Ok(());
        }

        if let Some(listener) = &self.on_hold {
            listener(true);
        }
        let resumed = tokio::select! {
            _ = self.cancel.cancelled() => false,
            ok = self.wait_resumed() => ok,
        };
        if !resumed || self.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if let Some(listener) = &self.on_hold {
            listener(false);
        }
        Ok(())
    }
}
