// Warmup lifecycle: exactly one warmup runs at a time, later callers
// wait for it, and a failed attempt leaves the state retryable.

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pipeline::RagPipeline;
use crate::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupState {
    NotStarted,
    InProgress,
    Complete,
}

/// Single-flight gate around an idempotent warmup routine.
pub struct WarmupManager {
    state: Mutex<WarmupState>,
    notify: Notify,
}

impl Default for WarmupManager {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl WarmupManager {
    #[inline]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WarmupState::NotStarted),
            notify: Notify::new(),
        }
    }

    #[inline]
    pub async fn state(&self) -> WarmupState {
        *self.state.lock().await
    }

    /// Run `routine` to completion exactly once. The first caller
    /// becomes the runner; concurrent callers wait for its outcome. On
    /// failure the state resets so a later caller can try again, and
    /// every waiter of the failed round re-contends for the runner
    /// role.
    #[inline]
    pub async fn ensure_ready<F, Fut>(&self, routine: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            let run = {
                let mut state = self.state.lock().await;
                match *state {
                    WarmupState::Complete => return Ok(()),
                    WarmupState::NotStarted => {
                        *state = WarmupState::InProgress;
                        true
                    }
                    WarmupState::InProgress => false,
                }
            };

            if run {
                let outcome = routine().await;
                let mut state = self.state.lock().await;
                match &outcome {
                    Ok(()) => {
                        *state = WarmupState::Complete;
                        info!("warmup complete");
                    }
                    Err(e) => {
                        *state = WarmupState::NotStarted;
                        warn!(error = %e, "warmup failed, state reset");
                    }
                }
                drop(state);
                self.notify.notify_waiters();
                return outcome;
            }

            // Register interest before re-checking so a finishing
            // runner cannot slip between the check and the await.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state().await == WarmupState::InProgress {
                notified.await;
            }
        }
    }
}

/// The pipeline plus its warmup gate; the app-level handle the CLI and
/// any embedding server hold on to.
#[derive(Clone)]
pub struct RagService {
    pipeline: Arc<RagPipeline>,
    warmup: Arc<WarmupManager>,
    auto_build: bool,
}

impl RagService {
    #[inline]
    pub fn new(pipeline: Arc<RagPipeline>, auto_build: bool) -> Self {
        Self {
            pipeline,
            warmup: Arc::new(WarmupManager::new()),
            auto_build,
        }
    }

    #[inline]
    pub fn pipeline(&self) -> &Arc<RagPipeline> {
        &self.pipeline
    }

    #[inline]
    pub async fn warmup_state(&self) -> WarmupState {
        self.warmup.state().await
    }

    /// Warm up, or wait for the warmup already in flight.
    #[inline]
    pub async fn warmup(&self) -> Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let auto_build = self.auto_build;
        self.warmup
            .ensure_ready(move || {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.warm(auto_build).await }
            })
            .await
    }

    /// Synchronous entry point for callers without a runtime. Errors
    /// when called from inside one; use `warmup().await` there.
    #[inline]
    pub fn warmup_blocking(&self) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(RagError::Other(anyhow::anyhow!(
                "warmup_blocking called from within an async runtime"
            )));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.warmup())
    }

    /// Kick off warmup in the background; the handle resolves to the
    /// warmup outcome.
    #[inline]
    pub fn spawn_warmup(&self) -> JoinHandle<Result<()>> {
        let service = self.clone();
        tokio::spawn(async move { service.warmup().await })
    }
}
