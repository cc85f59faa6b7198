//! Single render worker draining the submission queue.
//!
//! Exactly one worker task exists per [`crate::service::RenderService`]. It
//! sleeps until the queue signals work, then pops ids one at a time and runs
//! each encode to completion before looking at the next id. Every per-job
//! failure, including a panic inside the encoder, is written to the job
//! record; nothing escapes the loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::{bounded_diagnostic, EncodeFailure, EncodeJob, Encoder, JobPaths};
use crate::job::JobStatus;
use crate::queue::SubmissionQueue;
use crate::registry::JobRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Active,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub work_dir: PathBuf,
    pub diagnostic_tail_chars: usize,
    pub max_finished_jobs: usize,
}

pub struct RenderWorker {
    registry: Arc<JobRegistry>,
    queue: Arc<SubmissionQueue>,
    encoder: Arc<dyn Encoder>,
    settings: WorkerSettings,
    active: Arc<AtomicBool>,
}

/// Owner-side view of the spawned worker task.
pub struct WorkerHandle {
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RenderWorker {
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<SubmissionQueue>,
        encoder: Arc<dyn Encoder>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            encoder,
            settings,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Moves the worker onto its own task. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let active = Arc::clone(&self.active);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { self.run(token).await });

        WorkerHandle {
            active,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(work_dir = %self.settings.work_dir.display(), "Render worker started");
        loop {
            self.drain(&shutdown).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.wait_for_work() => {}
            }
        }
        info!(pending = self.queue.len(), "Render worker stopped");
    }

    /// Processes queued ids until the queue is empty. Returns the number of
    /// jobs that reached a terminal state, or 0 if a drain pass was already
    /// running.
    pub async fn drain(&self, shutdown: &CancellationToken) -> usize {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let mut processed = 0;
        while !shutdown.is_cancelled() {
            let Some(job_id) = self.queue.pop_front() else {
                break;
            };
            if self.process(&job_id).await.is_some() {
                processed += 1;
            }
        }

        self.active.store(false, Ordering::Release);
        processed
    }

    /// Runs one job end to end and returns its terminal status, or `None`
    /// when the id was stale and skipped.
    async fn process(&self, job_id: &str) -> Option<JobStatus> {
        let scenes = self
            .registry
            .update(job_id, |job| job.mark_rendering().then(|| job.scenes.clone()))
            .flatten();
        let Some(scenes) = scenes else {
            debug!(job_id, "Skipping queued id without a QUEUED record");
            return None;
        };

        info!(job_id, scenes = scenes.len(), "Render started");

        let encode_job = EncodeJob {
            job_id: job_id.to_string(),
            scenes,
            paths: JobPaths::for_job(&self.settings.work_dir, job_id),
        };
        let output = encode_job.paths.output.clone();
        let encoder = Arc::clone(&self.encoder);

        let outcome = tokio::task::spawn_blocking(move || {
            prepare_output_slot(&encode_job.paths)?;
            encoder.encode(&encode_job)
        })
        .await
        .unwrap_or_else(|join_err| Err(EncodeFailure::Aborted(join_err.to_string())));

        let status = match outcome {
            Ok(()) => {
                self.registry
                    .update(job_id, |job| job.mark_done(output.clone()));
                info!(job_id, artifact = %output.display(), "Render finished");
                JobStatus::Done
            }
            Err(failure) => {
                let diagnostic =
                    bounded_diagnostic(&failure.to_string(), self.settings.diagnostic_tail_chars);
                error!(job_id, error = %diagnostic, "Render failed");
                self.registry
                    .update(job_id, |job| job.mark_failed(diagnostic));
                JobStatus::Error
            }
        };

        self.enforce_retention(job_id).await;
        Some(status)
    }

    /// `just_finished` is kept regardless of the limit so its outcome stays
    /// observable.
    async fn enforce_retention(&self, just_finished: &str) {
        for evicted in self
            .registry
            .evict_finished(self.settings.max_finished_jobs, just_finished)
        {
            debug!(job_id = %evicted.id, status = %evicted.status, "Evicting finished job");
            if let Some(artifact) = evicted.artifact_path {
                if let Err(e) = tokio::fs::remove_file(&artifact).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(job_id = %evicted.id, path = %artifact.display(), error = %e, "Failed to delete evicted artifact");
                    }
                }
            }
        }
    }
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        state_from_flag(&self.active)
    }

    /// Stops the loop between jobs. An encode already running finishes and
    /// is recorded; ids still queued stay QUEUED.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Render worker task ended abnormally");
            }
        }
    }
}

fn state_from_flag(active: &AtomicBool) -> WorkerState {
    if active.load(Ordering::Acquire) {
        WorkerState::Active
    } else {
        WorkerState::Idle
    }
}

/// Creates the work directory and removes any artifact left by an earlier run.
fn prepare_output_slot(paths: &JobPaths) -> Result<(), EncodeFailure> {
    let prepare_err = |path: &Path, source| EncodeFailure::Prepare {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = paths.output.parent() {
        std::fs::create_dir_all(dir).map_err(|e| prepare_err(dir, e))?;
    }
    match std::fs::remove_file(&paths.output) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(prepare_err(&paths.output, e)),
    }
}
