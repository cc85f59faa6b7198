//! Render service: the one object request handlers talk to.
//!
//! Owns the registry, the submission queue and the worker handle. Built once
//! at startup and cloned into handler state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::encoder::{Encoder, FfmpegEncoder};
use crate::error::{RenderError, RenderResult};
use crate::job::{Job, JobSnapshot, JobStatus, Scene};
use crate::queue::SubmissionQueue;
use crate::registry::{Admission, JobRegistry};
use crate::worker::{RenderWorker, WorkerHandle, WorkerSettings, WorkerState};

#[derive(Clone)]
pub struct RenderService {
    inner: Arc<RenderServiceInner>,
}

struct RenderServiceInner {
    registry: Arc<JobRegistry>,
    queue: Arc<SubmissionQueue>,
    worker: WorkerHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub id: String,
    pub status: JobStatus,
    /// True when an active job with this id already existed and no new work
    /// was queued.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub queued: usize,
    pub jobs: usize,
    pub worker: WorkerState,
}

impl RenderService {
    /// Spawns the worker; must be called from within a Tokio runtime.
    pub fn start(encoder: Arc<dyn Encoder>, settings: WorkerSettings) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let queue = Arc::new(SubmissionQueue::new());
        let worker =
            RenderWorker::new(Arc::clone(&registry), Arc::clone(&queue), encoder, settings)
                .spawn();

        Self {
            inner: Arc::new(RenderServiceInner {
                registry,
                queue,
                worker,
            }),
        }
    }

    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Self {
        let settings = WorkerSettings {
            work_dir: config.work_dir(data_dir),
            diagnostic_tail_chars: config.render.diagnostic_tail_chars,
            max_finished_jobs: config.retention.max_finished_jobs,
        };
        let encoder = Arc::new(FfmpegEncoder::new(config.render.clone()));
        Self::start(encoder, settings)
    }

    /// Registers a render request and returns without waiting for it.
    pub fn submit(&self, id: &str, scenes: Vec<Scene>) -> RenderResult<SubmitOutcome> {
        if id.trim().is_empty() {
            return Err(RenderError::validation("Missing id"));
        }
        if scenes.is_empty() {
            return Err(RenderError::validation("No scenes provided"));
        }

        let scene_count = scenes.len();
        match self.inner.registry.admit(Job::queued(id, scenes)) {
            Admission::Duplicate(status) => {
                debug!(job_id = id, %status, "Duplicate submission for active job");
                Ok(SubmitOutcome {
                    id: id.to_string(),
                    status,
                    duplicate: true,
                })
            }
            Admission::Created => {
                self.inner.queue.enqueue(id.to_string());
                info!(job_id = id, scenes = scene_count, "Job queued");
                Ok(SubmitOutcome {
                    id: id.to_string(),
                    status: JobStatus::Queued,
                    duplicate: false,
                })
            }
        }
    }

    pub fn status(&self, id: &str) -> RenderResult<JobSnapshot> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| RenderError::not_found(id))
    }

    /// Number of ids ahead of `id` in the submission queue, if it is queued.
    pub fn queue_position(&self, id: &str) -> Option<usize> {
        self.inner.queue.position(id)
    }

    /// Resolves the artifact of a DONE job, checking it still exists on disk.
    pub async fn retrieve(&self, id: &str) -> RenderResult<Artifact> {
        let snapshot = self.status(id)?;
        if snapshot.status != JobStatus::Done {
            return Err(RenderError::NotReady {
                id: id.to_string(),
                status: snapshot.status,
            });
        }

        let path = snapshot
            .artifact_path
            .ok_or_else(|| RenderError::MissingArtifact {
                id: id.to_string(),
                path: PathBuf::new(),
            })?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                return Err(RenderError::MissingArtifact {
                    id: id.to_string(),
                    path,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::MissingArtifact {
                    id: id.to_string(),
                    path,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{id}.mp4"));

        Ok(Artifact {
            path,
            file_name,
            size: metadata.len(),
        })
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            queued: self.inner.queue.len(),
            jobs: self.inner.registry.len(),
            worker: self.inner.worker.state(),
        }
    }

    pub async fn shutdown(&self) {
        self.inner.worker.shutdown().await;
    }
}
