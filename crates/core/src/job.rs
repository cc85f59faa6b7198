//! Render job record and its status lifecycle.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Rendering,
    Done,
    Error,
}

impl JobStatus {
    /// QUEUED and RENDERING jobs own a pending or in-flight execution.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Rendering)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Rendering)
                | (JobStatus::Rendering, JobStatus::Done)
                | (JobStatus::Rendering, JobStatus::Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Rendering => "RENDERING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a job's input: free text drawn over the rendered frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub onscreen_text: String,
}

impl Scene {
    pub fn new(onscreen_text: impl Into<String>) -> Self {
        Self {
            onscreen_text: onscreen_text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub scenes: Vec<Scene>,
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn queued(id: impl Into<String>, scenes: Vec<Scene>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            scenes,
            error: None,
            artifact_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_rendering(&mut self) -> bool {
        self.transition(JobStatus::Rendering)
    }

    pub fn mark_done(&mut self, artifact_path: PathBuf) -> bool {
        if !self.transition(JobStatus::Done) {
            return false;
        }
        self.artifact_path = Some(artifact_path);
        self.error = None;
        true
    }

    pub fn mark_failed(&mut self, error: String) -> bool {
        if !self.transition(JobStatus::Error) {
            return false;
        }
        self.error = Some(error);
        self.artifact_path = None;
        true
    }

    fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            status: self.status,
            error: self.error.clone(),
            artifact_path: self.artifact_path.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time copy of a job's observable state, detached from the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
