use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobStatus;

pub type RenderResult<T> = Result<T, RenderError>;

/// Synchronous failures surfaced to callers of the render service. Encoder
/// failures never appear here; they are recorded on the job instead.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{0}")]
    Validation(String),

    #[error("Job not found")]
    NotFound { id: String },

    #[error("Job is not ready (status: {status})")]
    NotReady { id: String, status: JobStatus },

    #[error("Artifact not found")]
    MissingArtifact { id: String, path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}
