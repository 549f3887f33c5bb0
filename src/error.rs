use crate::models::{FailureKind, JobState};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Cannot {operation} job {job_id} while it is {state:?}")]
    InvalidState {
        job_id: String,
        state: JobState,
        operation: &'static str,
    },

    #[error("Network failure after {attempts} attempt(s): {message}")]
    TransientFetch { attempts: u32, message: String },

    #[error("Video unavailable or private: {0}")]
    UnavailableSource(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Cleanup removed {removed} file(s) but {} could not be deleted", failures.len())]
    CleanupPartialFailure {
        removed: usize,
        failures: Vec<(PathBuf, String)>,
    },

    #[error("No status update for job {job_id} in {age_ms} ms")]
    StaleStateDetected { job_id: String, age_ms: i64 },

    #[error("Download not found: {0}")]
    JobNotFound(String),

    #[error("Please enter a valid YouTube URL: {0}")]
    InvalidUrl(String),

    #[error("Maximum concurrent downloads reached ({active}/{max})")]
    ConcurrencyLimit { active: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Download engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DownloadError {
    /// Classification recorded on a Failed job. `None` for errors that never
    /// end a job in Failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DownloadError::TransientFetch { .. } => Some(FailureKind::TransientFetch),
            DownloadError::UnavailableSource(_) => Some(FailureKind::UnavailableSource),
            DownloadError::Engine(_) | DownloadError::Io(_) | DownloadError::Json(_) => {
                Some(FailureKind::Engine)
            }
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

impl serde::Serialize for DownloadError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
