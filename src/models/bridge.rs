// State Sync Bridge records and cross-process control requests
use super::download::{
    ControlSignal, DownloadJob, DownloadMode, FailureKind, JobState, ProgressSnapshot,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Externally readable state of one job, persisted by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub job_id: String,
    pub state: JobState,
    pub snapshot: Option<ProgressSnapshot>,
    /// Unix milliseconds
    pub updated_at: i64,
    pub source_url: String,
    pub mode: DownloadMode,
    pub destination_dir: PathBuf,
    #[serde(default)]
    pub filename_prefix: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
}

impl BridgeRecord {
    pub fn from_job(job: &DownloadJob, snapshot: Option<ProgressSnapshot>) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.state,
            snapshot,
            updated_at: chrono::Utc::now().timestamp_millis(),
            source_url: job.source_url.clone(),
            mode: job.mode,
            destination_dir: job.destination_dir.clone(),
            filename_prefix: job.filename_prefix.clone(),
            file_path: job.file_path.clone(),
            error: job.error.clone(),
            failure_kind: job.failure_kind,
        }
    }
}

/// A control signal submitted by an out-of-process UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub job_id: String,
    pub signal: ControlSignal,
    pub requested_at: i64,
}

impl ControlRequest {
    pub fn new(job_id: String, signal: ControlSignal) -> Self {
        Self {
            job_id,
            signal,
            requested_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// User's answer when a Running record has gone stale
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    MarkFailed,
    AssumeRunning,
}
