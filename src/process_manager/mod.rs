// Fetch engine boundary
// The engine performs format negotiation and byte retrieval; the download
// module only drives it through `FetchEngine` and observes it through
// `EngineSession`.

pub mod ytdlp;

use crate::models::{DownloadMode, QualitySelector};
use std::path::PathBuf;
use thiserror::Error;

pub use ytdlp::YtDlpEngine;

/// Everything the engine needs for one retrieval
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_url: String,
    pub quality: QualitySelector,
    pub mode: DownloadMode,
    pub destination_dir: PathBuf,
}

/// One native progress callback from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineProgress {
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_seconds: Option<u64>,
    pub filename: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub file_path: Option<PathBuf>,
}

/// Returned by a session when the job was cancelled. Engines must unwind
/// without reporting further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Fatal(String),

    #[error("interrupted")]
    Interrupted,
}

impl From<Interrupted> for EngineError {
    fn from(_: Interrupted) -> Self {
        EngineError::Interrupted
    }
}

/// The worker-side view of a job while the engine runs
pub trait EngineSession {
    /// Reports one progress callback. Blocks while the job is paused and
    /// fails once the job is cancelled.
    fn on_progress(&mut self, progress: EngineProgress) -> Result<(), Interrupted>;

    /// Checkpoint for engines that go quiet between callbacks. Same
    /// blocking behavior as `on_progress`.
    fn checkpoint(&mut self) -> Result<(), Interrupted>;

    /// Reports one progress callback without ever blocking. Fails once the
    /// job is cancelled; a pending pause is left for `pause_requested`.
    fn report(&mut self, progress: EngineProgress) -> Result<(), Interrupted>;

    /// Non-blocking counterpart of `checkpoint`
    fn poll(&mut self) -> Result<(), Interrupted>;

    /// Whether a pause is waiting to be honored. Engines that hold a live
    /// transfer release it first, then call `checkpoint` to wait.
    fn pause_requested(&self) -> bool;
}

/// Synchronous retrieval, run on the job's worker thread
pub trait FetchEngine: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(
        &self,
        request: &FetchRequest,
        session: &mut dyn EngineSession,
    ) -> Result<FetchOutcome, EngineError>;
}
