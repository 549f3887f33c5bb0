// Download data models
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    Video,
    AudioOnly,
}

impl FromStr for DownloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "video" => Ok(DownloadMode::Video),
            "audio" | "audio_only" | "audio-only" => Ok(DownloadMode::AudioOnly),
            other => Err(format!("Unknown download mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QualitySelector {
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
}

impl QualitySelector {
    /// Height cap in pixels, `None` for the best available
    pub fn max_height(&self) -> Option<u32> {
        match self {
            QualitySelector::Max => None,
            QualitySelector::P1080 => Some(1080),
            QualitySelector::P720 => Some(720),
            QualitySelector::P480 => Some(480),
        }
    }
}

impl FromStr for QualitySelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().trim_end_matches('p') {
            "max" | "best" => Ok(QualitySelector::Max),
            "1080" => Ok(QualitySelector::P1080),
            "720" => Ok(QualitySelector::P720),
            "480" => Ok(QualitySelector::P480),
            _ => Err(format!("Unknown quality: {}", s)),
        }
    }
}

impl fmt::Display for QualitySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_height() {
            Some(height) => write!(f, "{}p", height),
            None => write!(f, "max"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }

    /// Running or Paused: a worker exists for the job
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::Paused)
    }

    /// Transition table of the lifecycle state machine
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }
}

/// Why a job ended in Failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientFetch,
    UnavailableSource,
    Engine,
    WorkerLost,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Pause,
    Resume,
    Cancel,
}

impl FromStr for ControlSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pause" => Ok(ControlSignal::Pause),
            "resume" => Ok(ControlSignal::Resume),
            "cancel" => Ok(ControlSignal::Cancel),
            other => Err(format!("Unknown control signal: {}", other)),
        }
    }
}

/// Latest known progress for a job. Replaced wholesale on every update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
    pub filename: String,
    /// Milliseconds on the writer process's monotonic clock
    pub timestamp_monotonic: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> Option<u8> {
        match self.bytes_total {
            Some(total) if total > 0 => {
                let pct = (self.bytes_downloaded as f64 / total as f64) * 100.0;
                Some(pct.min(100.0) as u8)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub source_url: String,
    pub mode: DownloadMode,
    pub quality: QualitySelector,
    pub destination_dir: PathBuf,
    pub state: JobState,
    pub filename_prefix: Option<String>,
    pub file_path: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl DownloadJob {
    pub fn new(
        source_url: String,
        mode: DownloadMode,
        quality: QualitySelector,
        destination_dir: PathBuf,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_url,
            mode,
            quality,
            destination_dir,
            state: JobState::Pending,
            filename_prefix: None,
            file_path: None,
            error: None,
            failure_kind: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            finished_at: None,
        }
    }
}
