// Settings data models
use super::download::{DownloadMode, QualitySelector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub download_path: String,
    pub default_quality: QualitySelector,
    #[serde(default = "default_mode")]
    pub default_mode: DownloadMode,
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_stale_after_intervals")]
    pub stale_after_intervals: u32,
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default = "default_audio_quality")]
    pub audio_quality: String,
}

fn default_mode() -> DownloadMode {
    DownloadMode::Video
}

fn default_max_fetch_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_checkpoint_interval_ms() -> u64 {
    100
}

fn default_sync_interval_ms() -> u64 {
    400
}

fn default_stale_after_intervals() -> u32 {
    3
}

fn default_ytdlp_path() -> String {
    String::from("yt-dlp")
}

fn default_audio_format() -> String {
    String::from("mp3")
}

fn default_audio_quality() -> String {
    String::from("192K")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: String::from("Mediagrab"),
            default_quality: QualitySelector::Max,
            default_mode: default_mode(),
            max_concurrent_downloads: 3,
            max_fetch_attempts: default_max_fetch_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            stale_after_intervals: default_stale_after_intervals(),
            ytdlp_path: default_ytdlp_path(),
            audio_format: default_audio_format(),
            audio_quality: default_audio_quality(),
        }
    }
}
