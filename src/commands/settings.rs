// Settings command handlers - file storage with partial updates
use crate::error::{DownloadError, DownloadResult};
use crate::file_manager::{read_json_file_or_default, write_json_file};
use crate::models::{DownloadMode, QualitySelector, Settings};
use crate::utils::get_settings_json_path;
use log::debug;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSettingsParams {
    pub download_path: Option<String>,
    pub default_quality: Option<String>,
    pub default_mode: Option<String>,
    pub max_concurrent_downloads: Option<u32>,
    pub max_fetch_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub checkpoint_interval_ms: Option<u64>,
    pub sync_interval_ms: Option<u64>,
    pub stale_after_intervals: Option<u32>,
    pub ytdlp_path: Option<String>,
    pub audio_format: Option<String>,
    pub audio_quality: Option<String>,
}

/// Get current settings from the JSON file
pub fn get_settings() -> DownloadResult<Settings> {
    load_settings(&get_settings_json_path())
}

/// Update settings with partial update support
pub fn update_settings(settings: UpdateSettingsParams) -> DownloadResult<Settings> {
    update_settings_at(&get_settings_json_path(), settings)
}

fn load_settings(path: &Path) -> DownloadResult<Settings> {
    read_json_file_or_default(path)
}

fn update_settings_at(path: &Path, settings: UpdateSettingsParams) -> DownloadResult<Settings> {
    let mut current_settings = load_settings(path)?;

    if let Some(download_path) = settings.download_path {
        current_settings.download_path = download_path;
    }
    if let Some(default_quality) = settings.default_quality {
        current_settings.default_quality = default_quality
            .parse::<QualitySelector>()
            .map_err(DownloadError::InvalidArgument)?;
    }
    if let Some(default_mode) = settings.default_mode {
        current_settings.default_mode = default_mode
            .parse::<DownloadMode>()
            .map_err(DownloadError::InvalidArgument)?;
    }
    if let Some(max_concurrent_downloads) = settings.max_concurrent_downloads {
        if max_concurrent_downloads == 0 {
            return Err(DownloadError::InvalidArgument(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        current_settings.max_concurrent_downloads = max_concurrent_downloads;
    }
    if let Some(max_fetch_attempts) = settings.max_fetch_attempts {
        current_settings.max_fetch_attempts = max_fetch_attempts.max(1);
    }
    if let Some(retry_backoff_ms) = settings.retry_backoff_ms {
        current_settings.retry_backoff_ms = retry_backoff_ms;
    }
    if let Some(checkpoint_interval_ms) = settings.checkpoint_interval_ms {
        current_settings.checkpoint_interval_ms = checkpoint_interval_ms.clamp(10, 200);
    }
    if let Some(sync_interval_ms) = settings.sync_interval_ms {
        current_settings.sync_interval_ms = sync_interval_ms;
    }
    if let Some(stale_after_intervals) = settings.stale_after_intervals {
        current_settings.stale_after_intervals = stale_after_intervals.max(1);
    }
    if let Some(ytdlp_path) = settings.ytdlp_path {
        current_settings.ytdlp_path = ytdlp_path;
    }
    if let Some(audio_format) = settings.audio_format {
        current_settings.audio_format = audio_format;
    }
    if let Some(audio_quality) = settings.audio_quality {
        current_settings.audio_quality = audio_quality;
    }

    write_json_file(path, &current_settings)?;

    debug!("Updated settings: {:?}", current_settings);

    Ok(current_settings)
}
