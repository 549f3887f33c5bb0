use crate::models::{DownloadMode, Settings};
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

static APP_DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

pub const HOME_ENV_VAR: &str = "MEDIAGRAB_HOME";

pub fn get_app_data_dir() -> PathBuf {
    APP_DATA_DIR
        .get_or_init(|| {
            if let Some(home) = std::env::var_os(HOME_ENV_VAR) {
                return PathBuf::from(home);
            }
            let base_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
            base_dir.join("Mediagrab")
        })
        .clone()
}

pub fn get_data_dir() -> PathBuf {
    get_app_data_dir().join("data")
}

/// Directory holding one State Sync Bridge record per job
pub fn get_bridge_dir() -> PathBuf {
    get_data_dir().join("bridge")
}

/// Directory where out-of-process UIs drop control requests
pub fn get_control_dir() -> PathBuf {
    get_data_dir().join("control")
}

pub fn get_logs_dir() -> PathBuf {
    get_app_data_dir().join("logs")
}

pub fn get_settings_json_path() -> PathBuf {
    get_data_dir().join("settings.json")
}

/// Resolve special folder names to actual paths
fn resolve_special_folder(name: &str) -> Option<PathBuf> {
    match name.to_lowercase().as_str() {
        "downloads" | "download" => dirs::download_dir(),
        "desktop" => dirs::desktop_dir(),
        "documents" | "document" => dirs::document_dir(),
        "videos" | "video" => dirs::video_dir(),
        "music" => dirs::audio_dir(),
        _ => None,
    }
}

fn fallback_download_root() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| get_app_data_dir().join("downloads"))
}

/// Root of all downloads: a special folder name, an absolute path, or a path
/// relative to the user's Downloads folder
pub fn resolve_download_root(settings: &Settings) -> PathBuf {
    let download_path = settings.download_path.trim();

    if download_path.is_empty() {
        return fallback_download_root();
    }

    if let Some(special_path) = resolve_special_folder(download_path) {
        return special_path;
    }

    let path = PathBuf::from(download_path);
    if path.is_absolute() {
        return path;
    }

    fallback_download_root().join(download_path)
}

/// Each mode downloads into its own subdirectory of the root
pub fn destination_dir_for(root: &std::path::Path, mode: DownloadMode) -> PathBuf {
    match mode {
        DownloadMode::Video => root.join("videos"),
        DownloadMode::AudioOnly => root.join("audio"),
    }
}

pub fn initialize_data_directories() -> Result<(), std::io::Error> {
    let directories = [
        get_data_dir(),
        get_bridge_dir(),
        get_control_dir(),
        get_logs_dir(),
    ];

    for dir in &directories {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            log::debug!("Created directory: {:?}", dir);
        }
    }

    Ok(())
}
