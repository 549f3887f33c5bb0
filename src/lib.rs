pub mod commands;
pub mod download;
pub mod error;
pub mod file_manager;
pub mod logging;
pub mod models;
pub mod process_manager;
pub mod utils;

use commands::settings::get_settings;
use download::{ControllerConfig, DownloadController};
use error::DownloadResult;
use file_manager::initialize_json_file;
use models::Settings;
use process_manager::YtDlpEngine;
use std::sync::Arc;
use utils::{get_settings_json_path, initialize_data_directories};

pub use error::DownloadError;

/// Creates the data directories and default settings file
pub fn initialize_app_data() -> DownloadResult<()> {
    initialize_data_directories()?;
    initialize_json_file(&get_settings_json_path(), &Settings::default())?;

    log::debug!("App data initialized");
    Ok(())
}

/// Controller backed by the yt-dlp engine, configured from saved settings
pub fn build_controller() -> DownloadResult<DownloadController> {
    let settings = get_settings()?;
    let engine = Arc::new(YtDlpEngine::from_settings(&settings));
    DownloadController::new(ControllerConfig::from_settings(&settings), engine)
}
