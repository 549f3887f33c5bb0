// Download command handlers
// UI-facing operations. Handlers that drive a job take the controller that
// owns it; observers and out-of-process UIs only need the bridge and the
// control inbox on disk.
use crate::commands::settings::get_settings;
use crate::download::{BridgeReader, ControlInbox, DownloadController, ObservedStatus};
use crate::error::{DownloadError, DownloadResult};
use crate::models::{
    BridgeRecord, ControlSignal, DownloadJob, DownloadMode, QualitySelector, Reconciliation,
};
use crate::utils::{get_bridge_dir, get_control_dir};
use log::{debug, info};
use std::time::Duration;

/// List every job the controller is tracking, oldest first
pub fn list_downloads(controller: &DownloadController) -> Vec<DownloadJob> {
    controller.list_jobs()
}

/// Add a new download (does not start it). Quality and mode fall back to
/// the user's defaults.
pub fn add_download(
    controller: &DownloadController,
    url: String,
    quality: Option<String>,
    audio_only: Option<bool>,
) -> DownloadResult<serde_json::Value> {
    let settings = get_settings()?;

    let quality = match quality {
        Some(q) => q
            .parse::<QualitySelector>()
            .map_err(DownloadError::InvalidArgument)?,
        None => settings.default_quality,
    };
    let mode = match audio_only {
        Some(true) => DownloadMode::AudioOnly,
        Some(false) => DownloadMode::Video,
        None => settings.default_mode,
    };

    let job = controller.add_job(&url, mode, quality)?;
    Ok(serde_json::json!({ "job_id": job.id }))
}

/// Start a pending download. Returns once the worker is running.
pub fn start_download(controller: &DownloadController, job_id: String) -> DownloadResult<()> {
    controller.start(&job_id)
}

pub fn pause_download(controller: &DownloadController, job_id: String) -> DownloadResult<()> {
    controller.pause(&job_id)
}

pub fn resume_download(controller: &DownloadController, job_id: String) -> DownloadResult<()> {
    controller.resume(&job_id)
}

pub fn cancel_download(controller: &DownloadController, job_id: String) -> DownloadResult<()> {
    controller.cancel(&job_id)
}

/// Send a control signal to a job run by another process. The owning
/// controller picks it up on its next sync tick.
pub fn submit_control_signal(job_id: String, signal: String) -> DownloadResult<()> {
    let signal: ControlSignal = signal.parse().map_err(DownloadError::InvalidArgument)?;
    let reader = bridge_reader()?;
    let status = reader
        .observe(&job_id)
        .ok_or_else(|| DownloadError::JobNotFound(job_id.clone()))?;

    if status.record.state.is_terminal() {
        debug!("Not sending {:?} to finished download {}", signal, job_id);
        return Ok(());
    }

    ControlInbox::new(get_control_dir()).submit(&job_id, signal)?;
    info!("Queued {:?} for download {}", signal, job_id);
    Ok(())
}

/// Status as any observer sees it: the last bridge record plus a staleness
/// verdict. With no id, every known job is returned.
pub fn get_download_status(job_id: Option<String>) -> DownloadResult<Vec<ObservedStatus>> {
    let reader = bridge_reader()?;
    match job_id {
        Some(id) => reader
            .observe(&id)
            .map(|status| vec![status])
            .ok_or(DownloadError::JobNotFound(id)),
        None => Ok(reader.observe_all()),
    }
}

/// Forget a finished download and delete its record. Works for records
/// left behind by another process too, as long as they are terminal.
pub fn acknowledge_download(
    controller: &DownloadController,
    job_id: String,
) -> DownloadResult<BridgeRecord> {
    controller.acknowledge(&job_id)
}

/// Resolve a stale record after the user picked what happened to it
pub fn reconcile_download(
    controller: &DownloadController,
    job_id: String,
    mark_failed: bool,
) -> DownloadResult<BridgeRecord> {
    let choice = if mark_failed {
        Reconciliation::MarkFailed
    } else {
        Reconciliation::AssumeRunning
    };
    controller.reconcile(&job_id, choice)
}

fn bridge_reader() -> DownloadResult<BridgeReader> {
    let settings = get_settings()?;
    Ok(BridgeReader::new(
        get_bridge_dir(),
        Duration::from_millis(settings.sync_interval_ms),
        settings.stale_after_intervals,
    ))
}
