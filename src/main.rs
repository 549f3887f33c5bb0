// Mediagrab command-line front end
use mediagrab_lib::commands::downloads::{
    acknowledge_download, add_download, cancel_download, get_download_status,
    reconcile_download, start_download, submit_control_signal,
};
use mediagrab_lib::commands::settings::{get_settings, update_settings, UpdateSettingsParams};
use mediagrab_lib::download::{DownloadController, ObservedStatus};
use mediagrab_lib::error::{DownloadError, DownloadResult};
use mediagrab_lib::models::JobState;
use mediagrab_lib::{build_controller, initialize_app_data, logging};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "\
Usage:
  mediagrab get <url> [--audio] [--quality max|1080p|720p|480p]
  mediagrab status [id]
  mediagrab pause|resume|cancel <id>
  mediagrab ack <id>
  mediagrab reconcile <id> --mark-failed|--assume-running
  mediagrab settings [--download-path <path>] [--quality <q>]
                     [--max-concurrent <n>] [--ytdlp-path <path>]";

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn describe(status: &ObservedStatus) -> String {
    let record = &status.record;
    let mut line = format!("{}  {:?}", record.job_id, record.state);

    if let Some(snapshot) = &record.snapshot {
        match snapshot.percent() {
            Some(pct) => line.push_str(&format!("  {}%", pct)),
            None => line.push_str(&format!("  {}", format_bytes(snapshot.bytes_downloaded))),
        }
        if record.state == JobState::Running && snapshot.speed_bytes_per_sec > 0.0 {
            line.push_str(&format!(
                "  {}/s",
                format_bytes(snapshot.speed_bytes_per_sec as u64)
            ));
        }
        if let Some(eta) = snapshot.eta_seconds {
            if record.state == JobState::Running {
                line.push_str(&format!("  eta {}s", eta));
            }
        }
    }
    if let Some(path) = &record.file_path {
        line.push_str(&format!("  -> {}", path));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!("  ({})", error));
    }
    if status.stale {
        line.push_str(&format!(
            "  [no update for {} ms - run `mediagrab reconcile {} --mark-failed` if it is gone]",
            status.age_ms, record.job_id
        ));
    }
    line
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn required_id(args: &[String]) -> DownloadResult<String> {
    args.first()
        .cloned()
        .ok_or_else(|| DownloadError::InvalidArgument("missing download id".to_string()))
}

async fn wait_for_exit(
    controller: Arc<DownloadController>,
    job_id: String,
) -> DownloadResult<JobState> {
    tokio::task::spawn_blocking(move || {
        controller
            .wait_until_finished(&job_id, Duration::from_secs(60))
            .map(|job| job.state)
            .ok_or(DownloadError::JobNotFound(job_id))
    })
    .await
    .map_err(|e| DownloadError::Engine(e.to_string()))?
}

/// Foreground download: renders the bridge record until the job ends.
/// Ctrl-C cancels and waits for cleanup.
async fn run_get(args: &[String]) -> DownloadResult<bool> {
    let url = args
        .first()
        .cloned()
        .ok_or_else(|| DownloadError::InvalidArgument("missing url".to_string()))?;
    let audio_only = args.iter().any(|a| a == "--audio").then_some(true);
    let quality = flag_value(args, "--quality");

    let controller = Arc::new(build_controller()?);
    let created = add_download(&controller, url, quality, audio_only)?;
    let job_id = created["job_id"].as_str().unwrap_or_default().to_string();
    start_download(&controller, job_id.clone())?;
    println!("Started {}", job_id);

    let mut ticker = tokio::time::interval(controller.config().sync_interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let final_state = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nCancelling...");
                cancel_download(&controller, job_id.clone())?;
                break wait_for_exit(controller.clone(), job_id.clone()).await?;
            }
            _ = ticker.tick() => {
                let status = get_download_status(Some(job_id.clone()))?;
                if let Some(status) = status.first() {
                    println!("{}", describe(status));
                    if status.record.state.is_terminal() {
                        break status.record.state;
                    }
                }
            }
        }
    };

    if let Ok(statuses) = get_download_status(Some(job_id.clone())) {
        if let Some(status) = statuses.first() {
            println!("{}", describe(status));
        }
    }
    if let Err(e) = acknowledge_download(&controller, job_id) {
        log::warn!("Could not acknowledge finished download: {}", e);
    }
    controller.shutdown();
    Ok(final_state == JobState::Completed)
}

fn run_settings(args: &[String]) -> DownloadResult<()> {
    let params = UpdateSettingsParams {
        download_path: flag_value(args, "--download-path"),
        default_quality: flag_value(args, "--quality"),
        max_concurrent_downloads: flag_value(args, "--max-concurrent")
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|e| DownloadError::InvalidArgument(format!("--max-concurrent: {}", e)))
            })
            .transpose()?,
        ytdlp_path: flag_value(args, "--ytdlp-path"),
        ..Default::default()
    };

    let has_updates = params.download_path.is_some()
        || params.default_quality.is_some()
        || params.max_concurrent_downloads.is_some()
        || params.ytdlp_path.is_some();

    let settings = if has_updates {
        update_settings(params)?
    } else {
        get_settings()?
    };
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

async fn run(args: Vec<String>) -> DownloadResult<bool> {
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => {
            println!("{}", USAGE);
            return Ok(false);
        }
    };

    match command {
        "get" => return run_get(rest).await,
        "status" => {
            let statuses = get_download_status(rest.first().cloned())?;
            if statuses.is_empty() {
                println!("No downloads");
            }
            for status in &statuses {
                println!("{}", describe(status));
            }
        }
        "pause" | "resume" | "cancel" => {
            submit_control_signal(required_id(rest)?, command.to_string())?;
            println!("Sent {} request", command);
        }
        "ack" => {
            let controller = build_controller()?;
            let record = acknowledge_download(&controller, required_id(rest)?)?;
            println!("Removed {} ({:?})", record.job_id, record.state);
        }
        "reconcile" => {
            let job_id = required_id(rest)?;
            let mark_failed = if rest.iter().any(|a| a == "--mark-failed") {
                true
            } else if rest.iter().any(|a| a == "--assume-running") {
                false
            } else {
                return Err(DownloadError::InvalidArgument(
                    "choose --mark-failed or --assume-running".to_string(),
                ));
            };
            let controller = build_controller()?;
            let record = reconcile_download(&controller, job_id, mark_failed)?;
            println!("{} is now {:?}", record.job_id, record.state);
        }
        "settings" => run_settings(rest)?,
        _ => {
            println!("{}", USAGE);
            return Ok(false);
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = initialize_app_data() {
        eprintln!("Failed to initialize app data: {}", e);
    }
    if let Err(e) = logging::init_logging() {
        eprintln!("Failed to open log file: {}", e);
    }
    logging::cleanup_old_logs();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
