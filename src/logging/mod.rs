//! Logging utilities for Mediagrab
//! Installs the file logger and handles 7-day log retention

use crate::utils::get_logs_dir;
use env_logger::{Builder, Env, Target};
use log::info;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const LOG_RETENTION_DAYS: u64 = 7;

fn log_file_path(logs_dir: &Path) -> PathBuf {
    let date = chrono::Local::now().format("%Y-%m-%d");
    logs_dir.join(format!("mediagrab-{}.log", date))
}

/// Sends log output to today's file in the logs directory. The filter comes
/// from `RUST_LOG` and defaults to `info`.
pub fn init_logging() -> Result<PathBuf, std::io::Error> {
    let logs_dir = get_logs_dir();
    fs::create_dir_all(&logs_dir)?;

    let path = log_file_path(&logs_dir);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Pipe(Box::new(file)))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::AlreadyExists, e))?;

    Ok(path)
}

pub fn cleanup_old_logs() {
    let logs_dir = get_logs_dir();
    if !logs_dir.exists() {
        return;
    }
    remove_logs_older_than(
        &logs_dir,
        Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60),
    );
}

fn remove_logs_older_than(logs_dir: &Path, retention: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;

    if let Ok(entries) = fs::read_dir(logs_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "log") {
                continue;
            }
            let age = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());

            if matches!(age, Some(age) if age > retention) && fs::remove_file(&path).is_ok() {
                info!("Cleaned up old log: {:?}", path.file_name());
                removed += 1;
            }
        }
    }

    removed
}
