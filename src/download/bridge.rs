// State Sync Bridge
// One JSON record per job, replaced atomically by the controller and read by
// any observer that holds no reference to the controller.

use crate::error::{DownloadError, DownloadResult};
use crate::file_manager::{read_json_file_opt, remove_json_file, write_json_file};
use crate::models::BridgeRecord;
use crate::utils::wall_millis;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Record file name for a job id. Ids are uuids; anything else is made
/// path-safe so a record can never land outside the bridge directory.
fn record_file_name(job_id: &str) -> String {
    let safe: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.json", safe)
}

#[derive(Debug, Clone)]
pub struct StateSyncBridge {
    dir: PathBuf,
}

impl StateSyncBridge {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(record_file_name(job_id))
    }

    /// Atomic replace of the job's record
    pub fn publish(&self, record: &BridgeRecord) -> DownloadResult<()> {
        write_json_file(&self.record_path(&record.job_id), record)
    }

    /// `None` when the record is absent or mid-replace
    pub fn read(&self, job_id: &str) -> Option<BridgeRecord> {
        read_json_file_opt(&self.record_path(job_id))
    }

    pub fn read_all(&self) -> Vec<BridgeRecord> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut records: Vec<BridgeRecord> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .filter_map(|p| read_json_file_opt(&p))
            .collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        records
    }

    pub fn remove(&self, job_id: &str) -> DownloadResult<()> {
        remove_json_file(&self.record_path(job_id))
    }
}

/// Fails with `StaleStateDetected` when a record that should be refreshed
/// periodically (Running or Paused) has not been updated within `max_age`
pub fn check_freshness(
    record: &BridgeRecord,
    now_ms: i64,
    max_age: Duration,
) -> DownloadResult<()> {
    if !record.state.is_active() {
        return Ok(());
    }
    let age_ms = now_ms.saturating_sub(record.updated_at);
    if age_ms > max_age.as_millis() as i64 {
        return Err(DownloadError::StaleStateDetected {
            job_id: record.job_id.clone(),
            age_ms,
        });
    }
    Ok(())
}

/// What an observer renders for one job
#[derive(Debug, Clone, Serialize)]
pub struct ObservedStatus {
    pub record: BridgeRecord,
    pub age_ms: i64,
    /// The worker may be dead; offer the user a reconcile choice
    pub stale: bool,
}

/// Read-only observer side of the bridge
#[derive(Debug, Clone)]
pub struct BridgeReader {
    bridge: StateSyncBridge,
    stale_after: Duration,
}

impl BridgeReader {
    pub fn new(
        dir: impl Into<PathBuf>,
        sync_interval: Duration,
        stale_after_intervals: u32,
    ) -> Self {
        Self {
            bridge: StateSyncBridge::new(dir),
            stale_after: sync_interval * stale_after_intervals.max(1),
        }
    }

    pub fn observe(&self, job_id: &str) -> Option<ObservedStatus> {
        self.bridge.read(job_id).map(|record| self.assess(record))
    }

    pub fn observe_all(&self) -> Vec<ObservedStatus> {
        self.bridge
            .read_all()
            .into_iter()
            .map(|record| self.assess(record))
            .collect()
    }

    fn assess(&self, record: BridgeRecord) -> ObservedStatus {
        let now = wall_millis();
        let age_ms = now.saturating_sub(record.updated_at);
        let stale = match check_freshness(&record, now, self.stale_after) {
            Ok(()) => false,
            Err(e) => {
                log::warn!("{}", e);
                true
            }
        };
        ObservedStatus {
            record,
            age_ms,
            stale,
        }
    }
}
