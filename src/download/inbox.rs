// Control inbox: control signals submitted from another process
use crate::error::DownloadResult;
use crate::file_manager::{read_json_file_opt, remove_json_file, write_json_file};
use crate::models::{ControlRequest, ControlSignal};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ControlInbox {
    dir: PathBuf,
}

impl ControlInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn request_path(&self, job_id: &str) -> PathBuf {
        let safe: String = job_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Fire-and-forget. A request not yet picked up is overwritten, so the
    /// latest signal wins.
    pub fn submit(&self, job_id: &str, signal: ControlSignal) -> DownloadResult<()> {
        let request = ControlRequest::new(job_id.to_string(), signal);
        write_json_file(&self.request_path(job_id), &request)
    }

    /// Takes every pending request whose job id passes `owns`. Requests for
    /// jobs run by other processes are left in place.
    pub fn drain<F>(&self, owns: F) -> Vec<ControlRequest>
    where
        F: Fn(&str) -> bool,
    {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut requests = Vec::new();
        for path in entries.flatten().map(|e| e.path()) {
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let job_id = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().to_string(),
                None => continue,
            };
            if !owns(&job_id) {
                continue;
            }
            if let Some(request) = self.take(&path) {
                requests.push(request);
            }
        }
        requests
    }

    /// Moves the request aside before reading it, so a submit racing with
    /// the drain lands in a fresh file for the next pass
    fn take(&self, path: &Path) -> Option<ControlRequest> {
        let taken = path.with_extension("taken");
        if let Err(e) = fs::rename(path, &taken) {
            log::debug!("Control request {:?} vanished: {}", path, e);
            return None;
        }
        let request = read_json_file_opt::<ControlRequest>(&taken);
        if let Err(e) = remove_json_file(&taken) {
            log::warn!("Failed to remove control request {:?}: {}", taken, e);
        }
        request
    }
}
