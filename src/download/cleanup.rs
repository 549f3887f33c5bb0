// Cleanup Agent
// Removes incomplete artifacts left by a cancelled or failed job. Only run
// after the job's worker has been joined.

use crate::error::{DownloadError, DownloadResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const PARTIAL_DOWNLOAD_SUFFIX: &str = ".part";
const PARTIAL_INDEX_SUFFIX: &str = ".ytdl";
const FRAGMENT_MARKER: &str = ".part-Frag";

/// Filesystem timestamps can be coarser than the job start time
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// Which incomplete artifacts belong to the job
#[derive(Debug, Clone, PartialEq)]
pub enum CleanupScope {
    /// Files whose name starts with the job's output prefix
    Prefix(String),
    /// Prefix unknown: any incomplete artifact, optionally only those
    /// modified after the job started
    Unscoped { since: Option<SystemTime> },
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    /// Failures become `CleanupPartialFailure`, which callers log and ignore
    pub fn into_result(self) -> DownloadResult<usize> {
        if self.failures.is_empty() {
            Ok(self.removed.len())
        } else {
            Err(DownloadError::CleanupPartialFailure {
                removed: self.removed.len(),
                failures: self.failures,
            })
        }
    }
}

/// partial-download, partial-index and fragment-partial files
pub fn is_incomplete_artifact(file_name: &str) -> bool {
    file_name.ends_with(PARTIAL_DOWNLOAD_SUFFIX)
        || file_name.ends_with(PARTIAL_INDEX_SUFFIX)
        || file_name.contains(FRAGMENT_MARKER)
}

pub fn strip_incomplete_suffix(file_name: &str) -> &str {
    if let Some(idx) = file_name.find(FRAGMENT_MARKER) {
        return &file_name[..idx];
    }
    file_name
        .strip_suffix(PARTIAL_DOWNLOAD_SUFFIX)
        .or_else(|| file_name.strip_suffix(PARTIAL_INDEX_SUFFIX))
        .unwrap_or(file_name)
}

/// Output prefix shared by every file a job writes, derived from one of its
/// filenames. Outputs are named `<title> [<id>].<ext>`, with intermediate
/// streams adding a `.f<format>` segment.
pub fn artifact_prefix(filename: &str) -> Option<String> {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())?;
    let base = strip_incomplete_suffix(&name);

    if let Some(idx) = base.rfind("].") {
        return Some(base[..=idx].to_string());
    }

    let mut stem = Path::new(base).file_stem()?.to_string_lossy().to_string();
    if let Some(idx) = stem.rfind(".f") {
        if stem[idx + 2..].chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            stem.truncate(idx);
        }
    }

    if stem.is_empty() {
        None
    } else {
        Some(stem)
    }
}

fn belongs_to_scope(path: &Path, file_name: &str, scope: &CleanupScope) -> bool {
    match scope {
        CleanupScope::Prefix(prefix) => file_name.starts_with(prefix.as_str()),
        CleanupScope::Unscoped { since: None } => true,
        CleanupScope::Unscoped { since: Some(since) } => {
            let cutoff = since.checked_sub(MTIME_SLACK).unwrap_or(*since);
            fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|modified| modified >= cutoff)
                .unwrap_or(false)
        }
    }
}

/// Deletes the job's incomplete artifacts in `dir`. Files starting with a
/// `protected` prefix (other live jobs) are never touched. Each deletion is
/// independent: a failure is recorded and the sweep continues.
pub fn cleanup_partial_artifacts(
    dir: &Path,
    scope: &CleanupScope,
    protected: &[String],
) -> CleanupReport {
    let mut report = CleanupReport::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Nothing to clean in {:?}: {}", dir, e);
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();

        if !is_incomplete_artifact(&file_name) {
            continue;
        }
        if protected.iter().any(|p| file_name.starts_with(p.as_str())) {
            continue;
        }
        if !belongs_to_scope(&path, &file_name, scope) {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Removed partial artifact: {:?}", path);
                report.removed.push(path);
            }
            Err(e) => {
                log::warn!("Failed to remove partial artifact {:?}: {}", path, e);
                report.failures.push((path, e.to_string()));
            }
        }
    }

    report
}
