// Lifecycle Controller
// Owns every job's state machine. Each started job runs on two threads: a
// worker that drives the fetch adapter, and a supervisor that joins the
// worker before cleaning up and recording the terminal state.

use super::adapter::{AdapterConfig, FetchAdapter};
use super::bridge::StateSyncBridge;
use super::channel::ProgressChannel;
use super::cleanup::{
    artifact_prefix, cleanup_partial_artifacts, strip_incomplete_suffix, CleanupReport,
    CleanupScope,
};
use super::inbox::ControlInbox;
use super::signal::ControlCell;
use crate::error::{DownloadError, DownloadResult};
use crate::models::{
    BridgeRecord, ControlSignal, DownloadJob, DownloadMode, FailureKind, JobState,
    ProgressSnapshot, QualitySelector, Reconciliation, Settings,
};
use crate::process_manager::{FetchEngine, FetchOutcome, FetchRequest};
use crate::utils::{
    destination_dir_for, get_bridge_dir, get_control_dir, resolve_download_root,
    validate_source_url, wall_millis,
};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

const SYNC_SLEEP_STEP: Duration = Duration::from_millis(50);
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bridge_dir: PathBuf,
    pub control_dir: PathBuf,
    pub download_root: PathBuf,
    pub max_concurrent_downloads: usize,
    pub adapter: AdapterConfig,
    pub sync_interval: Duration,
    pub stale_after_intervals: u32,
}

impl ControllerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bridge_dir: get_bridge_dir(),
            control_dir: get_control_dir(),
            download_root: resolve_download_root(settings),
            max_concurrent_downloads: settings.max_concurrent_downloads.max(1) as usize,
            adapter: AdapterConfig {
                max_attempts: settings.max_fetch_attempts,
                retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
                checkpoint_interval: Duration::from_millis(settings.checkpoint_interval_ms),
            },
            sync_interval: Duration::from_millis(settings.sync_interval_ms.max(50)),
            stale_after_intervals: settings.stale_after_intervals.max(1),
        }
    }
}

struct JobSlot {
    job: Mutex<DownloadJob>,
    control: ControlCell,
    progress: ProgressChannel,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<Option<SystemTime>>,
    /// Stamped on each record under the job lock
    staged_seq: AtomicU64,
    /// Highest stamp written to the bridge
    written_seq: Mutex<u64>,
}

/// A record built under the job lock, written once the lock is released
struct StagedRecord {
    seq: u64,
    record: BridgeRecord,
}

impl JobSlot {
    fn new(job: DownloadJob) -> Self {
        Self {
            job: Mutex::new(job),
            control: ControlCell::new(),
            progress: ProgressChannel::new(),
            supervisor: Mutex::new(None),
            started: Mutex::new(None),
            staged_seq: AtomicU64::new(0),
            written_seq: Mutex::new(0),
        }
    }

    /// Output prefix from the job, or learned from the latest snapshot
    fn known_prefix(&self, job: &DownloadJob) -> Option<String> {
        job.filename_prefix.clone().or_else(|| {
            self.progress
                .get()
                .and_then(|s| artifact_prefix(&s.filename))
        })
    }
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
}

fn learn_prefix(job: &mut DownloadJob, snapshot: Option<&ProgressSnapshot>) {
    if job.filename_prefix.is_none() {
        if let Some(snapshot) = snapshot {
            job.filename_prefix = artifact_prefix(&snapshot.filename);
        }
    }
}

struct ControllerInner {
    config: ControllerConfig,
    adapter: FetchAdapter,
    bridge: StateSyncBridge,
    inbox: ControlInbox,
    jobs: RwLock<HashMap<String, Arc<JobSlot>>>,
    start_lock: Mutex<()>,
    sync_running: AtomicBool,
}

impl ControllerInner {
    fn slot(&self, job_id: &str) -> DownloadResult<Arc<JobSlot>> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| DownloadError::JobNotFound(job_id.to_string()))
    }

    fn slots(&self) -> Vec<Arc<JobSlot>> {
        self.jobs.read().values().cloned().collect()
    }

    fn active_count(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.job.lock().state.is_active())
            .count()
    }

    /// Builds the job's record under the job lock. Stamps follow lock
    /// order, so writes can happen later without reordering records.
    fn stage_locked(&self, slot: &JobSlot, job: &mut DownloadJob) -> StagedRecord {
        let snapshot = slot.progress.get();
        learn_prefix(job, snapshot.as_ref());
        StagedRecord {
            seq: slot.staged_seq.fetch_add(1, Ordering::SeqCst) + 1,
            record: BridgeRecord::from_job(job, snapshot),
        }
    }

    /// Writes a staged record unless a newer one already reached the bridge.
    /// Must not be called with the job lock held.
    fn write_staged(&self, slot: &JobSlot, staged: StagedRecord) {
        let mut written = slot.written_seq.lock();
        if staged.seq <= *written {
            return;
        }
        if let Err(e) = self.bridge.publish(&staged.record) {
            warn!("Failed to publish state for {}: {}", staged.record.job_id, e);
        }
        *written = staged.seq;
    }

    fn transition_locked<F>(
        &self,
        slot: &JobSlot,
        job: &mut DownloadJob,
        to: JobState,
        detail: F,
    ) -> Option<StagedRecord>
    where
        F: FnOnce(&mut DownloadJob),
    {
        let from = job.state;
        if from == to || !from.can_transition_to(to) {
            debug!("Ignoring transition {:?} -> {:?} for {}", from, to, job.id);
            return None;
        }

        job.state = to;
        detail(job);
        if to.is_terminal() {
            job.finished_at = Some(chrono::Utc::now().to_rfc3339());
        }

        match to {
            JobState::Failed => error!(
                "Download {} failed: {}",
                short_id(&job.id),
                job.error.as_deref().unwrap_or("unknown error")
            ),
            _ => info!("Download {}: {:?} -> {:?}", short_id(&job.id), from, to),
        }

        Some(self.stage_locked(slot, job))
    }

    fn transition<F>(&self, slot: &JobSlot, to: JobState, detail: F) -> bool
    where
        F: FnOnce(&mut DownloadJob),
    {
        let staged = {
            let mut job = slot.job.lock();
            self.transition_locked(slot, &mut job, to, detail)
        };
        match staged {
            Some(staged) => {
                self.write_staged(slot, staged);
                true
            }
            None => false,
        }
    }

    fn apply_signal(&self, job_id: &str, signal: ControlSignal) -> DownloadResult<()> {
        let slot = self.slot(job_id)?;
        let mut job = slot.job.lock();

        let staged = match (job.state, signal) {
            (JobState::Pending, ControlSignal::Cancel) => {
                self.transition_locked(&slot, &mut job, JobState::Cancelled, |_| {})
            }
            (state, _) if state.is_active() => {
                debug!("Signal {:?} for {} while {:?}", signal, short_id(job_id), state);
                slot.control.submit(signal);
                None
            }
            (state, _) => {
                debug!("Ignoring {:?} for {} in state {:?}", signal, short_id(job_id), state);
                None
            }
        };
        drop(job);

        if let Some(staged) = staged {
            self.write_staged(&slot, staged);
        }
        Ok(())
    }

    /// Output prefixes of other live jobs writing into `dir`. `None` marks
    /// a live job whose prefix is not known yet.
    fn sibling_prefixes(&self, job_id: &str, dir: &Path) -> Vec<Option<String>> {
        self.slots()
            .iter()
            .filter_map(|slot| {
                let job = slot.job.lock();
                if job.id == job_id || !job.state.is_active() || job.destination_dir != dir {
                    return None;
                }
                Some(slot.known_prefix(&job))
            })
            .collect()
    }

    fn cleanup_for(&self, slot: &JobSlot) -> CleanupReport {
        let (job_id, dir, prefix) = {
            let mut job = slot.job.lock();
            let snapshot = slot.progress.get();
            learn_prefix(&mut job, snapshot.as_ref());
            (job.id.clone(), job.destination_dir.clone(), job.filename_prefix.clone())
        };

        let siblings = self.sibling_prefixes(&job_id, &dir);
        let protected: Vec<String> = siblings.iter().flatten().cloned().collect();

        let scope = match prefix {
            Some(prefix) => CleanupScope::Prefix(prefix),
            None if siblings.iter().any(Option::is_none) => {
                warn!(
                    "Skipping unscoped cleanup for {}: another download in {:?} \
                     has no known output name yet",
                    short_id(&job_id),
                    dir
                );
                return CleanupReport::default();
            }
            None => CleanupScope::Unscoped {
                since: *slot.started.lock(),
            },
        };

        cleanup_partial_artifacts(&dir, &scope, &protected)
    }

    fn final_path(&self, slot: &JobSlot, outcome: FetchOutcome) -> Option<String> {
        let path = outcome.file_path.or_else(|| {
            let snapshot = slot.progress.get()?;
            let dir = slot.job.lock().destination_dir.clone();
            Some(dir.join(strip_incomplete_suffix(&snapshot.filename)))
        })?;
        Some(path.to_string_lossy().to_string())
    }

    /// Runs after the worker has been joined. The job always leaves here in
    /// a terminal state.
    fn finish(&self, slot: &JobSlot, result: DownloadResult<FetchOutcome>) {
        let err = match result {
            Ok(outcome) => {
                let file_path = self.final_path(slot, outcome);
                let completed = self.transition(slot, JobState::Completed, |job| {
                    job.file_path = file_path;
                });
                let state = slot.job.lock().state;
                if completed || !state.is_active() {
                    return;
                }
                warn!(
                    "Worker for {} returned success while {:?}",
                    short_id(&slot_job_id(slot)),
                    state
                );
                match slot.control.take() {
                    Some(ControlSignal::Cancel) => DownloadError::Cancelled,
                    _ => DownloadError::Engine(format!("download worker exited while {:?}", state)),
                }
            }
            Err(err) => err,
        };

        let report = self.cleanup_for(slot);
        let job_id = slot_job_id(slot);
        match report.into_result() {
            Ok(0) => {}
            Ok(removed) => info!(
                "Removed {} partial file(s) for {}",
                removed,
                short_id(&job_id)
            ),
            Err(e) => warn!("{} ({})", e, short_id(&job_id)),
        }

        if err.is_cancellation() {
            self.transition(slot, JobState::Cancelled, |_| {});
        } else {
            let kind = err.failure_kind().unwrap_or(FailureKind::Engine);
            let reason = err.to_string();
            self.transition(slot, JobState::Failed, |job| {
                job.error = Some(reason);
                job.failure_kind = Some(kind);
            });
        }
    }

    fn supervise(self: &Arc<Self>, slot: Arc<JobSlot>, request: FetchRequest) {
        let job_id = slot_job_id(&slot);
        let worker_inner = self.clone();
        let worker_slot = slot.clone();

        let spawned = thread::Builder::new()
            .name(format!("download-worker-{}", short_id(&job_id)))
            .spawn(move || {
                let observer = |state: JobState| {
                    worker_inner.transition(&worker_slot, state, |_| {});
                };
                worker_inner.adapter.run(
                    &request,
                    &worker_slot.control,
                    &worker_slot.progress,
                    &observer,
                )
            });

        let result = match spawned {
            Ok(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(DownloadError::Engine("download worker panicked".to_string())),
            },
            Err(e) => Err(DownloadError::Io(e)),
        };

        debug!("Worker for {} exited", short_id(&job_id));
        self.finish(&slot, result);
    }

    fn sync_tick(&self) {
        let requests = self.inbox.drain(|job_id| self.jobs.read().contains_key(job_id));
        for request in requests {
            if let Err(e) = self.apply_signal(&request.job_id, request.signal) {
                warn!("Dropping control request for {}: {}", request.job_id, e);
            }
        }

        for slot in self.slots() {
            let staged = {
                let mut job = slot.job.lock();
                job.state
                    .is_active()
                    .then(|| self.stage_locked(&slot, &mut job))
            };
            if let Some(staged) = staged {
                self.write_staged(&slot, staged);
            }
        }
    }

    fn run_sync_loop(&self) {
        debug!("State sync loop started ({:?})", self.config.sync_interval);
        while self.sync_running.load(Ordering::SeqCst) {
            self.sync_tick();

            let deadline = Instant::now() + self.config.sync_interval;
            while self.sync_running.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep((deadline - now).min(SYNC_SLEEP_STEP));
            }
        }
        debug!("State sync loop stopped");
    }
}

fn slot_job_id(slot: &JobSlot) -> String {
    slot.job.lock().id.clone()
}

/// Drives downloads through pending → running ⇄ paused → terminal. Control
/// operations never block on the download; progress is read by polling.
pub struct DownloadController {
    inner: Arc<ControllerInner>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadController {
    pub fn new(config: ControllerConfig, engine: Arc<dyn FetchEngine>) -> DownloadResult<Self> {
        fs::create_dir_all(&config.bridge_dir)?;
        fs::create_dir_all(&config.control_dir)?;

        let inner = Arc::new(ControllerInner {
            adapter: FetchAdapter::new(engine, config.adapter.clone()),
            bridge: StateSyncBridge::new(&config.bridge_dir),
            inbox: ControlInbox::new(&config.control_dir),
            jobs: RwLock::new(HashMap::new()),
            start_lock: Mutex::new(()),
            sync_running: AtomicBool::new(true),
            config,
        });

        let sync_inner = inner.clone();
        let sync_thread = thread::Builder::new()
            .name("bridge-sync".to_string())
            .spawn(move || sync_inner.run_sync_loop())?;

        Ok(Self {
            inner,
            sync_thread: Mutex::new(Some(sync_thread)),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn bridge(&self) -> &StateSyncBridge {
        &self.inner.bridge
    }

    /// Registers a Pending job for a validated source URL
    pub fn add_job(
        &self,
        source_url: &str,
        mode: DownloadMode,
        quality: QualitySelector,
    ) -> DownloadResult<DownloadJob> {
        let url = validate_source_url(source_url)?;
        let destination_dir = destination_dir_for(&self.inner.config.download_root, mode);
        fs::create_dir_all(&destination_dir)?;

        let job = DownloadJob::new(url.to_string(), mode, quality, destination_dir);
        let slot = Arc::new(JobSlot::new(job.clone()));
        let staged = self.inner.stage_locked(&slot, &mut slot.job.lock());
        self.inner.write_staged(&slot, staged);
        self.inner.jobs.write().insert(job.id.clone(), slot);

        info!(
            "Added download {} ({:?}, {}) for {}",
            short_id(&job.id),
            mode,
            quality,
            job.source_url
        );
        Ok(job)
    }

    /// Pending → Running. Returns as soon as the worker is spawned.
    pub fn start(&self, job_id: &str) -> DownloadResult<()> {
        let _start = self.inner.start_lock.lock();
        let slot = self.inner.slot(job_id)?;
        let active = self.inner.active_count();

        let (request, staged) = {
            let mut job = slot.job.lock();
            if job.state != JobState::Pending {
                return Err(DownloadError::InvalidState {
                    job_id: job_id.to_string(),
                    state: job.state,
                    operation: "start",
                });
            }
            let max = self.inner.config.max_concurrent_downloads;
            if active >= max {
                return Err(DownloadError::ConcurrencyLimit { active, max });
            }

            slot.progress.reset();
            slot.control.clear();
            *slot.started.lock() = Some(SystemTime::now());
            let staged = self
                .inner
                .transition_locked(&slot, &mut job, JobState::Running, |job| {
                    job.started_at = Some(chrono::Utc::now().to_rfc3339());
                });

            let request = FetchRequest {
                source_url: job.source_url.clone(),
                quality: job.quality,
                mode: job.mode,
                destination_dir: job.destination_dir.clone(),
            };
            (request, staged)
        };
        if let Some(staged) = staged {
            self.inner.write_staged(&slot, staged);
        }

        let inner = self.inner.clone();
        let supervised = slot.clone();
        let spawned = thread::Builder::new()
            .name(format!("download-{}", short_id(job_id)))
            .spawn(move || inner.supervise(supervised, request));

        match spawned {
            Ok(handle) => {
                *slot.supervisor.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                let reason = format!("Failed to spawn download thread: {}", e);
                self.inner.transition(&slot, JobState::Failed, |job| {
                    job.error = Some(reason);
                    job.failure_kind = Some(FailureKind::Engine);
                });
                Err(DownloadError::Io(e))
            }
        }
    }

    pub fn pause(&self, job_id: &str) -> DownloadResult<()> {
        self.inner.apply_signal(job_id, ControlSignal::Pause)
    }

    pub fn resume(&self, job_id: &str) -> DownloadResult<()> {
        self.inner.apply_signal(job_id, ControlSignal::Resume)
    }

    pub fn cancel(&self, job_id: &str) -> DownloadResult<()> {
        self.inner.apply_signal(job_id, ControlSignal::Cancel)
    }

    /// Fire-and-forget control submission; no-op on terminal jobs
    pub fn submit_signal(&self, job_id: &str, signal: ControlSignal) -> DownloadResult<()> {
        self.inner.apply_signal(job_id, signal)
    }

    pub fn job(&self, job_id: &str) -> Option<DownloadJob> {
        self.inner.slot(job_id).ok().map(|slot| slot.job.lock().clone())
    }

    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.inner.slot(job_id).ok().and_then(|slot| slot.progress.get())
    }

    pub fn list_jobs(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self
            .inner
            .slots()
            .iter()
            .map(|slot| slot.job.lock().clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Polls until the job reaches a terminal state or `timeout` elapses
    pub fn wait_until_finished(&self, job_id: &str, timeout: Duration) -> Option<DownloadJob> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.job(job_id)?;
            if job.state.is_terminal() || Instant::now() >= deadline {
                return Some(job);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Stops tracking a terminal job and deletes its bridge record. A job
    /// this controller does not own is acknowledged from its record alone.
    pub fn acknowledge(&self, job_id: &str) -> DownloadResult<BridgeRecord> {
        let slot = match self.inner.slot(job_id) {
            Ok(slot) => slot,
            Err(_) => return self.acknowledge_record(job_id),
        };

        let record = {
            let job = slot.job.lock();
            if !job.state.is_terminal() {
                return Err(DownloadError::InvalidState {
                    job_id: job_id.to_string(),
                    state: job.state,
                    operation: "acknowledge",
                });
            }
            BridgeRecord::from_job(&job, slot.progress.get())
        };

        let handle = slot.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.jobs.write().remove(job_id);
        // No record may be written after this one is removed
        *slot.written_seq.lock() = u64::MAX;
        self.inner.bridge.remove(job_id)?;
        debug!("Acknowledged download {}", short_id(job_id));
        Ok(record)
    }

    fn acknowledge_record(&self, job_id: &str) -> DownloadResult<BridgeRecord> {
        let record = self
            .inner
            .bridge
            .read(job_id)
            .ok_or_else(|| DownloadError::JobNotFound(job_id.to_string()))?;
        if !record.state.is_terminal() {
            return Err(DownloadError::InvalidState {
                job_id: job_id.to_string(),
                state: record.state,
                operation: "acknowledge",
            });
        }
        self.inner.bridge.remove(job_id)?;
        debug!("Acknowledged finished record {}", short_id(job_id));
        Ok(record)
    }

    /// Resolves a record the user flagged as stale. Only records without a
    /// live worker in this controller can be changed.
    pub fn reconcile(&self, job_id: &str, choice: Reconciliation) -> DownloadResult<BridgeRecord> {
        if let Ok(slot) = self.inner.slot(job_id) {
            let job = slot.job.lock();
            if job.state.is_active() {
                return Err(DownloadError::InvalidState {
                    job_id: job_id.to_string(),
                    state: job.state,
                    operation: "reconcile",
                });
            }
            return Ok(BridgeRecord::from_job(&job, slot.progress.get()));
        }

        let mut record = self
            .inner
            .bridge
            .read(job_id)
            .ok_or_else(|| DownloadError::JobNotFound(job_id.to_string()))?;

        if choice == Reconciliation::AssumeRunning || record.state.is_terminal() {
            return Ok(record);
        }

        let prefix = record.filename_prefix.clone().or_else(|| {
            record
                .snapshot
                .as_ref()
                .and_then(|s| artifact_prefix(&s.filename))
        });
        match prefix {
            Some(prefix) => {
                let protected: Vec<String> = self
                    .inner
                    .sibling_prefixes(job_id, &record.destination_dir)
                    .into_iter()
                    .flatten()
                    .collect();
                let report = cleanup_partial_artifacts(
                    &record.destination_dir,
                    &CleanupScope::Prefix(prefix),
                    &protected,
                );
                if let Err(e) = report.into_result() {
                    warn!("{} ({})", e, short_id(job_id));
                }
            }
            None => debug!("No output recorded for {}; nothing to clean", short_id(job_id)),
        }

        record.state = JobState::Failed;
        record.error = Some("Download stopped responding and was marked failed".to_string());
        record.failure_kind = Some(FailureKind::WorkerLost);
        record.updated_at = wall_millis();
        self.inner.bridge.publish(&record)?;
        info!("Reconciled stale download {} as failed", short_id(job_id));
        Ok(record)
    }

    /// Cancels active jobs, waits for their supervisors to finish cleanup
    /// and stops the sync loop. Safe to call more than once.
    pub fn shutdown(&self) {
        for slot in self.inner.slots() {
            let job_id = slot_job_id(&slot);
            if let Err(e) = self.inner.apply_signal(&job_id, ControlSignal::Cancel) {
                debug!("Shutdown cancel for {}: {}", short_id(&job_id), e);
            }
        }

        for slot in self.inner.slots() {
            let handle = slot.supervisor.lock().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }

        self.inner.sync_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sync_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DownloadController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
