use mediagrab_lib::download::{
    AdapterConfig, BridgeReader, ControlInbox, ControllerConfig, DownloadController,
    MAX_CHECKPOINT_INTERVAL,
};
use mediagrab_lib::error::DownloadError;
use mediagrab_lib::models::{
    BridgeRecord, ControlSignal, DownloadMode, FailureKind, JobState, QualitySelector,
    Reconciliation,
};
use mediagrab_lib::process_manager::{
    EngineError, EngineProgress, EngineSession, FetchEngine, FetchOutcome, FetchRequest,
};
use mediagrab_lib::utils::wall_millis;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CHUNK: u64 = 1000;
const FINISH_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_ALLOWANCE: Duration = Duration::from_millis(300);

#[derive(Clone, Copy, PartialEq)]
enum Script {
    Succeed,
    Unavailable,
    Transient,
}

/// Writes `Clip [<v>].mp4.part` one chunk per progress callback, then
/// renames it into place. The video id comes from the url's `v` parameter.
struct ScriptedEngine {
    script: Script,
    chunks: u64,
    delay: Duration,
    /// After an interrupt, keep writing for a while before returning
    slow_unwind: bool,
    calls: AtomicU32,
}

impl ScriptedEngine {
    fn new(script: Script, chunks: u64, delay_ms: u64) -> Self {
        Self {
            script,
            chunks,
            delay: Duration::from_millis(delay_ms),
            slow_unwind: false,
            calls: AtomicU32::new(0),
        }
    }
}

fn io_err(e: std::io::Error) -> EngineError {
    EngineError::Fatal(e.to_string())
}

fn video_id(url: &str) -> String {
    url.split("v=").nth(1).unwrap_or("unknown").to_string()
}

impl FetchEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        session: &mut dyn EngineSession,
    ) -> Result<FetchOutcome, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let base = format!("Clip [{}].mp4", video_id(&request.source_url));
        let part = request.destination_dir.join(format!("{}.part", base));
        fs::write(&part, b"").map_err(io_err)?;

        match self.script {
            Script::Unavailable => {
                return Err(EngineError::Unavailable("Private video".to_string()))
            }
            Script::Transient => {
                return Err(EngineError::Transient("Connection reset by peer".to_string()))
            }
            Script::Succeed => {}
        }

        for i in 1..=self.chunks {
            thread::sleep(self.delay);
            let mut file = OpenOptions::new().append(true).open(&part).map_err(io_err)?;
            file.write_all(&[0u8; CHUNK as usize]).map_err(io_err)?;

            let reported = session.on_progress(EngineProgress {
                bytes_downloaded: i * CHUNK,
                bytes_total: Some(self.chunks * CHUNK),
                speed_bytes_per_sec: Some(CHUNK as f64),
                eta_seconds: Some(self.chunks - i),
                filename: part.to_string_lossy().to_string(),
            });

            if let Err(interrupted) = reported {
                if self.slow_unwind {
                    thread::sleep(Duration::from_millis(150));
                    let frag = request
                        .destination_dir
                        .join(format!("{}.part-Frag{}", base, i));
                    fs::write(frag, b"late").map_err(io_err)?;
                }
                return Err(interrupted.into());
            }
        }

        let done = request.destination_dir.join(&base);
        fs::rename(&part, &done).map_err(io_err)?;
        Ok(FetchOutcome {
            file_path: Some(done),
        })
    }
}

fn config(root: &Path) -> ControllerConfig {
    ControllerConfig {
        bridge_dir: root.join("bridge"),
        control_dir: root.join("control"),
        download_root: root.join("media"),
        max_concurrent_downloads: 4,
        adapter: AdapterConfig {
            max_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            checkpoint_interval: Duration::from_millis(20),
        },
        sync_interval: Duration::from_millis(50),
        stale_after_intervals: 3,
    }
}

fn url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

fn partial_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    let name = p.file_name().unwrap().to_string_lossy().to_string();
                    name.ends_with(".part")
                        || name.ends_with(".ytdl")
                        || name.contains(".part-Frag")
                })
                .collect()
        })
        .unwrap_or_default()
}

fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn bytes_of(controller: &DownloadController, job_id: &str) -> u64 {
    controller
        .snapshot(job_id)
        .map(|s| s.bytes_downloaded)
        .unwrap_or(0)
}

#[test]
fn test_completed_download_reports_monotonic_progress() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 20, 5));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("mono1"), DownloadMode::Video, QualitySelector::P720)
        .unwrap();

    controller.start(&job.id).unwrap();

    let mut samples = Vec::new();
    while !controller.job(&job.id).unwrap().state.is_terminal() {
        samples.push(bytes_of(&controller, &job.id));
        thread::sleep(Duration::from_millis(2));
    }
    samples.push(bytes_of(&controller, &job.id));

    assert!(samples.windows(2).all(|w| w[0] <= w[1]), "{:?}", samples);

    let finished = controller.job(&job.id).unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(bytes_of(&controller, &job.id), 20 * CHUNK);

    let file_path = PathBuf::from(finished.file_path.unwrap());
    assert!(file_path.exists());
    assert!(partial_files(&job.destination_dir).is_empty());

    let record = controller.bridge().read(&job.id).unwrap();
    assert_eq!(record.state, JobState::Completed);
}

#[test]
fn test_start_requires_pending_state() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 50, 10));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("twice"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();

    controller.start(&job.id).unwrap();
    match controller.start(&job.id) {
        Err(DownloadError::InvalidState { state, operation, .. }) => {
            assert_eq!(operation, "start");
            assert!(state.is_active());
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }
    controller.cancel(&job.id).unwrap();
}

#[test]
fn test_pause_then_cancel_resolves_to_cancelled() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 200, 10));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("pc1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();

    controller.start(&job.id).unwrap();
    assert!(wait_for(|| bytes_of(&controller, &job.id) > 0, FINISH_TIMEOUT));

    controller.pause(&job.id).unwrap();
    controller.cancel(&job.id).unwrap();

    let finished = controller
        .wait_until_finished(&job.id, FINISH_TIMEOUT)
        .unwrap();
    assert_eq!(finished.state, JobState::Cancelled);
    assert!(finished.error.is_none());
    assert!(partial_files(&job.destination_dir).is_empty());
}

#[test]
fn test_pause_holds_bytes_and_resume_continues() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 40, 10));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("pr1"), DownloadMode::AudioOnly, QualitySelector::Max)
        .unwrap();

    controller.start(&job.id).unwrap();
    assert!(wait_for(|| bytes_of(&controller, &job.id) >= 3 * CHUNK, FINISH_TIMEOUT));

    controller.pause(&job.id).unwrap();
    assert!(wait_for(
        || controller.job(&job.id).unwrap().state == JobState::Paused,
        MAX_CHECKPOINT_INTERVAL
    ));
    // Pausing twice is a no-op
    controller.pause(&job.id).unwrap();

    let held = bytes_of(&controller, &job.id);
    thread::sleep(Duration::from_millis(250));
    assert_eq!(bytes_of(&controller, &job.id), held);
    assert_eq!(controller.job(&job.id).unwrap().state, JobState::Paused);

    let record = controller.bridge().read(&job.id).unwrap();
    assert_eq!(record.state, JobState::Paused);

    controller.resume(&job.id).unwrap();
    let finished = controller
        .wait_until_finished(&job.id, FINISH_TIMEOUT)
        .unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert!(bytes_of(&controller, &job.id) >= held);
    assert_eq!(bytes_of(&controller, &job.id), 40 * CHUNK);
}

#[test]
fn test_pause_and_cancel_honored_within_checkpoint_bound() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 500, 10));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("bound1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();
    let state = || controller.job(&job.id).unwrap().state;

    controller.start(&job.id).unwrap();
    assert!(wait_for(|| bytes_of(&controller, &job.id) > 0, FINISH_TIMEOUT));

    let paused_at = Instant::now();
    controller.pause(&job.id).unwrap();
    assert!(wait_for(|| state() == JobState::Paused, MAX_CHECKPOINT_INTERVAL));
    assert!(paused_at.elapsed() <= MAX_CHECKPOINT_INTERVAL);

    let cancelled_at = Instant::now();
    controller.cancel(&job.id).unwrap();
    let bound = MAX_CHECKPOINT_INTERVAL + CLEANUP_ALLOWANCE;
    assert!(wait_for(|| state() == JobState::Cancelled, bound));
    assert!(cancelled_at.elapsed() <= bound);
    assert!(partial_files(&job.destination_dir).is_empty());
}

#[test]
fn test_signals_on_terminal_job_are_no_ops() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 2, 1));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("term1"), DownloadMode::Video, QualitySelector::P480)
        .unwrap();

    controller.start(&job.id).unwrap();
    let finished = controller
        .wait_until_finished(&job.id, FINISH_TIMEOUT)
        .unwrap();
    assert_eq!(finished.state, JobState::Completed);

    controller.pause(&job.id).unwrap();
    controller.resume(&job.id).unwrap();
    controller.cancel(&job.id).unwrap();
    controller
        .submit_signal(&job.id, ControlSignal::Cancel)
        .unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(controller.job(&job.id).unwrap().state, JobState::Completed);
    assert!(PathBuf::from(finished.file_path.unwrap()).exists());
}

#[test]
fn test_unavailable_source_fails_without_retry_or_partials() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Unavailable, 10, 1));
    let controller = DownloadController::new(config(root.path()), engine.clone()).unwrap();
    let job = controller
        .add_job(&url("priv1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();

    controller.start(&job.id).unwrap();
    let finished = controller
        .wait_until_finished(&job.id, FINISH_TIMEOUT)
        .unwrap();

    assert_eq!(finished.state, JobState::Failed);
    assert_eq!(finished.failure_kind, Some(FailureKind::UnavailableSource));
    assert!(finished.error.unwrap().contains("Private video"));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    assert!(partial_files(&job.destination_dir).is_empty());
}

#[test]
fn test_transient_failures_retried_then_failed() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Transient, 10, 1));
    let controller = DownloadController::new(config(root.path()), engine.clone()).unwrap();
    let job = controller
        .add_job(&url("net1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();

    controller.start(&job.id).unwrap();
    let finished = controller
        .wait_until_finished(&job.id, FINISH_TIMEOUT)
        .unwrap();

    assert_eq!(finished.state, JobState::Failed);
    assert_eq!(finished.failure_kind, Some(FailureKind::TransientFetch));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    assert!(partial_files(&job.destination_dir).is_empty());

    let record = controller.bridge().read(&job.id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure_kind, Some(FailureKind::TransientFetch));
}

#[test]
fn test_cleanup_waits_for_worker_exit() {
    let root = tempfile::tempdir().unwrap();
    let mut engine = ScriptedEngine::new(Script::Succeed, 500, 10);
    engine.slow_unwind = true;
    let controller = DownloadController::new(config(root.path()), Arc::new(engine)).unwrap();
    let job = controller
        .add_job(&url("slow1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();

    controller.start(&job.id).unwrap();
    assert!(wait_for(|| bytes_of(&controller, &job.id) >= 2 * CHUNK, FINISH_TIMEOUT));

    controller.cancel(&job.id).unwrap();
    let finished = controller
        .wait_until_finished(&job.id, FINISH_TIMEOUT)
        .unwrap();

    assert_eq!(finished.state, JobState::Cancelled);
    assert!(
        partial_files(&job.destination_dir).is_empty(),
        "left behind: {:?}",
        partial_files(&job.destination_dir)
    );
}

#[test]
fn test_cleanup_spares_sibling_jobs() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 300, 10));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let keep = controller
        .add_job(&url("keep1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();
    let doomed = controller
        .add_job(&url("drop1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();

    controller.start(&keep.id).unwrap();
    controller.start(&doomed.id).unwrap();
    assert!(wait_for(
        || bytes_of(&controller, &keep.id) > 0 && bytes_of(&controller, &doomed.id) > 0,
        FINISH_TIMEOUT
    ));

    controller.cancel(&doomed.id).unwrap();
    let dropped = controller
        .wait_until_finished(&doomed.id, FINISH_TIMEOUT)
        .unwrap();
    assert_eq!(dropped.state, JobState::Cancelled);

    let dir = keep.destination_dir.clone();
    assert!(dir.join("Clip [keep1].mp4.part").exists());
    assert!(!dir.join("Clip [drop1].mp4.part").exists());
    assert!(controller.job(&keep.id).unwrap().state.is_active());

    controller.cancel(&keep.id).unwrap();
}

#[test]
fn test_bridge_record_tracks_running_job() {
    let root = tempfile::tempdir().unwrap();
    let cfg = config(root.path());
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 100, 10));
    let controller = DownloadController::new(cfg.clone(), engine).unwrap();
    let job = controller
        .add_job(&url("br1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();

    let reader = BridgeReader::new(&cfg.bridge_dir, cfg.sync_interval, cfg.stale_after_intervals);
    assert_eq!(reader.observe(&job.id).unwrap().record.state, JobState::Pending);

    controller.start(&job.id).unwrap();
    assert!(wait_for(
        || reader
            .observe(&job.id)
            .and_then(|s| s.record.snapshot)
            .map_or(false, |s| s.bytes_downloaded > 0),
        FINISH_TIMEOUT
    ));

    let status = reader.observe(&job.id).unwrap();
    assert_eq!(status.record.state, JobState::Running);
    assert!(!status.stale);
    assert_eq!(status.record.filename_prefix.as_deref(), Some("Clip [br1]"));

    controller.cancel(&job.id).unwrap();
    controller.wait_until_finished(&job.id, FINISH_TIMEOUT);
    assert_eq!(
        reader.observe(&job.id).unwrap().record.state,
        JobState::Cancelled
    );
}

#[test]
fn test_bridge_record_refreshed_every_sync_interval() {
    let root = tempfile::tempdir().unwrap();
    let cfg = config(root.path());
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 300, 10));
    let controller = DownloadController::new(cfg.clone(), engine).unwrap();
    let job = controller
        .add_job(&url("fresh1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();
    controller.start(&job.id).unwrap();
    assert!(wait_for(|| bytes_of(&controller, &job.id) > 0, FINISH_TIMEOUT));

    // One interval, plus the time a sync tick takes to write
    let max_age = (cfg.sync_interval + cfg.sync_interval / 2).as_millis() as i64;
    for _ in 0..20 {
        let record = controller.bridge().read(&job.id).unwrap();
        assert_eq!(record.state, JobState::Running);
        let age = wall_millis() - record.updated_at;
        assert!(age <= max_age, "record is {} ms old", age);
        thread::sleep(Duration::from_millis(15));
    }

    controller.cancel(&job.id).unwrap();
}

#[test]
fn test_control_inbox_reaches_owning_controller() {
    let root = tempfile::tempdir().unwrap();
    let cfg = config(root.path());
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 300, 10));
    let controller = DownloadController::new(cfg.clone(), engine).unwrap();
    let job = controller
        .add_job(&url("inbox1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();
    controller.start(&job.id).unwrap();
    assert!(wait_for(|| bytes_of(&controller, &job.id) > 0, FINISH_TIMEOUT));

    // Another process only knows the directory layout
    let inbox = ControlInbox::new(&cfg.control_dir);
    inbox.submit(&job.id, ControlSignal::Pause).unwrap();
    inbox.submit(&job.id, ControlSignal::Cancel).unwrap();

    let finished = controller
        .wait_until_finished(&job.id, FINISH_TIMEOUT)
        .unwrap();
    assert_eq!(finished.state, JobState::Cancelled);
    assert_eq!(fs::read_dir(&cfg.control_dir).unwrap().count(), 0);
}

#[test]
fn test_stale_orphan_record_reconciled() {
    let root = tempfile::tempdir().unwrap();
    let cfg = config(root.path());
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 1, 1));
    let controller = DownloadController::new(cfg.clone(), engine).unwrap();

    let dir = cfg.download_root.join("videos");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("Clip [lost1].mp4.part"), b"partial").unwrap();
    fs::write(dir.join("Clip [lost1].mp4.ytdl"), b"index").unwrap();
    fs::write(dir.join("Other [done1].mp4"), b"finished").unwrap();

    let record = BridgeRecord {
        job_id: "lost1".to_string(),
        state: JobState::Running,
        snapshot: None,
        updated_at: chrono::Utc::now().timestamp_millis() - 10_000,
        source_url: url("lost1"),
        mode: DownloadMode::Video,
        destination_dir: dir.clone(),
        filename_prefix: Some("Clip [lost1]".to_string()),
        file_path: None,
        error: None,
        failure_kind: None,
    };
    controller.bridge().publish(&record).unwrap();

    let reader = BridgeReader::new(&cfg.bridge_dir, cfg.sync_interval, cfg.stale_after_intervals);
    let status = reader.observe("lost1").unwrap();
    assert!(status.stale);
    assert!(status.age_ms >= 10_000);

    let kept = controller
        .reconcile("lost1", Reconciliation::AssumeRunning)
        .unwrap();
    assert_eq!(kept.state, JobState::Running);
    assert!(dir.join("Clip [lost1].mp4.part").exists());

    let failed = controller
        .reconcile("lost1", Reconciliation::MarkFailed)
        .unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failure_kind, Some(FailureKind::WorkerLost));
    assert!(partial_files(&dir).is_empty());
    assert!(dir.join("Other [done1].mp4").exists());

    let status = reader.observe("lost1").unwrap();
    assert_eq!(status.record.state, JobState::Failed);
    assert!(!status.stale);
}

#[test]
fn test_acknowledge_removes_orphaned_terminal_record() {
    let root = tempfile::tempdir().unwrap();
    let cfg = config(root.path());
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 1, 1));
    let controller = DownloadController::new(cfg.clone(), engine).unwrap();

    let record = |id: &str, state: JobState| BridgeRecord {
        job_id: id.to_string(),
        state,
        snapshot: None,
        updated_at: wall_millis(),
        source_url: url(id),
        mode: DownloadMode::Video,
        destination_dir: cfg.download_root.join("videos"),
        filename_prefix: None,
        file_path: None,
        error: None,
        failure_kind: None,
    };
    controller
        .bridge()
        .publish(&record("done2", JobState::Completed))
        .unwrap();
    controller
        .bridge()
        .publish(&record("busy2", JobState::Running))
        .unwrap();

    let acked = controller.acknowledge("done2").unwrap();
    assert_eq!(acked.state, JobState::Completed);
    assert!(controller.bridge().read("done2").is_none());

    assert!(matches!(
        controller.acknowledge("busy2"),
        Err(DownloadError::InvalidState { .. })
    ));
    assert!(controller.bridge().read("busy2").is_some());

    assert!(matches!(
        controller.acknowledge("done2"),
        Err(DownloadError::JobNotFound(_))
    ));
}

#[test]
fn test_reconcile_rejects_live_job() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 300, 10));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("live1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();
    controller.start(&job.id).unwrap();

    assert!(matches!(
        controller.reconcile(&job.id, Reconciliation::MarkFailed),
        Err(DownloadError::InvalidState { .. })
    ));
    controller.cancel(&job.id).unwrap();
}

#[test]
fn test_shutdown_cancels_active_jobs() {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(Script::Succeed, 500, 10));
    let controller = DownloadController::new(config(root.path()), engine).unwrap();
    let job = controller
        .add_job(&url("shut1"), DownloadMode::Video, QualitySelector::Max)
        .unwrap();
    controller.start(&job.id).unwrap();
    assert!(wait_for(|| bytes_of(&controller, &job.id) > 0, FINISH_TIMEOUT));

    controller.shutdown();

    assert_eq!(controller.job(&job.id).unwrap().state, JobState::Cancelled);
    assert!(partial_files(&job.destination_dir).is_empty());
}
