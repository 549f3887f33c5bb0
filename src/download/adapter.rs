// Fetch Engine Adapter
// Runs the engine on the worker thread, turns each native progress callback
// into one Progress Channel write and enforces the pause/cancel checkpoint.

use super::channel::ProgressChannel;
use super::cleanup::strip_incomplete_suffix;
use super::signal::ControlCell;
use crate::error::{DownloadError, DownloadResult};
use crate::models::{ControlSignal, JobState, ProgressSnapshot};
use crate::process_manager::{
    EngineError, EngineProgress, EngineSession, FetchEngine, FetchOutcome, FetchRequest,
    Interrupted,
};
use crate::utils::monotonic_millis;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound between checkpoints while paused or backing off
pub const MAX_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub checkpoint_interval: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            checkpoint_interval: Duration::from_millis(100),
        }
    }
}

/// Highest byte count seen per output file. A job's downloaded total is the
/// sum, so it never regresses when the engine switches streams, restarts
/// after a pause, or retries.
#[derive(Debug, Default)]
pub struct ByteLedger {
    files: HashMap<String, (u64, Option<u64>)>,
}

impl ByteLedger {
    pub fn record(&mut self, progress: &EngineProgress) -> (u64, Option<u64>) {
        let key = strip_incomplete_suffix(&display_name(&progress.filename)).to_string();
        let entry = self.files.entry(key).or_insert((0, None));
        entry.0 = entry.0.max(progress.bytes_downloaded);
        if progress.bytes_total.is_some() {
            entry.1 = progress.bytes_total;
        }
        self.totals()
    }

    pub fn totals(&self) -> (u64, Option<u64>) {
        let downloaded = self.files.values().map(|(d, _)| *d).sum();
        let total = self
            .files
            .values()
            .map(|(d, t)| t.map(|t| t.max(*d)))
            .sum::<Option<u64>>();
        (downloaded, total)
    }
}

fn display_name(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string())
}

/// The engine's view of one job: checkpoints against the control cell and
/// writes translated snapshots to the channel
struct CheckpointSession<'a> {
    control: &'a ControlCell,
    channel: &'a ProgressChannel,
    observer: &'a dyn Fn(JobState),
    interval: Duration,
    ledger: ByteLedger,
    /// Set once a Cancel has been handed to the engine
    interrupted: bool,
}

impl<'a> CheckpointSession<'a> {
    fn interrupt(&mut self) -> Result<(), Interrupted> {
        self.interrupted = true;
        Err(Interrupted)
    }

    /// Blocks until Resume or Cancel. Stays responsive to Cancel at
    /// `interval` granularity.
    fn hold(&mut self) -> Result<(), Interrupted> {
        (self.observer)(JobState::Paused);
        loop {
            match self.control.wait_take(self.interval) {
                Some(ControlSignal::Resume) => {
                    (self.observer)(JobState::Running);
                    return Ok(());
                }
                Some(ControlSignal::Cancel) => return self.interrupt(),
                Some(ControlSignal::Pause) | None => continue,
            }
        }
    }

    /// Sleeps for a retry backoff while still honoring pause and cancel
    fn sleep(&mut self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let wait = (deadline - now).min(self.interval);
            match self.control.wait_take(wait) {
                Some(ControlSignal::Cancel) => return self.interrupt(),
                Some(ControlSignal::Pause) => self.hold()?,
                Some(ControlSignal::Resume) | None => {}
            }
        }
    }

    fn translate(&mut self, progress: &EngineProgress) -> ProgressSnapshot {
        let (bytes_downloaded, bytes_total) = self.ledger.record(progress);
        ProgressSnapshot {
            bytes_downloaded,
            bytes_total,
            speed_bytes_per_sec: progress.speed_bytes_per_sec.unwrap_or(0.0),
            eta_seconds: progress.eta_seconds,
            filename: display_name(&progress.filename),
            timestamp_monotonic: monotonic_millis(),
        }
    }
}

impl<'a> EngineSession for CheckpointSession<'a> {
    fn on_progress(&mut self, progress: EngineProgress) -> Result<(), Interrupted> {
        self.checkpoint()?;
        let snapshot = self.translate(&progress);
        self.channel.publish(snapshot);
        self.checkpoint()
    }

    fn checkpoint(&mut self) -> Result<(), Interrupted> {
        match self.control.take() {
            None | Some(ControlSignal::Resume) => Ok(()),
            Some(ControlSignal::Cancel) => self.interrupt(),
            Some(ControlSignal::Pause) => self.hold(),
        }
    }

    fn report(&mut self, progress: EngineProgress) -> Result<(), Interrupted> {
        self.poll()?;
        let snapshot = self.translate(&progress);
        self.channel.publish(snapshot);
        self.poll()
    }

    fn poll(&mut self) -> Result<(), Interrupted> {
        match self.control.take_unless(ControlSignal::Pause) {
            Some(ControlSignal::Cancel) => self.interrupt(),
            _ => Ok(()),
        }
    }

    fn pause_requested(&self) -> bool {
        self.control.peek() == Some(ControlSignal::Pause)
    }
}

pub struct FetchAdapter {
    engine: Arc<dyn FetchEngine>,
    config: AdapterConfig,
}

impl FetchAdapter {
    pub fn new(engine: Arc<dyn FetchEngine>, config: AdapterConfig) -> Self {
        let mut config = config;
        config.checkpoint_interval = config.checkpoint_interval.min(MAX_CHECKPOINT_INTERVAL);
        config.max_attempts = config.max_attempts.max(1);
        Self { engine, config }
    }

    /// Drives the engine to completion. Every error leaving this function is
    /// already classified; `Cancelled` marks the cooperative unwind.
    pub fn run(
        &self,
        request: &FetchRequest,
        control: &ControlCell,
        channel: &ProgressChannel,
        observer: &dyn Fn(JobState),
    ) -> DownloadResult<FetchOutcome> {
        let mut session = CheckpointSession {
            control,
            channel,
            observer,
            interval: self.config.checkpoint_interval,
            ledger: ByteLedger::default(),
            interrupted: false,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            session.checkpoint().map_err(|_| DownloadError::Cancelled)?;

            let err = match self.engine.fetch(request, &mut session) {
                Ok(_) if session.interrupted => {
                    log::warn!(
                        "{} finished {} after it was cancelled",
                        self.engine.name(),
                        request.source_url
                    );
                    return Err(DownloadError::Cancelled);
                }
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            match err {
                EngineError::Interrupted => return Err(DownloadError::Cancelled),
                EngineError::Unavailable(message) => {
                    return Err(DownloadError::UnavailableSource(message))
                }
                EngineError::Fatal(message) => return Err(DownloadError::Engine(message)),
                EngineError::Transient(message) if attempt >= self.config.max_attempts => {
                    return Err(DownloadError::TransientFetch {
                        attempts: attempt,
                        message,
                    })
                }
                EngineError::Transient(message) => {
                    let delay = self.backoff_delay(attempt);
                    log::warn!(
                        "{} attempt {}/{} failed for {}: {} (retrying in {:?})",
                        self.engine.name(),
                        attempt,
                        self.config.max_attempts,
                        request.source_url,
                        message,
                        delay
                    );
                    session.sleep(delay).map_err(|_| DownloadError::Cancelled)?;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let exp = base.saturating_mul(1 << (attempt.saturating_sub(1)).min(6));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(exp + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn progress(file: &str, downloaded: u64, total: Option<u64>) -> EngineProgress {
        EngineProgress {
            bytes_downloaded: downloaded,
            bytes_total: total,
            speed_bytes_per_sec: Some(1000.0),
            eta_seconds: Some(1),
            filename: file.to_string(),
        }
    }

    fn request() -> FetchRequest {
        FetchRequest {
            source_url: "https://youtu.be/abc".to_string(),
            quality: crate::models::QualitySelector::P720,
            mode: crate::models::DownloadMode::Video,
            destination_dir: std::env::temp_dir(),
        }
    }

    fn quick_config(max_attempts: u32) -> AdapterConfig {
        AdapterConfig {
            max_attempts,
            retry_backoff: Duration::from_millis(1),
            checkpoint_interval: Duration::from_millis(10),
        }
    }

    /// Fails with the scripted errors, then reports one progress and succeeds
    struct ScriptedEngine {
        failures: Mutex<Vec<EngineError>>,
        calls: AtomicU32,
    }

    impl FetchEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fetch(
            &self,
            _request: &FetchRequest,
            session: &mut dyn EngineSession,
        ) -> Result<FetchOutcome, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            session.on_progress(progress("clip.mp4.part", 10, Some(100)))?;
            if let Some(err) = self.failures.lock().pop() {
                return Err(err);
            }
            Ok(FetchOutcome::default())
        }
    }

    #[test]
    fn test_ledger_sums_streams_and_never_regresses() {
        let mut ledger = ByteLedger::default();
        assert_eq!(
            ledger.record(&progress("/d/v.f137.mp4.part", 400, Some(1000))),
            (400, Some(1000))
        );
        // Engine restarted and reported a smaller count for the same file
        assert_eq!(
            ledger.record(&progress("/d/v.f137.mp4.part", 100, Some(1000))),
            (400, Some(1000))
        );
        // Second stream begins counting from zero
        assert_eq!(
            ledger.record(&progress("/d/v.f251.webm.part", 50, None)),
            (450, None)
        );
        assert_eq!(
            ledger.record(&progress("/d/v.f251.webm", 200, Some(200))),
            (600, Some(1200))
        );
    }

    #[test]
    fn test_transient_errors_retried_then_succeed() {
        let engine = Arc::new(ScriptedEngine {
            failures: Mutex::new(vec![EngineError::Transient("timed out".into())]),
            calls: AtomicU32::new(0),
        });
        let adapter = FetchAdapter::new(engine.clone(), quick_config(3));
        let control = ControlCell::new();
        let channel = ProgressChannel::new();

        let result = adapter.run(&request(), &control, &channel, &|_| {});
        assert!(result.is_ok());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(channel.get().unwrap().bytes_downloaded, 10);
    }

    #[test]
    fn test_transient_errors_exhaust_attempts() {
        let engine = Arc::new(ScriptedEngine {
            failures: Mutex::new(vec![
                EngineError::Transient("reset".into()),
                EngineError::Transient("reset".into()),
            ]),
            calls: AtomicU32::new(0),
        });
        let adapter = FetchAdapter::new(engine.clone(), quick_config(2));
        let control = ControlCell::new();
        let channel = ProgressChannel::new();

        match adapter.run(&request(), &control, &channel, &|_| {}) {
            Err(DownloadError::TransientFetch { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected TransientFetch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unavailable_source_not_retried() {
        let engine = Arc::new(ScriptedEngine {
            failures: Mutex::new(vec![EngineError::Unavailable("Private video".into())]),
            calls: AtomicU32::new(0),
        });
        let adapter = FetchAdapter::new(engine.clone(), quick_config(5));
        let control = ControlCell::new();
        let channel = ProgressChannel::new();

        let result = adapter.run(&request(), &control, &channel, &|_| {});
        assert!(matches!(result, Err(DownloadError::UnavailableSource(_))));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_cancel_stops_before_engine_runs() {
        let engine = Arc::new(ScriptedEngine {
            failures: Mutex::new(vec![]),
            calls: AtomicU32::new(0),
        });
        let adapter = FetchAdapter::new(engine.clone(), quick_config(3));
        let control = ControlCell::new();
        control.submit(ControlSignal::Pause);
        control.submit(ControlSignal::Cancel);
        let channel = ProgressChannel::new();

        let result = adapter.run(&request(), &control, &channel, &|_| {});
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert!(channel.get().is_none());
    }

    #[test]
    fn test_pause_reports_state_changes_to_observer() {
        let control = ControlCell::new();
        let channel = ProgressChannel::new();
        let seen = Mutex::new(Vec::new());
        let observer = |state: JobState| seen.lock().push(state);
        let mut session = CheckpointSession {
            control: &control,
            channel: &channel,
            observer: &observer,
            interval: Duration::from_millis(10),
            ledger: ByteLedger::default(),
            interrupted: false,
        };

        control.submit(ControlSignal::Pause);
        assert!(session.pause_requested());
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                control.submit(ControlSignal::Resume);
            });
            assert!(session.checkpoint().is_ok());
        });

        assert_eq!(*seen.lock(), vec![JobState::Paused, JobState::Running]);
    }

    #[test]
    fn test_report_never_holds_on_pause() {
        let control = ControlCell::new();
        let channel = ProgressChannel::new();
        let seen = Mutex::new(Vec::new());
        let observer = |state: JobState| seen.lock().push(state);
        let mut session = CheckpointSession {
            control: &control,
            channel: &channel,
            observer: &observer,
            interval: Duration::from_millis(10),
            ledger: ByteLedger::default(),
            interrupted: false,
        };

        control.submit(ControlSignal::Pause);
        assert!(session.report(progress("clip.mp4.part", 10, None)).is_ok());
        assert!(session.poll().is_ok());
        assert!(session.pause_requested());
        assert!(seen.lock().is_empty());
        assert_eq!(channel.get().unwrap().bytes_downloaded, 10);

        control.submit(ControlSignal::Cancel);
        assert_eq!(session.poll(), Err(Interrupted));
        assert!(session.interrupted);
    }

    /// Swallows the interrupt and claims success
    struct StubbornEngine;

    impl FetchEngine for StubbornEngine {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn fetch(
            &self,
            _request: &FetchRequest,
            session: &mut dyn EngineSession,
        ) -> Result<FetchOutcome, EngineError> {
            for i in 1..1000 {
                if session.on_progress(progress("clip.mp4.part", i, None)).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(FetchOutcome::default())
        }
    }

    #[test]
    fn test_success_after_cancel_counts_as_cancelled() {
        let adapter = FetchAdapter::new(Arc::new(StubbornEngine), quick_config(1));
        let control = ControlCell::new();
        let channel = ProgressChannel::new();

        let result = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                control.submit(ControlSignal::Pause);
                std::thread::sleep(Duration::from_millis(20));
                control.submit(ControlSignal::Cancel);
            });
            adapter.run(&request(), &control, &channel, &|_| {})
        });

        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
