// yt-dlp subprocess engine
// Spawns yt-dlp, turns its templated progress lines into engine progress
// callbacks and classifies its failures from stderr.

use super::{
    EngineError, EngineProgress, EngineSession, FetchEngine, FetchOutcome, FetchRequest,
};
use crate::models::{DownloadMode, QualitySelector, Settings};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const PROGRESS_TAG: &str = "MEDIAGRAB_PROGRESS";
const FILE_TAG: &str = "MEDIAGRAB_FILE";
const STDERR_TAIL_LINES: usize = 200;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const UNAVAILABLE_MARKERS: &[&str] = &[
    "private video",
    "video unavailable",
    "this video is unavailable",
    "this video is not available",
    "sign in to confirm your age",
    "age-restricted",
    "members-only",
    "has been removed",
    "account associated with this video has been terminated",
    "not available in your country",
    "http error 404",
    "http error 410",
    "unsupported url",
    "is not a valid url",
    "incomplete youtube id",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "connection reset",
    "connection refused",
    "connection aborted",
    "temporary failure in name resolution",
    "network is unreachable",
    "http error 429",
    "http error 500",
    "http error 502",
    "http error 503",
    "http error 504",
    "unable to download video data",
    "unable to download webpage",
    "incompleteread",
    "got error",
];

enum StreamLine {
    Stdout(String),
    Stderr(String),
}

enum RunEnd {
    Finished,
    Suspended,
}

pub struct YtDlpEngine {
    binary: String,
    audio_format: String,
    audio_quality: String,
    poll_interval: Duration,
}

impl YtDlpEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            audio_format: String::from("mp3"),
            audio_quality: String::from("192K"),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            binary: settings.ytdlp_path.clone(),
            audio_format: settings.audio_format.clone(),
            audio_quality: settings.audio_quality.clone(),
            poll_interval: Duration::from_millis(settings.checkpoint_interval_ms.clamp(20, 200)),
        }
    }

    fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let output_template = request
            .destination_dir
            .join("%(title).150B [%(id)s].%(ext)s")
            .to_string_lossy()
            .to_string();

        let mut args: Vec<String> = vec![
            "--newline".into(),
            "--no-playlist".into(),
            "--continue".into(),
            "--no-colors".into(),
            "--progress".into(),
            "--no-simulate".into(),
            "--retries".into(),
            "3".into(),
            "--fragment-retries".into(),
            "10".into(),
            "--socket-timeout".into(),
            "30".into(),
            "--progress-template".into(),
            format!(
                "download:{} %(progress.downloaded_bytes)s %(progress.total_bytes)s \
                 %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s \
                 %(progress.filename)s",
                PROGRESS_TAG
            ),
            "--print".into(),
            format!("after_move:{} %(filepath)s", FILE_TAG),
            "-f".into(),
            format_selector(request.mode, request.quality),
            "-o".into(),
            output_template,
        ];

        if request.mode == DownloadMode::AudioOnly {
            args.extend([
                "--extract-audio".to_string(),
                "--audio-format".to_string(),
                self.audio_format.clone(),
                "--audio-quality".to_string(),
                self.audio_quality.clone(),
            ]);
        }

        args.push("--".into());
        args.push(request.source_url.clone());
        args
    }

    fn spawn_child(&self, request: &FetchRequest) -> Result<Child, EngineError> {
        let args = self.build_args(request);
        log::debug!("{} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd.spawn()
            .map_err(|e| EngineError::Fatal(format!("Failed to spawn {}: {}", self.binary, e)))
    }

    /// Runs yt-dlp until it exits or a pause asks for it to be stopped.
    /// Only non-blocking session calls are made while the child is alive.
    fn run_once(
        &self,
        request: &FetchRequest,
        session: &mut dyn EngineSession,
        final_path: &mut Option<PathBuf>,
    ) -> Result<RunEnd, EngineError> {
        let mut child = self.spawn_child(request)?;

        let (tx, rx) = mpsc::channel::<StreamLine>();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone(), StreamLine::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone(), StreamLine::Stderr);
        }
        drop(tx);

        let mut stderr_tail: VecDeque<String> = VecDeque::new();

        loop {
            if session.pause_requested() {
                stop_child(&mut child);
                log::debug!("Stopped yt-dlp for pause: {}", request.source_url);
                return Ok(RunEnd::Suspended);
            }

            match rx.recv_timeout(self.poll_interval) {
                Ok(StreamLine::Stdout(line)) => {
                    if let Some(progress) = parse_progress_line(&line) {
                        if let Err(interrupted) = session.report(progress) {
                            stop_child(&mut child);
                            return Err(interrupted.into());
                        }
                    } else if let Some(path) = parse_file_line(&line) {
                        *final_path = Some(path);
                    } else if !line.trim().is_empty() {
                        log::debug!("yt-dlp: {}", line);
                    }
                }
                Ok(StreamLine::Stderr(line)) => {
                    log::debug!("yt-dlp stderr: {}", line);
                    stderr_tail.push_back(line);
                    if stderr_tail.len() > STDERR_TAIL_LINES {
                        stderr_tail.pop_front();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(interrupted) = session.poll() {
                        stop_child(&mut child);
                        return Err(interrupted.into());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child
            .wait()
            .map_err(|e| EngineError::Fatal(format!("Failed to wait for yt-dlp: {}", e)))?;

        if status.success() {
            return Ok(RunEnd::Finished);
        }

        let stderr_text = stderr_tail.make_contiguous().join("\n");
        Err(classify_failure(&stderr_text, status))
    }
}

impl FetchEngine for YtDlpEngine {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        session: &mut dyn EngineSession,
    ) -> Result<FetchOutcome, EngineError> {
        std::fs::create_dir_all(&request.destination_dir).map_err(|e| {
            EngineError::Fatal(format!(
                "Failed to create directory {:?}: {}",
                request.destination_dir, e
            ))
        })?;

        let mut final_path = None;
        loop {
            match self.run_once(request, session, &mut final_path)? {
                RunEnd::Finished => return Ok(FetchOutcome { file_path: final_path }),
                RunEnd::Suspended => {
                    // yt-dlp keeps its .part data; --continue picks it up on restart
                    session.checkpoint()?;
                    log::debug!("Restarting yt-dlp after resume: {}", request.source_url);
                }
            }
        }
    }
}

fn forward_lines<R, F>(stream: R, tx: Sender<StreamLine>, wrap: F)
where
    R: Read + Send + 'static,
    F: Fn(String) -> StreamLine + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

/// Kills and reaps the child so it cannot outlive the worker
fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("yt-dlp already exited: {}", e);
    }
    let _ = child.wait();
}

/// yt-dlp `-f` expression for a mode and quality cap
pub fn format_selector(mode: DownloadMode, quality: QualitySelector) -> String {
    match (mode, quality.max_height()) {
        (DownloadMode::AudioOnly, _) => "bestaudio/best".to_string(),
        (DownloadMode::Video, None) => "bestvideo+bestaudio/best".to_string(),
        (DownloadMode::Video, Some(height)) => format!(
            "bestvideo[height<={h}]+bestaudio/best[height<={h}]",
            h = height
        ),
    }
}

fn parse_number(field: &str) -> Option<f64> {
    if field == "NA" || field == "None" {
        return None;
    }
    field.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

/// Parses one `--progress-template` line
pub fn parse_progress_line(line: &str) -> Option<EngineProgress> {
    let rest = line.trim().strip_prefix(PROGRESS_TAG)?;
    let mut parts = rest.trim_start().splitn(6, ' ');

    let downloaded = parse_number(parts.next()?)?;
    let total = parts.next().and_then(parse_number);
    let estimate = parts.next().and_then(parse_number);
    let speed = parts.next().and_then(parse_number);
    let eta = parts.next().and_then(parse_number);
    let filename = parts.next().unwrap_or_default().trim().to_string();

    Some(EngineProgress {
        bytes_downloaded: downloaded as u64,
        bytes_total: total.or(estimate).map(|v| v as u64),
        speed_bytes_per_sec: speed,
        eta_seconds: eta.map(|v| v as u64),
        filename,
    })
}

fn parse_file_line(line: &str) -> Option<PathBuf> {
    let rest = line.trim().strip_prefix(FILE_TAG)?;
    let path = rest.trim();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Maps a failed run onto the engine error taxonomy
pub fn classify_failure(stderr: &str, status: ExitStatus) -> EngineError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR:"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| format!("yt-dlp exited with {}", status));

    classify_message(stderr, message)
}

fn classify_message(stderr: &str, message: String) -> EngineError {
    let lower = stderr.to_lowercase();
    if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        EngineError::Unavailable(message)
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        EngineError::Transient(message)
    } else {
        EngineError::Fatal(message)
    }
}
