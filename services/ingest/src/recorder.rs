//! Recording sink with deduplication and time-based file rotation.
//!
//! Frames are pushed in batches by the caller and written by a dedicated
//! thread. State is split into two halves with separate locks:
//!
//! - **intake**: the write queue, the received cursor, the deduplicator and
//!   the received/dropped/deduplicated counters
//! - **output**: the open writer, current file, written/failed counters and
//!   the last written sequence
//!
//! No code path holds both locks at once, so callers of
//! [`RecordingSink::write_frames`] never wait on the encoder.

use crate::algorithm::Algorithm;
use crate::config::RecordingConfig;
use crate::dedup::{DedupStats, FrameDeduplicator};
use crate::frame::Frame;
use crate::media::{ops, MediaError, VideoWriter, WriterBackend, WriterSettings};
use crate::worker::Worker;
use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Errors that can occur while recording.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("Invalid output folder template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("Failed to create output folder {path}: {source}")]
    CreateFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Writer(#[from] MediaError),

    #[error("Invalid rotation duration {0}s, expected a finite positive number")]
    InvalidDuration(f64),

    #[error("Deduplication is not enabled")]
    DeduplicationDisabled,

    #[error("Invalid deduplication config: {0}")]
    DedupConfig(String),

    #[error("Failed to spawn write thread: {0}")]
    Spawn(std::io::Error),
}

/// Resolution and frame rate of recorded files.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl From<&crate::config::VideoConfig> for VideoGeometry {
    fn from(config: &crate::config::VideoConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
        }
    }
}

/// Recording statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordingStats {
    pub is_recording: bool,
    pub current_filename: Option<PathBuf>,

    /// Seconds since the current file was opened
    pub elapsed_time: Option<f64>,
    pub total_frames_received: u64,
    pub total_frames_written: u64,
    pub total_frames_dropped: u64,
    pub total_frames_deduplicated: u64,
    pub total_frames_failed: u64,
    pub files_created: u64,
    pub write_queue_size: usize,
    pub max_write_queue_size: usize,
    pub last_written_frame_counter: Option<u64>,
    pub deduplication: Option<DedupStats>,
}

/// Check that a folder template only uses valid strftime tokens.
pub fn check_path_template(template: &str) -> Result<(), String> {
    if StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
        Err(format!("invalid strftime pattern '{template}'"))
    } else {
        Ok(())
    }
}

#[derive(Default)]
struct Intake {
    queue: VecDeque<Frame>,
    recording: bool,
    /// The write thread holds a dequeued frame
    writing: bool,
    last_received: Option<u64>,
    received: u64,
    dropped: u64,
    deduplicated: u64,
    deduplicator: Option<FrameDeduplicator>,
}

#[derive(Default)]
struct Output {
    writer: Option<Box<dyn VideoWriter>>,
    path: Option<PathBuf>,
    started_at: Option<Instant>,
    files_created: u64,
    written: u64,
    failed: u64,
    last_written: Option<u64>,
}

enum WriteOutcome {
    Written,
    Failed,
    Dropped,
    RotationFailed,
}

struct Shared {
    config: RecordingConfig,
    geometry: VideoGeometry,
    backend: Arc<dyn WriterBackend>,
    intake: Mutex<Intake>,
    changed: Condvar,
    output: Mutex<Output>,
    running: AtomicBool,
}

/// Writes frames to rotating output files on a background thread.
pub struct RecordingSink {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl RecordingSink {
    pub fn new(
        config: RecordingConfig,
        geometry: VideoGeometry,
        backend: Arc<dyn WriterBackend>,
    ) -> Result<Self, RecordingError> {
        check_path_template(&config.output_folder).map_err(|message| {
            RecordingError::InvalidTemplate {
                template: config.output_folder.clone(),
                message,
            }
        })?;
        if let Some(duration) = config.duration_secs {
            if !(duration.is_finite() && duration > 0.0) {
                return Err(RecordingError::InvalidDuration(duration));
            }
        }

        let deduplicator = config
            .enable_deduplication
            .then(|| FrameDeduplicator::new(config.deduplication.clone()));

        info!(
            width = geometry.width,
            height = geometry.height,
            fps = geometry.fps,
            deduplication = config.enable_deduplication,
            "Recording sink initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                geometry,
                backend,
                intake: Mutex::new(Intake {
                    deduplicator,
                    ..Intake::default()
                }),
                changed: Condvar::new(),
                output: Mutex::new(Output::default()),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn is_recording(&self) -> bool {
        self.shared.intake.lock().recording
    }

    /// Path of the file being written, if recording.
    pub fn current_filename(&self) -> Option<PathBuf> {
        if !self.is_recording() {
            return None;
        }
        self.shared.output.lock().path.clone()
    }

    /// Open a new output file and begin accepting frames.
    ///
    /// Returns the path of the file being written.
    pub fn start_recording(&self) -> Result<PathBuf, RecordingError> {
        let mut worker = self.worker.lock();

        if self.is_recording() {
            warn!("Recording is already active");
            if let Some(path) = self.shared.output.lock().path.clone() {
                return Ok(path);
            }
        }

        let (writer, path) = open_writer(&self.shared, None).map_err(|e| {
            error!(error = %e, "Failed to start recording");
            e
        })?;

        {
            let mut output = self.shared.output.lock();
            output.writer = Some(writer);
            output.path = Some(path.clone());
            output.started_at = Some(Instant::now());
            output.files_created += 1;
        }
        self.shared.intake.lock().recording = true;

        let alive = worker.as_ref().is_some_and(|w| !w.is_finished());
        if !alive {
            if let Some(finished) = worker.take() {
                finished.join_timeout(Duration::ZERO);
            }
            self.shared.running.store(true, Ordering::SeqCst);
            let shared = self.shared.clone();
            match Worker::spawn("recording-writer", move || write_loop(shared)) {
                Ok(spawned) => *worker = Some(spawned),
                Err(e) => {
                    self.shared.running.store(false, Ordering::SeqCst);
                    self.shared.intake.lock().recording = false;
                    close_writer(&self.shared);
                    return Err(RecordingError::Spawn(e));
                }
            }
        }

        info!(path = %path.display(), "Recording started");
        Ok(path)
    }

    /// Stop accepting frames, drain the queue (bounded) and close the file.
    pub fn stop_recording(&self) {
        let _control = self.worker.lock();
        {
            let mut intake = self.shared.intake.lock();
            if !intake.recording {
                return;
            }
            intake.recording = false;
        }
        info!("Stopping recording");

        let deadline = Instant::now() + self.shared.config.drain_timeout();
        let leftover = {
            let mut intake = self.shared.intake.lock();
            while !intake.queue.is_empty() || intake.writing {
                if self.shared.changed.wait_until(&mut intake, deadline).timed_out() {
                    break;
                }
            }
            let leftover = intake.queue.len() as u64;
            intake.queue.clear();
            intake.dropped += leftover;
            leftover
        };
        if leftover > 0 {
            warn!(frames = leftover, "Write queue not drained in time, frames dropped");
        }

        let path = close_writer(&self.shared);
        info!(path = ?path, "Recording stopped");
    }

    /// Queue frames for writing and return how many were queued.
    ///
    /// Frames at or below the last received sequence are skipped. Duplicates
    /// and frames that do not fit in the queue are counted, never queued.
    pub fn write_frames(&self, frames: &[Frame]) -> usize {
        let mut intake = self.shared.intake.lock();
        if !intake.recording {
            return 0;
        }

        let mut queued = 0;
        for frame in frames {
            if intake.last_received.is_some_and(|last| frame.sequence <= last) {
                continue;
            }
            intake.last_received = Some(frame.sequence);
            intake.received += 1;

            let duplicate = intake
                .deduplicator
                .as_mut()
                .is_some_and(|dedup| dedup.classify(frame).is_duplicate);
            if duplicate {
                intake.deduplicated += 1;
                debug!(sequence = frame.sequence, "Skipping duplicate frame");
                continue;
            }

            if intake.queue.len() >= self.shared.config.max_write_queue_size {
                intake.dropped += 1;
                debug!(sequence = frame.sequence, "Write queue full, dropping frame");
                continue;
            }

            intake.queue.push_back(frame.clone());
            queued += 1;
        }

        if queued > 0 {
            self.shared.changed.notify_all();
        }
        queued
    }

    pub fn stats(&self) -> RecordingStats {
        let mut stats = {
            let intake = self.shared.intake.lock();
            RecordingStats {
                is_recording: intake.recording,
                total_frames_received: intake.received,
                total_frames_dropped: intake.dropped,
                total_frames_deduplicated: intake.deduplicated,
                write_queue_size: intake.queue.len(),
                max_write_queue_size: self.shared.config.max_write_queue_size,
                deduplication: intake.deduplicator.as_ref().map(|d| d.stats()),
                ..RecordingStats::default()
            }
        };

        let output = self.shared.output.lock();
        if stats.is_recording {
            stats.current_filename = output.path.clone();
            stats.elapsed_time = output.started_at.map(|t| t.elapsed().as_secs_f64());
        }
        stats.total_frames_written = output.written;
        stats.total_frames_failed = output.failed;
        stats.files_created = output.files_created;
        stats.last_written_frame_counter = output.last_written;
        stats
    }

    /// Zero every counter and the deduplicator's history.
    pub fn reset_stats(&self) {
        {
            let mut intake = self.shared.intake.lock();
            intake.received = 0;
            intake.dropped = 0;
            intake.deduplicated = 0;
            if let Some(dedup) = intake.deduplicator.as_mut() {
                dedup.reset_stats();
            }
        }
        {
            let mut output = self.shared.output.lock();
            output.written = 0;
            output.failed = 0;
            output.files_created = 0;
        }
        info!("Recording statistics reset");
    }

    /// Apply a partial deduplication config update.
    pub fn update_dedup_config(&self, patch: &Value) -> Result<(), RecordingError> {
        let mut intake = self.shared.intake.lock();
        let dedup = intake.deduplicator.as_mut().ok_or_else(|| {
            warn!("Deduplication is not enabled");
            RecordingError::DeduplicationDisabled
        })?;
        dedup
            .update_config(patch)
            .map_err(|e| RecordingError::DedupConfig(e.to_string()))?;
        info!("Deduplication configuration updated");
        Ok(())
    }

    /// Stop recording, end the write thread and clean up the deduplicator.
    pub fn stop(&self) {
        self.stop_recording();

        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping recording sink");
        {
            let _intake = self.shared.intake.lock();
            self.shared.changed.notify_all();
        }

        if let Some(worker) = self.worker.lock().take() {
            worker.join_timeout(self.shared.config.stop_timeout());
        }

        if let Some(dedup) = self.shared.intake.lock().deduplicator.as_mut() {
            dedup.cleanup();
        }
        info!("Recording sink stopped");
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `{folder}/{HH-MM-SS}_{suffix}.{format}`, with `-N` appended when taken.
fn next_file_path(folder: &Path, suffix: &str, format: &str, previous: Option<&Path>) -> PathBuf {
    let stem = format!("{}_{}", Local::now().format("%H-%M-%S"), suffix);
    let taken = |path: &Path| path.exists() || previous == Some(path);

    let mut path = folder.join(format!("{stem}.{format}"));
    let mut counter = 1;
    while taken(&path) {
        path = folder.join(format!("{stem}-{counter}.{format}"));
        counter += 1;
    }
    path
}

/// Render the folder template, create it and open a writer for a fresh file.
fn open_writer(
    shared: &Shared,
    previous: Option<&Path>,
) -> Result<(Box<dyn VideoWriter>, PathBuf), RecordingError> {
    let config = &shared.config;
    let folder = PathBuf::from(Local::now().format(&config.output_folder).to_string());
    std::fs::create_dir_all(&folder).map_err(|source| RecordingError::CreateFolder {
        path: folder.clone(),
        source,
    })?;

    let path = next_file_path(&folder, &config.file_suffix, &config.video_format, previous);
    let settings = WriterSettings {
        width: shared.geometry.width,
        height: shared.geometry.height,
        fps: shared.geometry.fps,
        codec: config.fourcc_codec.clone(),
        format: config.video_format.clone(),
    };
    let writer = shared.backend.open(&path, &settings)?;
    Ok((writer, path))
}

/// Close the open writer, if any, and return its path.
fn close_writer(shared: &Shared) -> Option<PathBuf> {
    let mut output = shared.output.lock();
    if let Some(mut writer) = output.writer.take() {
        if let Err(e) = writer.close() {
            error!(error = %e, path = ?output.path, "Failed to finalize recording file");
        }
    }
    output.started_at = None;
    output.path.clone()
}

fn write_one(shared: &Shared, frame: &Frame) -> WriteOutcome {
    let mut output = shared.output.lock();
    if output.writer.is_none() {
        return WriteOutcome::Dropped;
    }

    let due = match (shared.config.rotation_interval(), output.started_at) {
        (Some(interval), Some(started)) => started.elapsed() >= interval,
        _ => false,
    };
    if due {
        if let Some(mut writer) = output.writer.take() {
            if let Err(e) = writer.close() {
                error!(error = %e, path = ?output.path, "Failed to finalize recording file");
            }
        }
        let previous = output.path.clone();
        match open_writer(shared, previous.as_deref()) {
            Ok((writer, path)) => {
                info!(path = %path.display(), "Rotated recording file");
                output.writer = Some(writer);
                output.path = Some(path);
                output.started_at = Some(Instant::now());
                output.files_created += 1;
            }
            Err(e) => {
                error!(error = %e, "Failed to rotate recording file");
                output.started_at = None;
                return WriteOutcome::RotationFailed;
            }
        }
    }

    let (width, height) = (shared.geometry.width, shared.geometry.height);
    let resized = match ops::resize(&frame.image, width, height) {
        Ok(image) => image,
        Err(e) => {
            error!(sequence = frame.sequence, error = %e, "Error resizing frame");
            output.failed += 1;
            return WriteOutcome::Failed;
        }
    };

    let Some(writer) = output.writer.as_mut() else {
        return WriteOutcome::Dropped;
    };
    match writer.write(&resized) {
        Ok(()) => {
            output.written += 1;
            output.last_written = Some(frame.sequence);
            WriteOutcome::Written
        }
        Err(e) => {
            error!(sequence = frame.sequence, error = %e, "Error writing frame");
            output.failed += 1;
            WriteOutcome::Failed
        }
    }
}

fn write_loop(shared: Arc<Shared>) {
    loop {
        let frame = {
            let mut intake = shared.intake.lock();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    debug!("Write loop exited");
                    return;
                }
                if let Some(frame) = intake.queue.pop_front() {
                    intake.writing = true;
                    break frame;
                }
                shared.changed.wait_for(&mut intake, IDLE_WAIT);
            }
        };

        let outcome = write_one(&shared, &frame);

        let mut intake = shared.intake.lock();
        intake.writing = false;
        match outcome {
            WriteOutcome::Written | WriteOutcome::Failed => {}
            WriteOutcome::Dropped => intake.dropped += 1,
            WriteOutcome::RotationFailed => {
                intake.dropped += 1;
                intake.recording = false;
            }
        }
        shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupMethod, DeduplicationConfig};
    use crate::frame::FrameImage;
    use crate::media::raw::{RawCapture, RawWriterBackend};
    use crate::media::{MockWriterBackend, VideoCapture};
    use serde_json::json;
    use std::sync::mpsc;

    fn create_test_config(folder: &Path) -> RecordingConfig {
        RecordingConfig {
            output_folder: folder.join("%Y-%m-%d").display().to_string(),
            video_format: "vraw".to_string(),
            fourcc_codec: "raw".to_string(),
            duration_secs: None,
            enable_deduplication: false,
            drain_timeout_ms: 2000,
            ..RecordingConfig::default()
        }
    }

    fn geometry() -> VideoGeometry {
        VideoGeometry {
            width: 4,
            height: 4,
            fps: 30.0,
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(sequence, FrameImage::filled(4, 4, 3, sequence as u8).unwrap())
    }

    fn frames(range: std::ops::Range<u64>) -> Vec<Frame> {
        range.map(frame).collect()
    }

    fn read_back(path: &Path) -> Vec<u8> {
        let mut capture = RawCapture::open(path).unwrap();
        let mut values = Vec::new();
        while let Some(image) = capture.read().unwrap() {
            values.push(image.as_slice()[0]);
        }
        values
    }

    fn assert_accounting(stats: &RecordingStats) {
        assert_eq!(
            stats.total_frames_received,
            stats.total_frames_written
                + stats.total_frames_dropped
                + stats.total_frames_deduplicated
                + stats.total_frames_failed
                + stats.write_queue_size as u64
        );
    }

    /// Writer that records the first byte of each frame.
    struct MemoryWriter {
        frames: Arc<Mutex<Vec<u8>>>,
        fail: bool,
        gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
    }

    impl VideoWriter for MemoryWriter {
        fn write(&mut self, image: &FrameImage) -> Result<(), MediaError> {
            if let Some((entered, release)) = &self.gate {
                let _ = entered.send(());
                let _ = release.recv_timeout(Duration::from_secs(5));
            }
            if self.fail {
                return Err(MediaError::WriteFailed("disk full".to_string()));
            }
            self.frames.lock().push(image.as_slice()[0]);
            Ok(())
        }

        fn close(&mut self) -> Result<(), MediaError> {
            Ok(())
        }
    }

    #[test]
    fn test_not_recording_ignores_frames() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(RawWriterBackend)).unwrap();

        assert_eq!(sink.write_frames(&frames(0..3)), 0);
        assert_eq!(sink.stats().total_frames_received, 0);
        assert!(sink.current_filename().is_none());
    }

    #[test]
    fn test_records_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(RawWriterBackend)).unwrap();

        let path = sink.start_recording().unwrap();
        assert!(sink.is_recording());
        assert_eq!(sink.current_filename(), Some(path.clone()));
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("_c.vraw"));
        assert_eq!(sink.start_recording().unwrap(), path);

        assert_eq!(sink.write_frames(&frames(0..5)), 5);
        sink.stop_recording();
        sink.stop_recording();

        let stats = sink.stats();
        assert!(!stats.is_recording);
        assert_eq!(stats.total_frames_written, 5);
        assert_eq!(stats.last_written_frame_counter, Some(4));
        assert_eq!(stats.files_created, 1);
        assert_accounting(&stats);
        assert_eq!(read_back(&path), vec![0, 1, 2, 3, 4]);
        sink.stop();
    }

    #[test]
    fn test_already_received_frames_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(RawWriterBackend)).unwrap();
        let path = sink.start_recording().unwrap();

        assert_eq!(sink.write_frames(&frames(0..3)), 3);
        assert_eq!(sink.write_frames(&frames(1..4)), 1);
        assert_eq!(sink.write_frames(&frames(0..4)), 0);
        sink.stop_recording();

        let stats = sink.stats();
        assert_eq!(stats.total_frames_received, 4);
        assert_eq!(stats.total_frames_written, 4);
        assert_eq!(read_back(&path), vec![0, 1, 2, 3]);
        sink.stop();
    }

    #[test]
    fn test_duplicates_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            enable_deduplication: true,
            deduplication: DeduplicationConfig {
                method: DedupMethod::Hash,
                ..DeduplicationConfig::default()
            },
            ..create_test_config(dir.path())
        };
        let sink = RecordingSink::new(config, geometry(), Arc::new(RawWriterBackend)).unwrap();
        let path = sink.start_recording().unwrap();

        let image = FrameImage::filled(4, 4, 3, 42).unwrap();
        let batch: Vec<Frame> = (0..4).map(|seq| Frame::new(seq, image.clone())).collect();
        assert_eq!(sink.write_frames(&batch), 1);
        sink.stop_recording();

        let stats = sink.stats();
        assert_eq!(stats.total_frames_received, 4);
        assert_eq!(stats.total_frames_deduplicated, 3);
        assert_eq!(stats.total_frames_written, 1);
        assert_eq!(stats.deduplication.unwrap().duplicate_count, 3);
        assert_accounting(&stats);
        assert_eq!(read_back(&path).len(), 1);

        sink.update_dedup_config(&json!({ "history_size": 2 })).unwrap();
        assert!(sink.update_dedup_config(&json!({ "threshold": 3.0 })).is_err());
        sink.stop();
    }

    #[test]
    fn test_dedup_config_without_deduplicator() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(RawWriterBackend)).unwrap();
        assert!(matches!(
            sink.update_dedup_config(&json!({ "history_size": 2 })),
            Err(RecordingError::DeduplicationDisabled)
        ));
    }

    #[test]
    fn test_frames_are_resized_to_output_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(RawWriterBackend)).unwrap();
        let path = sink.start_recording().unwrap();

        let large = Frame::new(0, FrameImage::filled(8, 6, 3, 7).unwrap());
        sink.write_frames(&[large]);
        sink.stop_recording();

        let mut capture = RawCapture::open(&path).unwrap();
        let image = capture.read().unwrap().unwrap();
        assert_eq!((image.width(), image.height()), (4, 4));
        assert_eq!(image.as_slice()[0], 7);
        sink.stop();
    }

    #[test]
    fn test_rotation_keeps_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            duration_secs: Some(0.05),
            ..create_test_config(dir.path())
        };
        let sink = RecordingSink::new(config, geometry(), Arc::new(RawWriterBackend)).unwrap();
        let first = sink.start_recording().unwrap();

        sink.write_frames(&frames(0..3));
        std::thread::sleep(Duration::from_millis(120));
        sink.write_frames(&frames(3..6));
        std::thread::sleep(Duration::from_millis(120));
        sink.write_frames(&frames(6..9));
        sink.stop_recording();

        let stats = sink.stats();
        assert!(stats.files_created >= 2);
        assert_eq!(stats.total_frames_written, 9);
        assert_accounting(&stats);

        let folder = first.parent().unwrap();
        let mut files: Vec<PathBuf> = std::fs::read_dir(folder)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        files.sort_by_key(|path| std::fs::metadata(path).unwrap().modified().unwrap());
        assert_eq!(files.len() as u64, stats.files_created);

        let mut all = Vec::new();
        for file in &files {
            let values = read_back(file);
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            all.extend(values);
        }
        all.sort_unstable();
        assert_eq!(all, (0..9).collect::<Vec<u8>>());
        sink.stop();
    }

    #[test]
    fn test_full_queue_drops_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            max_write_queue_size: 2,
            ..create_test_config(dir.path())
        };

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut gate = Some((entered_tx, release_rx));
        let mut backend = MockWriterBackend::new();
        {
            let written = written.clone();
            backend.expect_open().returning(move |_, _| {
                Ok(Box::new(MemoryWriter {
                    frames: written.clone(),
                    fail: false,
                    gate: gate.take(),
                }))
            });
        }

        let sink = RecordingSink::new(config, geometry(), Arc::new(backend)).unwrap();
        sink.start_recording().unwrap();

        assert_eq!(sink.write_frames(&frames(0..1)), 1);
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sink.write_frames(&frames(1..5)), 2);

        let stats = sink.stats();
        assert_eq!(stats.total_frames_dropped, 2);
        assert_eq!(stats.write_queue_size, 2);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        sink.stop_recording();

        let stats = sink.stats();
        assert_eq!(stats.total_frames_written, 3);
        assert_accounting(&stats);
        assert_eq!(*written.lock(), vec![0, 1, 2]);
        sink.stop();
    }

    #[test]
    fn test_writer_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MockWriterBackend::new();
        backend.expect_open().returning(|path, _| {
            Err(MediaError::WriterOpenFailed {
                path: path.to_path_buf(),
                message: "encoder unavailable".to_string(),
            })
        });

        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(backend)).unwrap();
        assert!(matches!(
            sink.start_recording(),
            Err(RecordingError::Writer(MediaError::WriterOpenFailed { .. }))
        ));
        assert!(!sink.is_recording());
        assert_eq!(sink.write_frames(&frames(0..2)), 0);
    }

    #[test]
    fn test_write_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MockWriterBackend::new();
        backend.expect_open().returning(|_, _| {
            Ok(Box::new(MemoryWriter {
                frames: Arc::new(Mutex::new(Vec::new())),
                fail: true,
                gate: None,
            }))
        });

        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(backend)).unwrap();
        sink.start_recording().unwrap();
        sink.write_frames(&frames(0..3));
        sink.stop_recording();

        let stats = sink.stats();
        assert_eq!(stats.total_frames_failed, 3);
        assert_eq!(stats.total_frames_written, 0);
        assert_accounting(&stats);
        sink.stop();
    }

    #[test]
    fn test_failed_rotation_stops_recording() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            duration_secs: Some(0.05),
            ..create_test_config(dir.path())
        };

        let mut opens = 0;
        let mut backend = MockWriterBackend::new();
        backend.expect_open().returning(move |path, _| {
            opens += 1;
            if opens == 1 {
                Ok(Box::new(MemoryWriter {
                    frames: Arc::new(Mutex::new(Vec::new())),
                    fail: false,
                    gate: None,
                }))
            } else {
                Err(MediaError::WriterOpenFailed {
                    path: path.to_path_buf(),
                    message: "disk gone".to_string(),
                })
            }
        });

        let sink = RecordingSink::new(config, geometry(), Arc::new(backend)).unwrap();
        sink.start_recording().unwrap();
        sink.write_frames(&frames(0..2));
        std::thread::sleep(Duration::from_millis(120));
        sink.write_frames(&frames(2..4));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.is_recording() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!sink.is_recording());

        std::thread::sleep(Duration::from_millis(50));
        let stats = sink.stats();
        assert_eq!(stats.total_frames_written, 2);
        assert_eq!(stats.write_queue_size, 0);
        assert_accounting(&stats);
        sink.stop();
    }

    #[test]
    fn test_reset_stats() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new(create_test_config(dir.path()), geometry(), Arc::new(RawWriterBackend)).unwrap();
        sink.start_recording().unwrap();
        sink.write_frames(&frames(0..3));
        sink.stop_recording();

        sink.reset_stats();
        let stats = sink.stats();
        assert_eq!(stats.total_frames_received, 0);
        assert_eq!(stats.total_frames_written, 0);
        assert_eq!(stats.files_created, 0);
        sink.stop();
    }

    #[test]
    fn test_invalid_template_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            output_folder: "./rec/%Q".to_string(),
            ..create_test_config(dir.path())
        };
        assert!(matches!(
            RecordingSink::new(config, geometry(), Arc::new(RawWriterBackend)),
            Err(RecordingError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_unusable_rotation_duration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for duration in [-1.0, 0.0, f64::INFINITY, f64::NAN] {
            let config = RecordingConfig {
                duration_secs: Some(duration),
                ..create_test_config(dir.path())
            };
            assert!(matches!(
                RecordingSink::new(config, geometry(), Arc::new(RawWriterBackend)),
                Err(RecordingError::InvalidDuration(_))
            ));
        }
    }

    #[test]
    fn test_same_second_names_get_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = next_file_path(dir.path(), "c", "mp4", None);
        std::fs::write(&first, b"").unwrap();
        let second = next_file_path(dir.path(), "c", "mp4", Some(&first));
        assert_ne!(first, second);
        assert!(!second.exists());
    }
}
