//! Video ingest service.
//!
//! Captures a live video source, records it to rotating files and optionally
//! runs frame processing algorithms. A stored recording can be replayed
//! through the processing engine instead of a live source.
//!
//! # Architecture
//!
//! ```text
//! live:      FrameSource -> pump thread -> RecordingSink
//!                                      \-> FrameProcessor
//! playback:  PlaybackSource -> frame callback -> FrameProcessor
//! batch:     playback over every recording under a directory, one at a time
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. A configuration file (`--config`, or `config/default.*` when present)
//! 2. Environment variables (prefixed with `VIDEOAPI_`, sections split by `__`)
//! 3. Command line flags
//!
//! See `config.rs` for detailed configuration options.

use clap::Parser;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use videoapi_ingest::config::{self, AppConfig};
use videoapi_ingest::dedup::{self, FrameDeduplicator};
use videoapi_ingest::frame_processor::ProcessingError;
use videoapi_ingest::frame_source::redact_address;
use videoapi_ingest::media;
use videoapi_ingest::{
    Algorithm, FrameFeed, FrameMetadata, FrameProcessor, FrameSource, PlaybackSource,
    RecordingSink, VideoGeometry,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const PUMP_WAIT: Duration = Duration::from_millis(200);
const RECORDING_EXTENSIONS: [&str; 5] = ["vraw", "mp4", "avi", "mov", "mkv"];

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "videoapi", version, about = "Video capture, recording and processing")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera credentials file
    #[arg(long)]
    creds: Option<PathBuf>,

    /// Replay a stored recording instead of the live source
    #[arg(long, value_name = "FILE", conflicts_with = "batch")]
    playback: Option<PathBuf>,

    /// Replay every recording found under a directory, one after another
    #[arg(long, value_name = "DIR")]
    batch: Option<PathBuf>,

    /// Loop playback at end of file
    #[arg(long = "loop")]
    loop_playback: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Disable recording
    #[arg(long)]
    no_record: bool,

    /// Enable frame processing
    #[arg(long)]
    process: bool,
}

impl Cli {
    /// Apply command line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(creds) = &self.creds {
            config.credentials_file = Some(creds.clone());
        }
        if self.loop_playback {
            config.playback.loop_playback = true;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.no_record {
            config.recording.enabled = false;
        }
        if self.process {
            config.processing.enable_processing = true;
        }
    }

    fn mode(&self) -> &'static str {
        match (&self.playback, &self.batch) {
            (Some(_), _) => "playback",
            (None, Some(_)) => "batch",
            (None, None) => "live",
        }
    }
}

/// How a playback run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackExit {
    Finished,
    Interrupted,
}

/// Outcome of a batch playback run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchReport {
    played: usize,
    failed: usize,
    interrupted: bool,
}

/// Application state and shared resources.
struct AppState {
    config: AppConfig,
    running: Arc<AtomicBool>,
    source: Option<Arc<FrameSource>>,
    playback: Option<Arc<PlaybackSource>>,
    recorder: Option<Arc<RecordingSink>>,
    processor: Option<Arc<FrameProcessor>>,
}

impl AppState {
    fn new(config: AppConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            source: None,
            playback: None,
            recorder: None,
            processor: None,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    cli.apply(&mut config);

    let _log_guard = init_logging(&config.logging)?;

    info!(
        service = "videoapi-ingest",
        version = env!("CARGO_PKG_VERSION"),
        mode = cli.mode(),
        "Starting video ingest service"
    );

    match cli.mode() {
        "live" => config.validate()?,
        _ => config.validate_playback()?,
    }

    let state = Arc::new(RwLock::new(AppState::new(config)));
    state.read().running.store(true, Ordering::SeqCst);

    let result = match (cli.playback, cli.batch) {
        (Some(path), _) => run_playback(state.clone(), path).await.map(|_| ()),
        (None, Some(dir)) => run_batch(state.clone(), &dir).await.map(|report| {
            info!(
                played = report.played,
                failed = report.failed,
                interrupted = report.interrupted,
                "Batch playback complete"
            );
        }),
        (None, None) => run_live(state.clone()).await,
    };

    match result {
        Ok(()) => {
            info!("Video ingest service completed successfully");
        }
        Err(e) => {
            error!(error = %e, "Video ingest service failed");
            return Err(e);
        }
    }

    Ok(())
}

/// Load configuration, falling back to the environment when no file is given.
fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load(Some(path))?,
        None => AppConfig::load(None).or_else(|e| {
            warn!(error = %e, "Failed to load config from files, trying environment");
            AppConfig::from_env()
        })?,
    };

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
///
/// The returned guard flushes the log file when dropped.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("videoapi_ingest={}", level).parse()?)
        .add_directive(format!("videoapi={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let location = config.include_location;
    let json = config.format == "json";

    let console_layer = config.enable_console.then(|| {
        let layer = fmt::layer().with_file(location).with_line_number(location);
        if json {
            layer.json().boxed()
        } else {
            layer.pretty().boxed()
        }
    });

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(location)
                .with_line_number(location);
            let layer = if json { layer.json().boxed() } else { layer.boxed() };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Open a log file for appending, creating missing parent folders.
fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Recordings under `dir`, searched recursively, in path order.
fn find_recordings(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(folder) = pending.pop() {
        for entry in std::fs::read_dir(&folder)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| RECORDING_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Build the processor and register the configured algorithms in order.
fn build_processor(config: &AppConfig) -> Result<FrameProcessor, ProcessingError> {
    let processor = FrameProcessor::new(config.processing.clone());

    for name in &config.processing.algorithms {
        let algorithm: Box<dyn Algorithm> = match name.as_str() {
            dedup::ALGORITHM_NAME => Box::new(FrameDeduplicator::new(
                config.recording.deduplication.clone(),
            )),
            other => return Err(ProcessingError::AlgorithmNotFound(other.to_string())),
        };
        processor.add_algorithm(algorithm)?;
    }

    processor.set_result_callback(|result| {
        let duplicate = result
            .algorithm_results
            .get(dedup::ALGORITHM_NAME)
            .and_then(|report| report.output.as_ref())
            .and_then(|output| output.get("is_duplicate"))
            .and_then(|value| value.as_bool());
        debug!(
            sequence = result.metadata.sequence,
            processing_time_us = result.processing_time_us,
            duplicate = ?duplicate,
            "Frame processed"
        );
    });

    Ok(processor)
}

/// Move frames from a feed to the consumers until the feed or the app stops.
///
/// Keeps its own cursor, so it never sees a frame twice.
fn pump_frames(
    feed: &dyn FrameFeed,
    recorder: Option<&RecordingSink>,
    processor: Option<&FrameProcessor>,
    running: &AtomicBool,
) -> u64 {
    let mut cursor = None;
    let mut pumped = 0;

    while running.load(Ordering::SeqCst) && feed.is_running() {
        if !feed.wait_for_frames_after(cursor, PUMP_WAIT) {
            continue;
        }
        let frames = feed.frames_since(cursor);
        let Some(last) = frames.last() else {
            continue;
        };
        cursor = Some(last.sequence);
        pumped += frames.len() as u64;

        if let Some(recorder) = recorder {
            recorder.write_frames(&frames);
        }
        if let Some(processor) = processor {
            for frame in frames {
                let metadata = FrameMetadata::live(&frame);
                processor.submit_frame(frame, metadata);
            }
        }
    }

    debug!(frames = pumped, "Frame pump exited");
    pumped
}

/// Run the live capture pipeline.
async fn run_live(state: Arc<RwLock<AppState>>) -> anyhow::Result<()> {
    let config = state.read().config.clone();
    let address = config.video_address()?;
    let (capture_backend, writer_backend) = media::default_backends();

    let source = Arc::new(FrameSource::new(
        address.clone(),
        config.video.clone(),
        capture_backend,
    ));

    let recorder = if config.recording.enabled {
        Some(Arc::new(RecordingSink::new(
            config.recording.clone(),
            VideoGeometry::from(&config.video),
            writer_backend,
        )?))
    } else {
        None
    };

    let processor = if config.processing.enable_processing {
        Some(Arc::new(build_processor(&config)?))
    } else {
        None
    };

    info!(address = %redact_address(&address), "Starting frame source...");
    tokio::task::spawn_blocking({
        let source = source.clone();
        move || source.start()
    })
    .await??;

    if let Some(recorder) = &recorder {
        let path = recorder.start_recording()?;
        info!(path = %path.display(), "Recording to file");
    }
    if let Some(processor) = &processor {
        processor.start()?;
    }

    {
        let mut state_guard = state.write();
        state_guard.source = Some(source.clone());
        state_guard.recorder = recorder.clone();
        state_guard.processor = processor.clone();
    }

    let running = state.read().running.clone();
    let mut pump = tokio::task::spawn_blocking({
        let source = source.clone();
        let recorder = recorder.clone();
        let processor = processor.clone();
        move || {
            pump_frames(
                &*source,
                recorder.as_deref(),
                processor.as_deref(),
                &running,
            )
        }
    });

    let monitor_handle = tokio::spawn({
        let state = state.clone();
        async move {
            run_stats_monitor(state, STATS_INTERVAL).await;
        }
    });

    let mut pump_done = false;
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
        _ = &mut pump => {
            pump_done = true;
            warn!(state = ?source.state(), "Frame source stopped unexpectedly");
        }
    }

    state.read().shutdown();
    monitor_handle.abort();

    tokio::task::spawn_blocking({
        let source = source.clone();
        move || source.stop()
    })
    .await?;
    if !pump_done {
        if let Err(e) = pump.await {
            error!(error = %e, "Frame pump task failed");
        }
    }

    tokio::task::spawn_blocking(move || {
        if let Some(recorder) = recorder {
            recorder.stop();
        }
        if let Some(processor) = processor {
            processor.stop();
        }
    })
    .await?;

    log_final_stats(&state.read());

    info!("Shutdown complete");
    Ok(())
}

/// Replay every recording under `dir` once, in path order.
///
/// A file that fails to play is logged and skipped; Ctrl+C ends the batch.
async fn run_batch(state: Arc<RwLock<AppState>>, dir: &Path) -> anyhow::Result<BatchReport> {
    let recordings = find_recordings(dir)
        .map_err(|e| anyhow::anyhow!("Failed to scan {}: {}", dir.display(), e))?;
    info!(dir = %dir.display(), files = recordings.len(), "Found recordings");

    state.write().config.playback.loop_playback = false;

    let mut report = BatchReport::default();
    for path in recordings {
        state.read().running.store(true, Ordering::SeqCst);
        info!(path = %path.display(), "Processing recording");

        match run_playback(state.clone(), path.clone()).await {
            Ok(PlaybackExit::Finished) => report.played += 1,
            Ok(PlaybackExit::Interrupted) => {
                report.played += 1;
                report.interrupted = true;
                warn!("Batch interrupted");
                break;
            }
            Err(e) => {
                report.failed += 1;
                error!(path = %path.display(), error = %e, "Failed to process recording");
            }
        }
    }

    state.read().shutdown();
    Ok(report)
}

/// Replay a stored recording through the processor.
async fn run_playback(state: Arc<RwLock<AppState>>, path: PathBuf) -> anyhow::Result<PlaybackExit> {
    let config = state.read().config.clone();
    let (capture_backend, _) = media::default_backends();

    let playback = Arc::new(PlaybackSource::new(
        &path,
        config.playback.clone(),
        capture_backend,
    )?);

    let processor = if config.processing.enable_processing {
        Some(Arc::new(build_processor(&config)?))
    } else {
        None
    };

    if let Some(processor) = &processor {
        processor.start()?;
        let processor = processor.clone();
        playback.set_frame_callback(move |frame, metadata| {
            processor.submit_frame(frame.clone(), metadata.clone());
        });
    }

    let (end_tx, end_rx) = oneshot::channel();
    let end_tx = Mutex::new(Some(end_tx));
    playback.set_end_callback(move || {
        if let Some(tx) = end_tx.lock().take() {
            let _ = tx.send(());
        }
    });

    {
        let mut state_guard = state.write();
        state_guard.playback = Some(playback.clone());
        state_guard.processor = processor.clone();
    }

    let info = playback.stream_info();
    info!(
        path = %path.display(),
        total_frames = ?info.total_frames,
        duration_secs = ?info.duration_secs(),
        fps = info.fps,
        looping = config.playback.loop_playback,
        "Starting playback..."
    );
    playback.start()?;

    let monitor_handle = tokio::spawn({
        let state = state.clone();
        async move {
            run_stats_monitor(state, STATS_INTERVAL).await;
        }
    });

    let exit = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received shutdown signal, initiating graceful shutdown...");
            PlaybackExit::Interrupted
        }
        _ = end_rx => {
            info!("Playback finished");
            PlaybackExit::Finished
        }
    };

    state.read().shutdown();
    monitor_handle.abort();

    tokio::task::spawn_blocking(move || {
        playback.stop();
        if let Some(processor) = processor {
            processor.stop();
        }
    })
    .await?;

    log_final_stats(&state.read());

    info!("Shutdown complete");
    Ok(exit)
}

/// Log component statistics periodically.
async fn run_stats_monitor(state: Arc<RwLock<AppState>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    while state.read().is_running() {
        ticker.tick().await;
        log_stats(&state.read());
    }
}

fn log_stats(state: &AppState) {
    if let Some(source) = &state.source {
        let stats = source.stats();
        info!(
            frames = stats.frame_counter,
            buffer_size = stats.buffer_size,
            reconnects = stats.reconnect_count,
            state = ?stats.state,
            "Frame source stats"
        );
    }

    if let Some(playback) = &state.playback {
        let info = playback.playback_info();
        info!(
            current_frame = info.current_frame,
            total_frames = ?info.total_frames,
            progress = ?info.progress.map(|p| format!("{:.1}%", p * 100.0)),
            speed = info.playback_speed,
            "Playback stats"
        );
    }

    if let Some(recorder) = &state.recorder {
        let stats = recorder.stats();
        info!(
            file = ?stats.current_filename,
            frames_written = stats.total_frames_written,
            frames_dropped = stats.total_frames_dropped,
            frames_deduplicated = stats.total_frames_deduplicated,
            queue_size = stats.write_queue_size,
            "Recording stats"
        );
    }

    if let Some(processor) = &state.processor {
        let stats = processor.stats();
        info!(
            frames_processed = stats.processed_frames,
            frames_dropped = stats.dropped_frames,
            queue_size = stats.queue_size,
            avg_processing_ms = format!("{:.2}", stats.avg_processing_time * 1000.0),
            "Processor stats"
        );
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(state: &AppState) {
    info!("=== Final Statistics ===");

    if let Some(source) = &state.source {
        log_json("Frame source final stats", &source.stats());
    }
    if let Some(playback) = &state.playback {
        log_json("Playback final stats", &playback.playback_info());
    }
    if let Some(recorder) = &state.recorder {
        log_json("Recording final stats", &recorder.stats());
    }
    if let Some(processor) = &state.processor {
        log_json("Processor final stats", &processor.stats());
    }
}

fn log_json<T: serde::Serialize>(message: &str, stats: &T) {
    match serde_json::to_string(stats) {
        Ok(json) => info!(stats = %json, "{}", message),
        Err(e) => warn!(error = %e, "Failed to serialize {}", message),
    }
}
