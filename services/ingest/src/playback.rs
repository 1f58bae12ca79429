//! Paced playback of a stored recording.
//!
//! [`PlaybackSource`] reads a finite file on its own thread and delivers frames
//! at the file's frame rate scaled by a speed multiplier. Frames go to an
//! optional callback and to a [`SharedFrameBuffer`], so consumers written
//! against [`FrameFeed`] work unchanged on recorded data.

use crate::config::{ConfigValidationError, PlaybackConfig};
use crate::feed::{FrameFeed, SourceError};
use crate::frame::{Frame, FrameImage, FrameMetadata, SharedFrameBuffer};
use crate::media::{CaptureBackend, MediaError, StreamInfo, VideoCapture};
use crate::worker::{panic_message, Worker};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const PAUSE_WAIT: Duration = Duration::from_millis(100);
const CAPTURE_RELEASE_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_FRAME_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that can occur while setting up playback.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: MediaError,
    },

    #[error("Invalid playback speed range [{min}, {max}]")]
    InvalidSpeedRange { min: f64, max: f64 },

    #[error(transparent)]
    Config(#[from] ConfigValidationError),
}

pub type FrameCallback = Arc<dyn Fn(&Frame, &FrameMetadata) + Send + Sync>;
pub type EndCallback = Arc<dyn Fn() + Send + Sync>;

/// Snapshot of the playback position.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackInfo {
    pub playing: bool,
    pub paused: bool,

    /// Index of the next frame to be read
    pub current_frame: u64,
    pub total_frames: Option<u64>,

    /// Seconds
    pub current_time: f64,
    pub total_time: Option<f64>,
    pub playback_speed: f64,

    /// Fraction of the file played, in `[0, 1]`
    pub progress: Option<f64>,
}

#[derive(Debug)]
struct PlayState {
    playing: bool,
    paused: bool,
    current_frame: u64,
    speed: f64,
    pending_seek: Option<u64>,
    end_reported: bool,
}

struct Shared {
    path: PathBuf,
    config: PlaybackConfig,
    info: StreamInfo,
    backend: Arc<dyn CaptureBackend>,
    buffer: SharedFrameBuffer,
    running: AtomicBool,
    next_sequence: AtomicU64,
    state: Mutex<PlayState>,
    wake: Condvar,
    capture: Mutex<Option<Box<dyn VideoCapture>>>,
    on_frame: RwLock<Option<FrameCallback>>,
    on_end: RwLock<Option<EndCallback>>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn fps(&self) -> f64 {
        if self.info.fps.is_finite() && self.info.fps > 0.0 {
            self.info.fps
        } else {
            self.config.default_fps
        }
    }

    fn interval(&self, speed: f64) -> Duration {
        Duration::try_from_secs_f64(1.0 / (self.fps() * speed))
            .map_or(MAX_FRAME_INTERVAL, |interval| interval.min(MAX_FRAME_INTERVAL))
    }

    fn clamp_position(&self, position: u64) -> u64 {
        match self.info.total_frames {
            Some(total) if total > 0 => position.min(total - 1),
            _ => position,
        }
    }
}

/// Plays a stored recording as a frame feed.
pub struct PlaybackSource {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl PlaybackSource {
    /// Open `path` for playback. The file stays open until [`FrameFeed::stop`].
    pub fn new(
        path: impl Into<PathBuf>,
        config: PlaybackConfig,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self, PlaybackError> {
        let path = path.into();
        if !(config.min_speed > 0.0 && config.min_speed <= config.max_speed) {
            return Err(PlaybackError::InvalidSpeedRange {
                min: config.min_speed,
                max: config.max_speed,
            });
        }
        config.validate()?;

        let capture = open_capture(backend.as_ref(), &path).map_err(|source| PlaybackError::Open {
            path: path.clone(),
            source,
        })?;
        let info = capture.info();

        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            total_frames = ?info.total_frames,
            "Playback source opened"
        );

        let speed = 1.0_f64.clamp(config.min_speed, config.max_speed);
        let buffer = SharedFrameBuffer::new(config.buffer_size);
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                config,
                info,
                backend,
                buffer,
                running: AtomicBool::new(false),
                next_sequence: AtomicU64::new(0),
                state: Mutex::new(PlayState {
                    playing: false,
                    paused: false,
                    current_frame: 0,
                    speed,
                    pending_seek: None,
                    end_reported: false,
                }),
                wake: Condvar::new(),
                capture: Mutex::new(Some(capture)),
                on_frame: RwLock::new(None),
                on_end: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.shared.info
    }

    /// Called on the playback thread for every delivered frame.
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(&Frame, &FrameMetadata) + Send + Sync + 'static,
    {
        *self.shared.on_frame.write() = Some(Arc::new(callback));
    }

    /// Called once when a non-looping playback reaches the end of the file.
    pub fn set_end_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_end.write() = Some(Arc::new(callback));
    }

    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        if state.playing && !state.paused {
            state.paused = true;
            info!(frame = state.current_frame, "Playback paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        if state.paused {
            state.paused = false;
            self.shared.wake.notify_all();
            info!(frame = state.current_frame, "Playback resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Jump to `frame`, clamped to the file. Returns the applied position.
    pub fn seek(&self, frame: u64) -> u64 {
        let target = self.shared.clamp_position(frame);
        let mut state = self.shared.state.lock();
        state.pending_seek = Some(target);
        state.current_frame = target;
        state.end_reported = false;
        self.shared.wake.notify_all();
        debug!(requested = frame, frame = target, "Seek requested");
        target
    }

    /// Jump to the frame shown at `seconds`. Returns the applied frame position.
    pub fn seek_time(&self, seconds: f64) -> u64 {
        let frame = (seconds.max(0.0) * self.shared.fps()).round();
        self.seek(frame as u64)
    }

    /// Change the speed multiplier, clamped to the configured range.
    pub fn set_speed(&self, speed: f64) -> f64 {
        let mut state = self.shared.state.lock();
        if !speed.is_finite() {
            warn!(speed, "Ignoring non-finite playback speed");
            return state.speed;
        }
        let applied = speed.clamp(self.shared.config.min_speed, self.shared.config.max_speed);
        if applied != speed {
            warn!(requested = speed, applied, "Playback speed clamped");
        }
        state.speed = applied;
        self.shared.wake.notify_all();
        applied
    }

    pub fn speed(&self) -> f64 {
        self.shared.state.lock().speed
    }

    pub fn playback_info(&self) -> PlaybackInfo {
        let state = self.shared.state.lock();
        let fps = self.shared.fps();
        let total = self.shared.info.total_frames;
        PlaybackInfo {
            playing: state.playing,
            paused: state.paused,
            current_frame: state.current_frame,
            total_frames: total,
            current_time: state.current_frame as f64 / fps,
            total_time: total.map(|t| t as f64 / fps),
            playback_speed: state.speed,
            progress: total
                .filter(|t| *t > 0)
                .map(|t| (state.current_frame as f64 / t as f64).min(1.0)),
        }
    }
}

impl FrameFeed for PlaybackSource {
    fn start(&self) -> Result<(), SourceError> {
        let mut worker = self.worker.lock();
        if self.shared.is_running() {
            warn!("Playback is already running");
            return Ok(());
        }
        if let Some(previous) = worker.take() {
            previous.join_timeout(self.shared.config.stop_timeout());
        }

        {
            let mut slot = self.shared.capture.lock();
            if slot.is_none() {
                *slot = Some(open_capture(self.shared.backend.as_ref(), &self.shared.path)?);
            }
        }

        {
            let mut state = self.shared.state.lock();
            let finished = self
                .shared
                .info
                .total_frames
                .is_some_and(|total| state.current_frame >= total);
            if finished {
                state.current_frame = 0;
                state.pending_seek = Some(0);
            }
            state.playing = true;
            state.paused = false;
            state.end_reported = false;
        }

        self.shared.buffer.reopen();
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        match Worker::spawn("playback", move || playback_loop(shared)) {
            Ok(spawned) => *worker = Some(spawned),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.state.lock().playing = false;
                return Err(SourceError::Spawn(e));
            }
        }

        info!(path = %self.shared.path.display(), "Playback started");
        Ok(())
    }

    fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        let worker = self.worker.lock().take();
        if !was_running && worker.is_none() {
            return;
        }

        info!("Stopping playback");
        {
            let mut state = self.shared.state.lock();
            state.playing = false;
            state.paused = false;
            self.shared.wake.notify_all();
        }
        self.shared.buffer.close();

        if let Some(worker) = worker {
            worker.join_timeout(self.shared.config.stop_timeout());
        }

        match self.shared.capture.try_lock_for(CAPTURE_RELEASE_TIMEOUT) {
            Some(mut slot) => drop(slot.take()),
            None => warn!("Capture handle busy, leaving it to the playback thread"),
        }
        info!("Playback stopped");
    }

    fn latest_frame(&self) -> Option<Frame> {
        self.shared.buffer.latest()
    }

    fn frames_since(&self, after: Option<u64>) -> Vec<Frame> {
        self.shared
            .buffer
            .frames_since(after, self.shared.config.frame_wait_timeout())
    }

    fn wait_for_frames_after(&self, after: Option<u64>, timeout: Duration) -> bool {
        self.shared.buffer.wait_for_newer(after, timeout)
    }

    fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

impl Drop for PlaybackSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_capture(backend: &dyn CaptureBackend, path: &Path) -> Result<Box<dyn VideoCapture>, MediaError> {
    backend.open(&path.to_string_lossy())
}

enum Step {
    Frame(FrameImage),
    End,
    Closed,
}

/// Wait out pacing and pauses. Returns `None` once playback is stopped.
fn next_tick(shared: &Shared, due: &mut Instant) -> Option<(Option<u64>, f64)> {
    let mut state = shared.state.lock();
    loop {
        if !shared.is_running() {
            return None;
        }
        if state.paused {
            shared.wake.wait_for(&mut state, PAUSE_WAIT);
            *due = Instant::now();
            continue;
        }
        if state.pending_seek.is_some() || Instant::now() >= *due {
            break;
        }
        let deadline = *due;
        shared.wake.wait_until(&mut state, deadline);
    }
    Some((state.pending_seek.take(), state.speed))
}

fn read_step(shared: &Shared, seek: Option<u64>, position: &mut u64) -> Step {
    let mut slot = shared.capture.lock();
    let Some(capture) = slot.as_mut() else {
        return Step::Closed;
    };

    if let Some(target) = seek {
        match capture.seek(target) {
            Ok(()) => *position = target,
            Err(e) => warn!(frame = target, error = %e, "Seek failed"),
        }
    }

    match capture.read() {
        Ok(Some(image)) => Step::Frame(image),
        Ok(None) => Step::End,
        Err(e) => {
            error!(error = %e, "Error reading playback frame");
            Step::End
        }
    }
}

fn rewind(shared: &Shared, position: &mut u64) -> bool {
    let rewound = match shared.capture.lock().as_mut() {
        Some(capture) => capture.seek(0),
        None => return false,
    };
    match rewound {
        Ok(()) => {
            *position = 0;
            let mut state = shared.state.lock();
            if state.pending_seek.is_none() {
                state.current_frame = 0;
            }
            debug!("Playback looped to start");
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to loop playback");
            false
        }
    }
}

fn deliver(shared: &Shared, image: FrameImage, position: u64, speed: f64) {
    let sequence = shared.next_sequence.fetch_add(1, Ordering::SeqCst);
    let frame = Frame::new(sequence, image);
    let metadata = FrameMetadata::playback(&frame, position, speed);

    if let Err(e) = shared.buffer.push(frame.clone()) {
        warn!(sequence, error = %e, "Dropping playback frame");
        return;
    }

    let callback = shared.on_frame.read().clone();
    if let Some(callback) = callback {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&frame, &metadata))) {
            error!(panic = %panic_message(payload.as_ref()), "Error in frame callback");
        }
    }
}

fn finish(shared: &Shared) {
    shared.running.store(false, Ordering::SeqCst);
    let first = {
        let mut state = shared.state.lock();
        state.playing = false;
        !std::mem::replace(&mut state.end_reported, true)
    };
    shared.buffer.notify_all();
    info!("Playback reached end of file");

    if !first {
        return;
    }
    let callback = shared.on_end.read().clone();
    if let Some(callback) = callback {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            error!(panic = %panic_message(payload.as_ref()), "Error in end callback");
        }
    }
}

fn playback_loop(shared: Arc<Shared>) {
    let mut position = shared.state.lock().current_frame;
    let mut due = Instant::now();
    let mut rewound_empty = false;

    while let Some((seek, speed)) = next_tick(&shared, &mut due) {
        let started = Instant::now();
        if seek.is_some() {
            rewound_empty = false;
        }

        match read_step(&shared, seek, &mut position) {
            Step::Frame(image) => {
                rewound_empty = false;
                deliver(&shared, image, position, speed);
                position += 1;
                {
                    let mut state = shared.state.lock();
                    if state.pending_seek.is_none() {
                        state.current_frame = position;
                    }
                }

                // Pace from the previous deadline; resync after falling behind.
                let interval = shared.interval(speed);
                due += interval;
                if due + interval < started {
                    due = Instant::now();
                }
            }
            Step::End if shared.config.loop_playback => {
                // A loop that yields nothing between two ends never will.
                if rewound_empty {
                    warn!("No frames read since loop restart, stopping playback");
                    finish(&shared);
                    break;
                }
                if !rewind(&shared, &mut position) {
                    finish(&shared);
                    break;
                }
                rewound_empty = true;
            }
            Step::End => {
                finish(&shared);
                break;
            }
            Step::Closed => break,
        }
    }

    debug!("Playback loop exited");
}
