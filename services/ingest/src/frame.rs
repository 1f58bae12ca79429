//! Frames and the bounded buffers that carry them between threads.
//!
//! A [`Frame`] is immutable once produced: the pixel payload lives in a
//! reference-counted [`Bytes`] buffer, so handing a frame to several consumers
//! clones a pointer, never the pixels.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised when constructing frames or feeding the frame buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame shape {width}x{height}x{channels}")]
    InvalidShape { width: u32, height: u32, channels: u8 },

    #[error("Payload length {actual} does not match {width}x{height}x{channels} ({expected} bytes)")]
    PayloadLength {
        width: u32,
        height: u32,
        channels: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Frame {sequence} is not newer than buffered frame {newest}")]
    NonIncreasing { sequence: u64, newest: u64 },
}

/// Decoded pixels: tightly packed 8-bit samples, row-major, interleaved
/// channels (RGB order for three channels).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    width: u32,
    height: u32,
    channels: u8,
    data: Bytes,
}

impl FrameImage {
    /// Wrap a payload, checking that it matches the declared shape.
    pub fn new(
        width: u32,
        height: u32,
        channels: u8,
        data: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(FrameError::InvalidShape {
                width,
                height,
                channels,
            });
        }

        let data = data.into();
        let expected = Self::payload_len(width, height, channels);
        if data.len() != expected {
            return Err(FrameError::PayloadLength {
                width,
                height,
                channels,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// An image where every sample has the same value.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Result<Self, FrameError> {
        let len = Self::payload_len(width, height, channels);
        Self::new(width, height, channels, vec![value; len])
    }

    /// Number of bytes a payload of this shape occupies.
    pub fn payload_len(width: u32, height: u32, channels: u8) -> usize {
        width as usize * height as usize * channels as usize
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Whether two images have identical width, height and channel count.
    pub fn same_shape(&self, other: &FrameImage) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }
}

/// One captured image tagged with its producer sequence number.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Strictly increasing per producer
    pub sequence: u64,

    /// Pixel payload
    pub image: FrameImage,

    /// Monotonic capture time
    pub captured_at: Instant,
}

impl Frame {
    /// Create a frame stamped with the current monotonic time.
    pub fn new(sequence: u64, image: FrameImage) -> Self {
        Self {
            sequence,
            image,
            captured_at: Instant::now(),
        }
    }
}

/// Which producer a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOrigin {
    LiveStream,
    Playback,
}

/// Per-frame metadata handed to processing algorithms alongside the pixels.
#[derive(Debug, Clone, Serialize)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub origin: FrameOrigin,

    /// Position within the stored file (playback only)
    pub position: Option<u64>,

    /// Playback speed multiplier at delivery time (playback only)
    pub playback_speed: Option<f64>,

    #[serde(skip)]
    pub captured_at: Instant,
}

impl FrameMetadata {
    /// Metadata for a frame pulled from a live source.
    pub fn live(frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence,
            origin: FrameOrigin::LiveStream,
            position: None,
            playback_speed: None,
            captured_at: frame.captured_at,
        }
    }

    /// Metadata for a frame delivered by playback.
    pub fn playback(frame: &Frame, position: u64, speed: f64) -> Self {
        Self {
            sequence: frame.sequence,
            origin: FrameOrigin::Playback,
            position: Some(position),
            playback_speed: Some(speed),
            captured_at: frame.captured_at,
        }
    }
}

/// Fixed-capacity ring of frames ordered by sequence number.
///
/// When full, pushing evicts the oldest frame. Pushing a frame whose sequence
/// number is not greater than the newest buffered one is rejected.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame, returning the evicted frame if the buffer was full.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>, FrameError> {
        if let Some(newest) = self.newest_sequence() {
            if frame.sequence <= newest {
                return Err(FrameError::NonIncreasing {
                    sequence: frame.sequence,
                    newest,
                });
            }
        }

        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        Ok(evicted)
    }

    /// The most recently pushed frame.
    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// Clones of all frames newer than `after`, oldest first.
    ///
    /// `None` returns every buffered frame.
    pub fn since(&self, after: Option<u64>) -> Vec<Frame> {
        let start = match after {
            Some(seq) => self.frames.partition_point(|f| f.sequence <= seq),
            None => 0,
        };
        self.frames.range(start..).cloned().collect()
    }

    pub fn newest_sequence(&self) -> Option<u64> {
        self.frames.back().map(|f| f.sequence)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// A [`FrameBuffer`] behind a mutex, with a condition variable that wakes
/// consumers when frames arrive or the producer shuts down.
#[derive(Debug)]
pub struct SharedFrameBuffer {
    buffer: Mutex<FrameBuffer>,
    available: Condvar,
    closed: AtomicBool,
}

impl SharedFrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(FrameBuffer::new(capacity)),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a frame and wake every waiting consumer.
    pub fn push(&self, frame: Frame) -> Result<Option<Frame>, FrameError> {
        let evicted = self.buffer.lock().push(frame)?;
        self.available.notify_all();
        Ok(evicted)
    }

    /// Snapshot of the newest frame, without blocking on data.
    pub fn latest(&self) -> Option<Frame> {
        self.buffer.lock().latest().cloned()
    }

    /// Frames newer than `after`.
    ///
    /// If the buffer is empty, waits up to `timeout` for a frame (or for the
    /// buffer to be closed) and then returns whatever is available.
    pub fn frames_since(&self, after: Option<u64>, timeout: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.buffer.lock();
        while guard.is_empty() && !self.closed.load(Ordering::SeqCst) {
            if self.available.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        guard.since(after)
    }

    /// Block until a frame newer than `after` is buffered, the buffer is
    /// closed, or `timeout` passes. Returns whether a newer frame is present.
    pub fn wait_for_newer(&self, after: Option<u64>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut newer = false;
        self.wait_until(deadline, |buffer| {
            newer = buffer.newest_sequence().is_some_and(|newest| Some(newest) > after);
            newer || self.closed.load(Ordering::SeqCst)
        });
        newer
    }

    /// Block until `ready` holds for the buffer or `deadline` passes.
    ///
    /// `ready` is re-evaluated on every wake-up, so producers that flip
    /// external flags must call [`SharedFrameBuffer::notify_all`] afterwards.
    pub fn wait_until<F>(&self, deadline: Instant, mut ready: F) -> bool
    where
        F: FnMut(&FrameBuffer) -> bool,
    {
        let mut guard = self.buffer.lock();
        loop {
            if ready(&guard) {
                return true;
            }
            if self.available.wait_until(&mut guard, deadline).timed_out() {
                return ready(&guard);
            }
        }
    }

    /// Wake all waiters without adding data.
    pub fn notify_all(&self) {
        let _guard = self.buffer.lock();
        self.available.notify_all();
    }

    /// Mark the buffer closed and release every blocked consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify_all();
    }

    /// Accept waiting consumers again after a restart.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}
