//! Contracts for the video primitives the pipeline treats as black boxes.
//!
//! The pipeline never decodes, encodes or transforms pixels itself. It talks to
//! a [`CaptureBackend`] to open sources, a [`WriterBackend`] to open output
//! files, and the free functions in [`ops`] for resize, hashing and
//! similarity. Backends are selected by address or output format:
//!
//! - `stub://...` addresses use the synthetic camera ([`synthetic`])
//! - `*.vraw` paths use the uncompressed seekable container ([`raw`])
//! - everything else goes through GStreamer (feature: `gstreamer`)

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod ops;
pub mod raw;
pub mod synthetic;

use crate::frame::{FrameError, FrameImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by capture and writer backends.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to open source {address}: {message}")]
    OpenFailed { address: String, message: String },

    #[error("Failed to read frame: {0}")]
    ReadFailed(String),

    #[error("Failed to open writer for {path}: {message}")]
    WriterOpenFailed { path: PathBuf, message: String },

    #[error("Failed to write frame: {0}")]
    WriteFailed(String),

    #[error("Seek to frame {0} failed")]
    SeekFailed(u64),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Properties a source declares when it is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,

    /// Known only for finite sources
    pub total_frames: Option<u64>,
}

impl StreamInfo {
    /// Duration of a finite source in seconds.
    pub fn duration_secs(&self) -> Option<f64> {
        match self.total_frames {
            Some(total) if self.fps > 0.0 => Some(total as f64 / self.fps),
            _ => None,
        }
    }
}

/// An open capture handle. Dropping it releases the underlying device.
pub trait VideoCapture: Send {
    /// Properties declared by the source at open time.
    fn info(&self) -> StreamInfo;

    /// Read the next frame. `Ok(None)` signals end of stream.
    fn read(&mut self) -> Result<Option<FrameImage>, MediaError>;

    /// Reposition a finite source so the next read returns `position`.
    fn seek(&mut self, position: u64) -> Result<(), MediaError> {
        Err(MediaError::Unsupported(format!(
            "seek to {position} on a live source"
        )))
    }
}

/// Opens capture handles from opaque source addresses.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, address: &str) -> Result<Box<dyn VideoCapture>, MediaError>;
}

/// Output encoding parameters for a recording file.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,

    /// Four-character codec code (e.g. "avc1", "mp4v")
    pub codec: String,

    /// Container format / file extension (e.g. "mp4", "vraw")
    pub format: String,
}

/// An open output file. Frames must match the writer's declared resolution.
pub trait VideoWriter: Send {
    fn write(&mut self, image: &FrameImage) -> Result<(), MediaError>;

    /// Flush and finalize the file. Further writes are errors.
    fn close(&mut self) -> Result<(), MediaError>;
}

/// Opens writers for new output files.
#[cfg_attr(test, mockall::automock)]
pub trait WriterBackend: Send + Sync {
    fn open(&self, path: &Path, settings: &WriterSettings)
        -> Result<Box<dyn VideoWriter>, MediaError>;
}

/// Capture backend dispatching on the address form.
#[derive(Debug, Default, Clone)]
pub struct AutoCaptureBackend;

impl CaptureBackend for AutoCaptureBackend {
    fn open(&self, address: &str) -> Result<Box<dyn VideoCapture>, MediaError> {
        if address.starts_with(synthetic::SCHEME) {
            return synthetic::SyntheticBackend.open(address);
        }
        if raw::is_raw_path(address) {
            return raw::RawCaptureBackend.open(address);
        }

        #[cfg(feature = "gstreamer")]
        {
            gst::GstCaptureBackend::new()?.open(address)
        }
        #[cfg(not(feature = "gstreamer"))]
        {
            Err(MediaError::Unsupported(format!(
                "{address} requires the gstreamer feature"
            )))
        }
    }
}

/// Writer backend dispatching on the output format.
#[derive(Debug, Default, Clone)]
pub struct AutoWriterBackend;

impl WriterBackend for AutoWriterBackend {
    fn open(
        &self,
        path: &Path,
        settings: &WriterSettings,
    ) -> Result<Box<dyn VideoWriter>, MediaError> {
        if settings.format.eq_ignore_ascii_case(raw::EXTENSION) {
            return raw::RawWriterBackend.open(path, settings);
        }

        #[cfg(feature = "gstreamer")]
        {
            gst::GstWriterBackend::new()?.open(path, settings)
        }
        #[cfg(not(feature = "gstreamer"))]
        {
            Err(MediaError::Unsupported(format!(
                "{} output requires the gstreamer feature",
                settings.format
            )))
        }
    }
}

/// The default backend pair used by the binary.
pub fn default_backends() -> (Arc<dyn CaptureBackend>, Arc<dyn WriterBackend>) {
    (Arc::new(AutoCaptureBackend), Arc::new(AutoWriterBackend))
}
