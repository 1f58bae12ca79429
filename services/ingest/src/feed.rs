//! The frame delivery contract shared by live and playback producers.

use crate::frame::Frame;
use crate::media::MediaError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when starting a producer.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source produced no frame within {0:?}")]
    StartTimeout(Duration),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// A running producer of sequentially numbered frames.
///
/// Consumers keep their own cursor (the last sequence number they saw) and
/// poll with [`FrameFeed::frames_since`]; producers never wait for them.
pub trait FrameFeed: Send + Sync {
    /// Begin producing. A no-op when already running.
    fn start(&self) -> Result<(), SourceError>;

    /// Stop producing and release resources. Idempotent.
    fn stop(&self);

    /// The newest buffered frame, without blocking.
    fn latest_frame(&self) -> Option<Frame>;

    /// Buffered frames with sequence greater than `after`, oldest first.
    /// Blocks for a bounded time when nothing is buffered.
    fn frames_since(&self, after: Option<u64>) -> Vec<Frame>;

    /// Block until a frame newer than `after` is buffered, the feed shuts
    /// down, or `timeout` passes. Returns whether a newer frame is available.
    fn wait_for_frames_after(&self, after: Option<u64>, timeout: Duration) -> bool;

    fn is_running(&self) -> bool;
}
