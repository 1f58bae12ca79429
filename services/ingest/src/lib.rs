//! Concurrent video ingest pipeline.
//!
//! Frames are captured from a live source (or replayed from a stored file),
//! held in a bounded shared buffer, and consumed independently by a recorder
//! and a processing engine.
//!
//! # Architecture
//!
//! ```text
//!                                    +--> RecordingSink --> rotating files
//! FrameSource  --+                   |      (dedup, write thread)
//!                +--> FrameBuffer ---+
//! PlaybackSource-+    (ring, cursors)|
//!                                    +--> FrameProcessor --> results/callback
//!                                           (algorithms, processing thread)
//! ```
//!
//! Every producer and consumer owns one thread. Consumers pull with their own
//! sequence cursor through [`FrameFeed::frames_since`], so a slow consumer
//! never stalls the producer or the other consumers.

pub mod algorithm;
pub mod config;
pub mod dedup;
pub mod feed;
pub mod frame;
pub mod frame_processor;
pub mod frame_source;
pub mod media;
pub mod playback;
pub mod recorder;
pub mod worker;

pub use algorithm::{Algorithm, AlgorithmError, AlgorithmOutput};
pub use config::{AppConfig, ConfigValidationError};
pub use dedup::{DedupStats, FrameDeduplicator};
pub use feed::{FrameFeed, SourceError};
pub use frame::{Frame, FrameBuffer, FrameImage, FrameMetadata, SharedFrameBuffer};
pub use frame_processor::{FrameProcessor, ProcessingResult, ProcessorStats};
pub use frame_source::{FrameSource, SourceStats};
pub use playback::{PlaybackInfo, PlaybackSource};
pub use recorder::{RecordingSink, RecordingStats, VideoGeometry};
