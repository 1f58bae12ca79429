//! Plugin interface for per-frame processing stages.

use crate::frame::{Frame, FrameMetadata};
use serde_json::{Map, Value};
use thiserror::Error;

/// Output of one algorithm for one frame.
pub type AlgorithmOutput = Map<String, Value>;

/// Errors an algorithm may raise.
#[derive(Debug, Error)]
pub enum AlgorithmError {
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A processing stage that can be composed into a
/// [`FrameProcessor`](crate::frame_processor::FrameProcessor).
///
/// Implementations run on the processor's worker thread, one frame at a time.
pub trait Algorithm: Send {
    /// Unique name used as the key in processing results.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    fn enable(&mut self);

    fn disable(&mut self);

    /// Process one frame and return a JSON-like result map.
    fn process(
        &mut self,
        frame: &Frame,
        metadata: &FrameMetadata,
    ) -> Result<AlgorithmOutput, AlgorithmError>;

    /// Apply a partial configuration update.
    fn update_config(&mut self, _patch: &Value) -> Result<(), AlgorithmError> {
        Ok(())
    }

    /// Current configuration as JSON.
    fn config(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Release resources. Called when the algorithm is removed or the
    /// processor stops.
    fn cleanup(&mut self) {}
}
