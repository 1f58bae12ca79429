//! Duplicate frame detection.
//!
//! Two strategies, chosen by configuration:
//!
//! - **hash**: exact payload digests, compared against a short history
//! - **similarity**: normalized correlation of grayscale images against the
//!   last few unique frames, duplicate when any score reaches the threshold
//!
//! Both histories are strict FIFOs of fixed capacity. Only unique frames
//! enter the similarity history; the hash history records every digest it
//! has not seen.

use crate::algorithm::{Algorithm, AlgorithmError, AlgorithmOutput};
use crate::config::{DedupMethod, DeduplicationConfig};
use crate::frame::{Frame, FrameImage, FrameMetadata};
use crate::media::ops::{self, HashMethod};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, error, info};

pub const ALGORITHM_NAME: &str = "frame_deduplicator";

/// Classification of one frame plus running totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    pub duplicate_count: u64,
    pub total_frames: u64,
    pub duplicate_ratio: f64,
}

impl DedupOutcome {
    fn into_output(self) -> AlgorithmOutput {
        let mut output = AlgorithmOutput::new();
        output.insert("is_duplicate".into(), self.is_duplicate.into());
        output.insert("duplicate_count".into(), self.duplicate_count.into());
        output.insert("total_frames".into(), self.total_frames.into());
        output.insert("duplicate_ratio".into(), self.duplicate_ratio.into());
        output
    }
}

/// Deduplication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub duplicate_count: u64,
    pub total_frames: u64,
    pub duplicate_ratio: f64,

    /// Entries currently held by the active strategy's history
    pub history_size: usize,
}

/// Partial configuration update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupPatch {
    pub method: Option<DedupMethod>,
    pub threshold: Option<f64>,
    pub hash_method: Option<HashMethod>,
    pub history_size: Option<usize>,
}

/// Detects duplicate frames within a short window of recent frames.
pub struct FrameDeduplicator {
    config: DeduplicationConfig,
    enabled: bool,
    hashes: VecDeque<String>,
    frames: VecDeque<FrameImage>,
    duplicate_count: u64,
    total_frames: u64,
}

impl FrameDeduplicator {
    pub fn new(config: DeduplicationConfig) -> Self {
        let capacity = config.history_size.max(1);
        Self {
            config: DeduplicationConfig {
                history_size: capacity,
                ..config
            },
            enabled: true,
            hashes: VecDeque::with_capacity(capacity),
            frames: VecDeque::with_capacity(capacity),
            duplicate_count: 0,
            total_frames: 0,
        }
    }

    /// Classify `frame` and update history and counters.
    ///
    /// When disabled, every frame is unique and nothing is recorded.
    pub fn classify(&mut self, frame: &Frame) -> DedupOutcome {
        if !self.enabled {
            return DedupOutcome {
                is_duplicate: false,
                duplicate_count: self.duplicate_count,
                total_frames: self.total_frames,
                duplicate_ratio: 0.0,
            };
        }

        self.total_frames += 1;

        let is_duplicate = match self.config.method {
            DedupMethod::Hash => self.check_hash(&frame.image),
            DedupMethod::Similarity => match self.check_similarity(&frame.image) {
                Ok(duplicate) => duplicate,
                Err(e) => {
                    error!(sequence = frame.sequence, error = %e, "Deduplication failed, keeping frame");
                    false
                }
            },
        };

        if is_duplicate {
            self.duplicate_count += 1;
            debug!(
                sequence = frame.sequence,
                duplicates = self.duplicate_count,
                "Duplicate frame detected"
            );
        }

        self.outcome(is_duplicate)
    }

    fn check_hash(&mut self, image: &FrameImage) -> bool {
        let digest = ops::content_hash(image, self.config.hash_method);
        if self.hashes.contains(&digest) {
            return true;
        }
        push_bounded(&mut self.hashes, digest, self.config.history_size);
        false
    }

    fn check_similarity(&mut self, image: &FrameImage) -> Result<bool, crate::media::MediaError> {
        for previous in &self.frames {
            if ops::similarity(image, previous)? >= self.config.threshold {
                return Ok(true);
            }
        }
        push_bounded(&mut self.frames, image.clone(), self.config.history_size);
        Ok(false)
    }

    fn ratio(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.duplicate_count as f64 / self.total_frames as f64
        }
    }

    fn outcome(&self, is_duplicate: bool) -> DedupOutcome {
        DedupOutcome {
            is_duplicate,
            duplicate_count: self.duplicate_count,
            total_frames: self.total_frames,
            duplicate_ratio: self.ratio(),
        }
    }

    pub fn stats(&self) -> DedupStats {
        let history_size = match self.config.method {
            DedupMethod::Hash => self.hashes.len(),
            DedupMethod::Similarity => self.frames.len(),
        };
        DedupStats {
            duplicate_count: self.duplicate_count,
            total_frames: self.total_frames,
            duplicate_ratio: self.ratio(),
            history_size,
        }
    }

    /// Clear counters and both histories.
    pub fn reset_stats(&mut self) {
        self.duplicate_count = 0;
        self.total_frames = 0;
        self.hashes.clear();
        self.frames.clear();
        info!("Frame deduplication statistics reset");
    }

    pub fn settings(&self) -> &DeduplicationConfig {
        &self.config
    }

    /// Apply a partial update. Shrinking the history keeps the newest entries.
    pub fn apply(&mut self, patch: DedupPatch) -> Result<(), AlgorithmError> {
        let mut next = self.config.clone();
        if let Some(method) = patch.method {
            next.method = method;
        }
        if let Some(threshold) = patch.threshold {
            next.threshold = threshold;
        }
        if let Some(hash_method) = patch.hash_method {
            next.hash_method = hash_method;
        }
        if let Some(history_size) = patch.history_size {
            next.history_size = history_size;
        }
        next.validate("deduplication")
            .map_err(|e| AlgorithmError::InvalidConfig(e.to_string()))?;

        if next.hash_method != self.config.hash_method {
            self.hashes.clear();
        }
        truncate_front(&mut self.hashes, next.history_size);
        truncate_front(&mut self.frames, next.history_size);

        debug!(
            method = ?next.method,
            threshold = next.threshold,
            history_size = next.history_size,
            "Deduplication configuration updated"
        );
        self.config = next;
        Ok(())
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, item: T, capacity: usize) {
    while history.len() >= capacity {
        history.pop_front();
    }
    history.push_back(item);
}

fn truncate_front<T>(history: &mut VecDeque<T>, capacity: usize) {
    while history.len() > capacity {
        history.pop_front();
    }
}

impl Algorithm for FrameDeduplicator {
    fn name(&self) -> &str {
        ALGORITHM_NAME
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn enable(&mut self) {
        self.enabled = true;
        debug!(algorithm = ALGORITHM_NAME, "Algorithm enabled");
    }

    fn disable(&mut self) {
        self.enabled = false;
        debug!(algorithm = ALGORITHM_NAME, "Algorithm disabled");
    }

    fn process(
        &mut self,
        frame: &Frame,
        _metadata: &FrameMetadata,
    ) -> Result<AlgorithmOutput, AlgorithmError> {
        Ok(self.classify(frame).into_output())
    }

    fn update_config(&mut self, patch: &Value) -> Result<(), AlgorithmError> {
        let patch: DedupPatch = serde_json::from_value(patch.clone())
            .map_err(|e| AlgorithmError::InvalidConfig(e.to_string()))?;
        self.apply(patch)
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }

    fn cleanup(&mut self) {
        self.hashes.clear();
        self.frames.clear();
    }
}
