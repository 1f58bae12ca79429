//! Multi-algorithm frame processing pipeline.
//!
//! Frames are submitted into a bounded queue and processed on a single
//! background thread. Each frame runs through every enabled algorithm in
//! list order; a failing or panicking algorithm is recorded as an error entry
//! and does not affect the others.

use crate::algorithm::{Algorithm, AlgorithmOutput};
use crate::config::ProcessingConfig;
use crate::frame::{Frame, FrameMetadata};
use crate::worker::{panic_message, Worker};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Errors raised by processor management calls.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Algorithm not found: {0}")]
    AlgorithmNotFound(String),

    #[error("Algorithm already registered: {0}")]
    DuplicateAlgorithm(String),

    #[error("Algorithm {name} rejected configuration: {message}")]
    InvalidConfig { name: String, message: String },

    #[error("Failed to spawn processing thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of one algorithm on one frame.
#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmReport {
    pub output: Option<AlgorithmOutput>,
    pub error: Option<String>,
    pub processing_time_us: u64,
}

/// Everything the pipeline produced for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub metadata: FrameMetadata,
    pub algorithm_results: BTreeMap<String, AlgorithmReport>,
    pub processing_time_us: u64,
    pub timestamp: DateTime<Utc>,
}

/// Statistics for the frame processor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    pub submitted_frames: u64,
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub results_size: usize,

    /// Mean seconds per frame over the timing window
    pub avg_processing_time: f64,
    pub algorithms_count: usize,
    pub enabled_algorithms: Vec<String>,
    pub is_running: bool,
}

pub type ResultCallback = Box<dyn Fn(&ProcessingResult) + Send + Sync>;

#[derive(Default)]
struct Queue {
    frames: VecDeque<(Frame, FrameMetadata)>,
    results: VecDeque<ProcessingResult>,
    timings: VecDeque<Duration>,
    submitted: u64,
    processed: u64,
    dropped: u64,
}

struct Shared {
    config: ProcessingConfig,
    algorithms: Mutex<Vec<Box<dyn Algorithm>>>,
    queue: Mutex<Queue>,
    available: Condvar,
    running: AtomicBool,
    /// Algorithms were added or used since the last cleanup pass
    dirty: AtomicBool,
    callback: RwLock<Option<ResultCallback>>,
}

/// Runs pluggable algorithms over submitted frames on a background thread.
pub struct FrameProcessor {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl FrameProcessor {
    /// Create a new frame processor.
    pub fn new(config: ProcessingConfig) -> Self {
        info!(max_queue_size = config.max_queue_size, "Frame processor initialized");
        Self {
            shared: Arc::new(Shared {
                config,
                algorithms: Mutex::new(Vec::new()),
                queue: Mutex::new(Queue::default()),
                available: Condvar::new(),
                running: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
                callback: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Append an algorithm to the end of the pipeline.
    pub fn add_algorithm(&self, algorithm: Box<dyn Algorithm>) -> Result<(), ProcessingError> {
        let mut algorithms = self.shared.algorithms.lock();
        let name = algorithm.name().to_string();
        if algorithms.iter().any(|a| a.name() == name) {
            return Err(ProcessingError::DuplicateAlgorithm(name));
        }
        algorithms.push(algorithm);
        self.shared.dirty.store(true, Ordering::SeqCst);
        info!(algorithm = %name, "Added algorithm");
        Ok(())
    }

    /// Remove an algorithm by name, running its cleanup.
    pub fn remove_algorithm(&self, name: &str) -> bool {
        let removed = {
            let mut algorithms = self.shared.algorithms.lock();
            algorithms
                .iter()
                .position(|a| a.name() == name)
                .map(|index| algorithms.remove(index))
        };

        match removed {
            Some(mut algorithm) => {
                algorithm.cleanup();
                info!(algorithm = %name, "Removed algorithm");
                true
            }
            None => {
                warn!(algorithm = %name, "Algorithm not found");
                false
            }
        }
    }

    pub fn algorithm_names(&self) -> Vec<String> {
        self.shared
            .algorithms
            .lock()
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    pub fn set_algorithm_enabled(&self, name: &str, enabled: bool) -> Result<(), ProcessingError> {
        let mut algorithms = self.shared.algorithms.lock();
        let algorithm = algorithms
            .iter_mut()
            .find(|a| a.name() == name)
            .ok_or_else(|| ProcessingError::AlgorithmNotFound(name.to_string()))?;
        if enabled {
            algorithm.enable();
        } else {
            algorithm.disable();
        }
        Ok(())
    }

    /// Pass a partial configuration to one algorithm.
    pub fn update_algorithm_config(&self, name: &str, patch: &Value) -> Result<(), ProcessingError> {
        let mut algorithms = self.shared.algorithms.lock();
        let algorithm = algorithms
            .iter_mut()
            .find(|a| a.name() == name)
            .ok_or_else(|| ProcessingError::AlgorithmNotFound(name.to_string()))?;
        algorithm
            .update_config(patch)
            .map_err(|e| ProcessingError::InvalidConfig {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Called on the processing thread after every frame.
    pub fn set_result_callback<F>(&self, callback: F)
    where
        F: Fn(&ProcessingResult) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Box::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the processing thread. A no-op when already running.
    pub fn start(&self) -> Result<(), ProcessingError> {
        let mut worker = self.worker.lock();
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("Frame processor is already running");
            return Ok(());
        }

        self.shared.dirty.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        match Worker::spawn("frame-processor", move || processing_loop(shared)) {
            Ok(spawned) => *worker = Some(spawned),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(ProcessingError::Spawn(e));
            }
        }

        info!("Frame processor started");
        Ok(())
    }

    /// Stop the processing thread and clean up every algorithm.
    ///
    /// Algorithms are cleaned up once per stop, including on a processor
    /// that was never started.
    pub fn stop(&self) {
        let timeout = self.shared.config.stop_timeout();

        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("Stopping frame processor");
            {
                let _queue = self.shared.queue.lock();
                self.shared.available.notify_all();
            }
            if let Some(worker) = self.worker.lock().take() {
                worker.join_timeout(timeout);
            }
            info!("Frame processor stopped");
        }

        if !self.shared.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        // Cleanup runs even if the thread is still busy with an algorithm.
        match self.shared.algorithms.try_lock_for(timeout) {
            Some(mut algorithms) => algorithms.iter_mut().for_each(|a| a.cleanup()),
            None => {
                self.shared.dirty.store(true, Ordering::SeqCst);
                warn!("Algorithms still in use, skipping cleanup");
            }
        }
    }

    /// Queue a frame for processing. Returns false when the queue is full.
    pub fn submit_frame(&self, frame: Frame, metadata: FrameMetadata) -> bool {
        let mut queue = self.shared.queue.lock();
        queue.submitted += 1;
        if queue.frames.len() >= self.shared.config.max_queue_size {
            queue.dropped += 1;
            debug!(sequence = frame.sequence, "Frame queue full, dropping frame");
            return false;
        }

        queue.frames.push_back((frame, metadata));
        self.shared.available.notify_one();
        true
    }

    /// The newest `count` results, oldest first.
    pub fn latest_results(&self, count: usize) -> Vec<ProcessingResult> {
        let queue = self.shared.queue.lock();
        let skip = queue.results.len().saturating_sub(count);
        queue.results.iter().skip(skip).cloned().collect()
    }

    /// Drop queued frames and stored results. Cleared frames count as dropped.
    pub fn clear_queues(&self) {
        let mut queue = self.shared.queue.lock();
        let cleared = queue.frames.len();
        queue.dropped += cleared as u64;
        queue.frames.clear();
        queue.results.clear();
        info!(frames = cleared, "Frame and results queues cleared");
    }

    pub fn stats(&self) -> ProcessorStats {
        let mut stats = {
            let queue = self.shared.queue.lock();
            let avg_processing_time = if queue.timings.is_empty() {
                0.0
            } else {
                queue.timings.iter().sum::<Duration>().as_secs_f64() / queue.timings.len() as f64
            };
            ProcessorStats {
                submitted_frames: queue.submitted,
                processed_frames: queue.processed,
                dropped_frames: queue.dropped,
                queue_size: queue.frames.len(),
                max_queue_size: self.shared.config.max_queue_size,
                results_size: queue.results.len(),
                avg_processing_time,
                is_running: self.is_running(),
                ..ProcessorStats::default()
            }
        };

        let algorithms = self.shared.algorithms.lock();
        stats.algorithms_count = algorithms.len();
        stats.enabled_algorithms = algorithms
            .iter()
            .filter(|a| a.is_enabled())
            .map(|a| a.name().to_string())
            .collect();
        stats
    }
}

impl Drop for FrameProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn next_frame(shared: &Shared) -> Option<(Frame, FrameMetadata)> {
    let mut queue = shared.queue.lock();
    while queue.frames.is_empty() && shared.running.load(Ordering::SeqCst) {
        shared.available.wait_for(&mut queue, IDLE_WAIT);
    }
    if !shared.running.load(Ordering::SeqCst) {
        return None;
    }
    queue.frames.pop_front()
}

fn run_algorithms(shared: &Shared, frame: &Frame, metadata: &FrameMetadata) -> BTreeMap<String, AlgorithmReport> {
    let mut reports = BTreeMap::new();
    let mut algorithms = shared.algorithms.lock();

    for algorithm in algorithms.iter_mut().filter(|a| a.is_enabled()) {
        let name = algorithm.name().to_string();
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| algorithm.process(frame, metadata)));
        let processing_time_us = started.elapsed().as_micros() as u64;

        let report = match outcome {
            Ok(Ok(output)) => AlgorithmReport {
                output: Some(output),
                error: None,
                processing_time_us,
            },
            Ok(Err(e)) => {
                error!(algorithm = %name, sequence = frame.sequence, error = %e, "Error in algorithm");
                AlgorithmReport {
                    output: None,
                    error: Some(e.to_string()),
                    processing_time_us: 0,
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(algorithm = %name, sequence = frame.sequence, panic = %message, "Algorithm panicked");
                AlgorithmReport {
                    output: None,
                    error: Some(format!("panic: {message}")),
                    processing_time_us: 0,
                }
            }
        };
        reports.insert(name, report);
    }

    reports
}

fn processing_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        let Some((frame, metadata)) = next_frame(&shared) else {
            continue;
        };

        let started = Instant::now();
        let algorithm_results = run_algorithms(&shared, &frame, &metadata);
        let elapsed = started.elapsed();

        let result = ProcessingResult {
            metadata,
            algorithm_results,
            processing_time_us: elapsed.as_micros() as u64,
            timestamp: Utc::now(),
        };

        {
            let mut queue = shared.queue.lock();
            queue.processed += 1;
            queue.timings.push_back(elapsed);
            while queue.timings.len() > shared.config.timing_window {
                queue.timings.pop_front();
            }
            queue.results.push_back(result.clone());
            while queue.results.len() > shared.config.result_history_size {
                queue.results.pop_front();
            }
        }

        if let Some(callback) = shared.callback.read().as_ref() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&result))) {
                error!(panic = %panic_message(payload.as_ref()), "Error in result callback");
            }
        }
    }

    debug!("Processing loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmError;
    use crate::config::DeduplicationConfig;
    use crate::dedup::FrameDeduplicator;
    use crate::frame::FrameImage;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn create_test_config() -> ProcessingConfig {
        ProcessingConfig {
            max_queue_size: 10,
            result_history_size: 5,
            timing_window: 10,
            ..ProcessingConfig::default()
        }
    }

    fn frame(sequence: u64) -> (Frame, FrameMetadata) {
        let frame = Frame::new(sequence, FrameImage::filled(4, 4, 3, sequence as u8).unwrap());
        let metadata = FrameMetadata::live(&frame);
        (frame, metadata)
    }

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Reports the frame sequence; counts cleanups.
    struct Echo {
        name: String,
        enabled: bool,
        cleanups: Arc<AtomicUsize>,
    }

    impl Echo {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                enabled: true,
                cleanups: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Algorithm for Echo {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
        fn enable(&mut self) {
            self.enabled = true;
        }
        fn disable(&mut self) {
            self.enabled = false;
        }
        fn process(&mut self, frame: &Frame, _: &FrameMetadata) -> Result<AlgorithmOutput, AlgorithmError> {
            let mut output = AlgorithmOutput::new();
            output.insert("sequence".into(), frame.sequence.into());
            Ok(output)
        }
        fn cleanup(&mut self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fails or panics on every frame.
    struct Broken {
        name: &'static str,
        panics: bool,
    }

    impl Algorithm for Broken {
        fn name(&self) -> &str {
            self.name
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn enable(&mut self) {}
        fn disable(&mut self) {}
        fn process(&mut self, _: &Frame, _: &FrameMetadata) -> Result<AlgorithmOutput, AlgorithmError> {
            if self.panics {
                panic!("algorithm exploded");
            }
            Err(AlgorithmError::ProcessingFailed("bad frame".to_string()))
        }
    }

    /// Blocks each frame until released by the test.
    struct Gate {
        entered: mpsc::Sender<u64>,
        release: mpsc::Receiver<()>,
    }

    impl Algorithm for Gate {
        fn name(&self) -> &str {
            "gate"
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn enable(&mut self) {}
        fn disable(&mut self) {}
        fn process(&mut self, frame: &Frame, _: &FrameMetadata) -> Result<AlgorithmOutput, AlgorithmError> {
            let _ = self.entered.send(frame.sequence);
            let _ = self.release.recv_timeout(Duration::from_secs(5));
            Ok(AlgorithmOutput::new())
        }
    }

    #[test]
    fn test_processes_frames_in_order() {
        let processor = FrameProcessor::new(create_test_config());
        processor.add_algorithm(Box::new(Echo::new("echo"))).unwrap();
        processor.start().unwrap();

        for seq in 0..3 {
            let (frame, metadata) = frame(seq);
            assert!(processor.submit_frame(frame, metadata));
        }
        assert!(wait_for(Duration::from_secs(5), || processor.stats().processed_frames == 3));

        let results = processor.latest_results(3);
        let sequences: Vec<u64> = results.iter().map(|r| r.metadata.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(
            results[2].algorithm_results["echo"].output.as_ref().unwrap()["sequence"],
            json!(2)
        );
        assert_eq!(processor.latest_results(1).len(), 1);
        processor.stop();
    }

    #[test]
    fn test_failures_are_isolated() {
        let processor = FrameProcessor::new(create_test_config());
        processor
            .add_algorithm(Box::new(Broken { name: "failing", panics: false }))
            .unwrap();
        processor
            .add_algorithm(Box::new(Broken { name: "panicking", panics: true }))
            .unwrap();
        processor.add_algorithm(Box::new(Echo::new("echo"))).unwrap();
        processor.start().unwrap();

        let (f, m) = frame(0);
        processor.submit_frame(f, m);
        let (f, m) = frame(1);
        processor.submit_frame(f, m);
        assert!(wait_for(Duration::from_secs(5), || processor.stats().processed_frames == 2));

        let result = processor.latest_results(1).remove(0);
        assert_eq!(result.algorithm_results["failing"].error.as_deref(), Some("Processing failed: bad frame"));
        assert!(result.algorithm_results["panicking"]
            .error
            .as_deref()
            .unwrap()
            .contains("algorithm exploded"));
        assert!(result.algorithm_results["echo"].output.is_some());
        assert!(processor.is_running());
        processor.stop();
    }

    #[test]
    fn test_backpressure_accounting() {
        let processor = FrameProcessor::new(ProcessingConfig {
            max_queue_size: 2,
            ..create_test_config()
        });
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        processor
            .add_algorithm(Box::new(Gate {
                entered: entered_tx,
                release: release_rx,
            }))
            .unwrap();
        processor.start().unwrap();

        let (f, m) = frame(0);
        assert!(processor.submit_frame(f, m));
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        let accepted: Vec<bool> = (1..5)
            .map(|seq| {
                let (f, m) = frame(seq);
                processor.submit_frame(f, m)
            })
            .collect();
        assert_eq!(accepted, vec![true, true, false, false]);

        let stats = processor.stats();
        assert_eq!(stats.submitted_frames, 5);
        assert_eq!(stats.dropped_frames, 2);
        assert_eq!(stats.queue_size, 2);
        assert_eq!(
            stats.submitted_frames,
            stats.processed_frames + stats.queue_size as u64 + stats.dropped_frames
                + 1 // in flight
        );

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        assert!(wait_for(Duration::from_secs(5), || processor.stats().processed_frames == 3));

        let stats = processor.stats();
        assert_eq!(
            stats.submitted_frames,
            stats.processed_frames + stats.queue_size as u64 + stats.dropped_frames
        );
        processor.stop();
    }

    #[test]
    fn test_disabled_algorithms_are_skipped() {
        let processor = FrameProcessor::new(create_test_config());
        processor.add_algorithm(Box::new(Echo::new("a"))).unwrap();
        processor.add_algorithm(Box::new(Echo::new("b"))).unwrap();
        processor.set_algorithm_enabled("a", false).unwrap();
        assert!(processor.set_algorithm_enabled("missing", false).is_err());
        assert_eq!(processor.stats().enabled_algorithms, vec!["b".to_string()]);

        processor.start().unwrap();
        let (f, m) = frame(0);
        processor.submit_frame(f, m);
        assert!(wait_for(Duration::from_secs(5), || processor.stats().processed_frames == 1));

        let result = processor.latest_results(1).remove(0);
        assert!(!result.algorithm_results.contains_key("a"));
        assert!(result.algorithm_results.contains_key("b"));
        processor.stop();
    }

    #[test]
    fn test_remove_and_stop_clean_up() {
        let processor = FrameProcessor::new(create_test_config());
        let removed = Echo::new("removed");
        let removed_cleanups = removed.cleanups.clone();
        let kept = Echo::new("kept");
        let kept_cleanups = kept.cleanups.clone();

        processor.add_algorithm(Box::new(removed)).unwrap();
        processor.add_algorithm(Box::new(kept)).unwrap();
        assert!(matches!(
            processor.add_algorithm(Box::new(Echo::new("kept"))),
            Err(ProcessingError::DuplicateAlgorithm(_))
        ));
        processor.start().unwrap();

        assert!(processor.remove_algorithm("removed"));
        assert!(!processor.remove_algorithm("removed"));
        assert_eq!(removed_cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(processor.algorithm_names(), vec!["kept".to_string()]);

        processor.stop();
        processor.stop();
        assert_eq!(kept_cleanups.load(Ordering::SeqCst), 1);
        assert!(!processor.is_running());
    }

    #[test]
    fn test_callback_receives_results_and_panics_are_contained() {
        let processor = FrameProcessor::new(create_test_config());
        processor.add_algorithm(Box::new(Echo::new("echo"))).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            processor.set_result_callback(move |result| {
                seen.fetch_add(1, Ordering::SeqCst);
                if result.metadata.sequence == 0 {
                    panic!("callback failure");
                }
            });
        }
        processor.start().unwrap();

        for seq in 0..3 {
            let (f, m) = frame(seq);
            processor.submit_frame(f, m);
        }
        assert!(wait_for(Duration::from_secs(5), || seen.load(Ordering::SeqCst) == 3));
        assert_eq!(processor.stats().processed_frames, 3);
        processor.stop();
    }

    #[test]
    fn test_result_history_is_bounded() {
        let processor = FrameProcessor::new(create_test_config());
        processor.add_algorithm(Box::new(Echo::new("echo"))).unwrap();
        processor.start().unwrap();

        for seq in 0..8 {
            let (f, m) = frame(seq);
            processor.submit_frame(f, m);
        }
        assert!(wait_for(Duration::from_secs(5), || processor.stats().processed_frames == 8));

        let stats = processor.stats();
        assert_eq!(stats.results_size, 5);
        assert!(stats.avg_processing_time >= 0.0);
        let oldest = processor.latest_results(100)[0].metadata.sequence;
        assert_eq!(oldest, 3);

        processor.clear_queues();
        let stats = processor.stats();
        assert_eq!(stats.results_size, 0);
        assert_eq!(
            stats.submitted_frames,
            stats.processed_frames + stats.queue_size as u64 + stats.dropped_frames
        );
        processor.stop();
    }

    #[test]
    fn test_cleared_frames_count_as_dropped() {
        let processor = FrameProcessor::new(create_test_config());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        processor
            .add_algorithm(Box::new(Gate {
                entered: entered_tx,
                release: release_rx,
            }))
            .unwrap();
        processor.start().unwrap();

        for seq in 0..4 {
            let (f, m) = frame(seq);
            assert!(processor.submit_frame(f, m));
        }
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        processor.clear_queues();
        let stats = processor.stats();
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.dropped_frames, 3);

        release_tx.send(()).unwrap();
        assert!(wait_for(Duration::from_secs(5), || processor.stats().processed_frames == 1));
        let stats = processor.stats();
        assert_eq!(
            stats.submitted_frames,
            stats.processed_frames + stats.queue_size as u64 + stats.dropped_frames
        );
        processor.stop();
    }

    #[test]
    fn test_unstarted_processor_cleans_up() {
        let echo = Echo::new("echo");
        let cleanups = echo.cleanups.clone();
        {
            let processor = FrameProcessor::new(create_test_config());
            processor.add_algorithm(Box::new(echo)).unwrap();
            assert!(!processor.is_running());
        }
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        let echo = Echo::new("echo");
        let cleanups = echo.cleanups.clone();
        let processor = FrameProcessor::new(create_test_config());
        processor.add_algorithm(Box::new(echo)).unwrap();
        processor.stop();
        processor.stop();
        drop(processor);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deduplicator_as_algorithm() {
        let processor = FrameProcessor::new(create_test_config());
        processor
            .add_algorithm(Box::new(FrameDeduplicator::new(DeduplicationConfig::default())))
            .unwrap();
        processor
            .update_algorithm_config("frame_deduplicator", &json!({ "method": "hash" }))
            .unwrap();
        assert!(processor
            .update_algorithm_config("frame_deduplicator", &json!({ "threshold": -1.0 }))
            .is_err());
        assert!(matches!(
            processor.update_algorithm_config("missing", &json!({})),
            Err(ProcessingError::AlgorithmNotFound(_))
        ));
        processor.start().unwrap();

        for seq in 0..2 {
            let image = FrameImage::filled(4, 4, 3, 9).unwrap();
            let frame = Frame::new(seq, image);
            let metadata = FrameMetadata::live(&frame);
            processor.submit_frame(frame, metadata);
        }
        assert!(wait_for(Duration::from_secs(5), || processor.stats().processed_frames == 2));

        let results = processor.latest_results(2);
        let duplicate = |r: &ProcessingResult| {
            r.algorithm_results["frame_deduplicator"].output.as_ref().unwrap()["is_duplicate"].clone()
        };
        assert_eq!(duplicate(&results[0]), json!(false));
        assert_eq!(duplicate(&results[1]), json!(true));
        processor.stop();
    }
}
