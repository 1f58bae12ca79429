//! Named background threads with a bounded join.
//!
//! `std::thread::JoinHandle::join` blocks forever. Components must be able to
//! give up on a stuck thread after a timeout and still release their native
//! handles, so each worker carries a completion latch that is set when the
//! thread body returns or unwinds.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn set(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

/// Sets the latch when dropped, so a panicking body still counts as finished.
struct LatchGuard(Arc<Latch>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// Handle to a named background thread.
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    latch: Arc<Latch>,
}

impl Worker {
    /// Spawn `body` on a new thread called `name`.
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let latch = Arc::new(Latch::default());
        let guard = LatchGuard(latch.clone());

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = guard;
            body();
        })?;

        debug!(worker = %name, "Worker started");
        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            latch,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread body has returned (or panicked).
    pub fn is_finished(&self) -> bool {
        *self.latch.done.lock()
    }

    /// Wait up to `timeout` for the thread to finish.
    ///
    /// Returns `false` if it is still running; the thread is then detached.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        if !self.latch.wait(timeout) {
            warn!(
                worker = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "Worker did not stop in time, detaching"
            );
            self.handle.take();
            return false;
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "Worker panicked");
            }
        }
        debug!(worker = %self.name, "Worker joined");
        true
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_join_completed_worker() {
        let ran = Arc::new(AtomicBool::new(false));
        let worker = {
            let ran = ran.clone();
            Worker::spawn("test-worker", move || ran.store(true, Ordering::SeqCst)).unwrap()
        };

        assert!(worker.join_timeout(Duration::from_secs(5)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_join_times_out_on_stuck_worker() {
        let release = Arc::new(AtomicBool::new(false));
        let worker = {
            let release = release.clone();
            Worker::spawn("stuck-worker", move || {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap()
        };

        let started = Instant::now();
        assert!(!worker.join_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(2));
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_panicking_worker_counts_as_finished() {
        let worker = Worker::spawn("panicking-worker", || panic!("boom")).unwrap();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }
}
