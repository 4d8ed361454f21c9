//! Background peak-level polling.
//!
//! A single lazily-started thread samples the main device's level at a fixed
//! cadence while at least one level listener is registered. The stop flag is
//! checked once per tick, so shutdown latency is at most one interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

/// Polling cadence for level listeners.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle for the polling thread; owned by the controller.
pub(crate) struct LevelNotifier {
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LevelNotifier {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the polling thread if it is not already running.
    ///
    /// `setup` runs once on the new thread before the first tick; `tick`
    /// runs every interval and returns `false` to end the loop early (the
    /// controller is gone).
    pub fn start(
        &self,
        setup: impl FnOnce() + Send + 'static,
        mut tick: impl FnMut() -> bool + Send + 'static,
    ) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = Arc::clone(&self.running);
        let spawned = thread::Builder::new()
            .name("level-notifier".into())
            .spawn(move || {
                setup();
                debug!("level notifier started");
                while running.load(Ordering::SeqCst) {
                    if !tick() {
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                debug!("level notifier stopped");
            });
        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle)
            }
            Err(e) => {
                error!(error = %e, "failed to spawn level notifier");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Signal the thread to stop and join it.
    ///
    /// Joining is skipped when called from the polling thread itself (a
    /// listener removing itself during delivery); the thread then exits on
    /// its next flag check.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
