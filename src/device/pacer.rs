//! Minimum spacing between short-lived device commands.
//!
//! adb drops commands when hammered from several threads at once.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Shared gate enforcing a minimum interval between command starts.
///
/// Clones share the same schedule.
#[derive(Clone, Debug)]
pub struct Pacer {
    last_start: Arc<Mutex<Option<Instant>>>,
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_start: Arc::new(Mutex::new(None)),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until at least `interval` has passed since the previous start.
    ///
    /// Holds the lock while sleeping; concurrent callers start one interval
    /// apart.
    pub fn wait(&self) {
        let mut last = self.last_start.lock().unwrap();
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}
