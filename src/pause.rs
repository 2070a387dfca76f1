//! Cooperative pause gate for dispatcher workers.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;

/// How often a paused worker re-checks its cancellation token.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Pause/resume switch shared by every dispatcher of a run.
///
/// Workers call [`wait_if_paused`](Self::wait_if_paused) before taking the
/// next job, so a pause never interrupts a job that is already running.
#[derive(Debug, Default)]
pub struct PauseResumeHandler {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseResumeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Block while paused.
    ///
    /// Returns `false` if `cancel` fired while waiting, `true` otherwise.
    pub fn wait_if_paused(&self, cancel: &CancelToken) -> bool {
        let mut paused = self.paused.lock();
        while *paused {
            if cancel.is_cancelled() {
                return false;
            }
            self.resumed.wait_for(&mut paused, CANCEL_CHECK_INTERVAL);
        }
        !cancel.is_cancelled()
    }
}
