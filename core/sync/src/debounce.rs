//! Cancellable debounced task.

use futures::future::BoxFuture;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::debug;

/// Runs a task after a quiet period, keeping at most one timer pending.
///
/// Scheduling again before the delay elapses aborts the pending timer and
/// starts a new one. Once the delay has elapsed the task runs detached, so a
/// later `schedule` cannot abort it halfway. Must be used inside a tokio runtime.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<AbortHandle>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// (Re)start the timer; `task` runs once it fires.
    pub fn schedule(&self, task: BoxFuture<'static, ()>) {
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            tokio::spawn(task);
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(timer.abort_handle());
        if let Some(previous) = previous {
            if !previous.is_finished() {
                debug!("Replacing pending debounced task");
            }
            previous.abort();
        }
    }

    /// Abort the pending timer. Returns whether one was still waiting.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(handle) => {
                let waiting = !handle.is_finished();
                handle.abort();
                waiting
            }
            None => false,
        }
    }

    /// Whether a timer is waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
