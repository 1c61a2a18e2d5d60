//! Cancellable fixed-interval task.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs a job once immediately and then every `interval` until stopped.
///
/// A tick that overruns the interval delays the next one instead of
/// bursting to catch up. Stopping is idempotent, and dropping the task stops it.
pub struct ScheduledTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl ScheduledTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Start ticking. Returns false if already running.
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&self, interval: Duration, mut job: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = job() => {}
                }
            }
            debug!(task = name, "scheduled task stopped");
        });

        debug!(task = name, interval_ms = interval.as_millis() as u64, "scheduled task started");
        *running = Some(Running { cancel, handle });
        true
    }

    /// Stop ticking. Returns true if a running task was stopped.
    pub fn stop(&self) -> bool {
        match self.lock().take() {
            Some(running) => {
                running.cancel.cancel();
                !running.handle.is_finished()
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.handle.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}
