//! Periodic sync trigger.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Something that can start a sync pass.
pub trait SyncTrigger: Send + Sync {
    /// Starts a pass unless one is already in flight.
    ///
    /// Returns false if the call was a no-op.
    fn trigger(&self) -> bool;
}

/// Drives a [`SyncTrigger`] on a fixed interval.
///
/// The first tick fires one full interval after `start`. Ticks that land while
/// a pass is still running are no-ops on the trigger side; ticks missed
/// because the runtime was busy are skipped, not bunched up.
#[derive(Debug, Default)]
pub struct Scheduler {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a stopped scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts ticking, replacing any previous timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, interval: Duration, trigger: Arc<dyn SyncTrigger>) {
        let interval = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let started = trigger.trigger();
                trace!(started, "scheduler tick");
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        debug!(interval_ms = interval.as_millis() as u64, "scheduler started");
    }

    /// Stops ticking. In-flight passes are not affected.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("scheduler stopped");
        }
    }

    /// Returns true while the timer is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SyncTrigger for Counter {
        fn trigger(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let counter = Arc::new(Counter::default());
        let scheduler = Scheduler::new();
        scheduler.start(Duration::from_secs(10), counter.clone());
        assert!(scheduler.is_running());

        // No immediate tick.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);

        scheduler.stop();
        assert!(!scheduler.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_timer() {
        let counter = Arc::new(Counter::default());
        let scheduler = Scheduler::new();
        scheduler.start(Duration::from_secs(10), counter.clone());
        scheduler.start(Duration::from_secs(10), counter.clone());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
