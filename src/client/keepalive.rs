use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::kernel::Frame;

/// Shared record of the last inbound transport activity. Updated by the
/// inbound router on every frame; read by the keep-alive scheduler.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().expect("activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic heartbeat against an Active session.
///
/// Emits the protocol heartbeat at a fixed cadence and signals `degrade` when
/// no inbound activity has been observed within `interval * multiplier`.
/// One scheduler per Active entry; the previous one is aborted on any state
/// change, so no timers carry over.
pub struct KeepAliveScheduler {
    handle: JoinHandle<()>,
}

impl KeepAliveScheduler {
    pub fn spawn(
        interval: Duration,
        timeout_multiplier: u32,
        outbound: mpsc::UnboundedSender<String>,
        activity: ActivityTracker,
        degrade: Arc<Notify>,
    ) -> Self {
        let timeout = interval * timeout_multiplier.max(1);
        let handle = tokio::spawn(async move {
            let heartbeat = Frame::event("ps", serde_json::Value::Null).encode();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the first heartbeat
            // goes out one interval after activation.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if activity.idle_for() >= timeout {
                    warn!(?timeout, "heartbeat timeout, degrading session");
                    degrade.notify_one();
                    break;
                }
                if outbound.send(heartbeat.clone()).is_err() {
                    debug!("outbound channel closed, stopping keep-alive");
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Suspend the scheduler. Called on any transition out of Active.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn emits_heartbeats_at_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let activity = ActivityTracker::new();
        let degrade = Arc::new(Notify::new());
        let tracker = activity.clone();

        let _scheduler = KeepAliveScheduler::spawn(
            Duration::from_secs(20),
            3,
            tx,
            activity,
            degrade,
        );

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(20)).await;
            tracker.touch();
            assert_eq!(rx.recv().await.unwrap(), "42[\"ps\"]");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn degrades_after_silent_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let activity = ActivityTracker::new();
        let degrade = Arc::new(Notify::new());
        let degraded = Arc::clone(&degrade);

        let _scheduler = KeepAliveScheduler::spawn(
            Duration::from_secs(10),
            3,
            tx,
            activity,
            degrade,
        );

        let wait = tokio::spawn(async move { degraded.notified().await });
        // No inbound activity at all: the 30s deadline is detected at the
        // next tick after it elapses.
        tokio::time::advance(Duration::from_secs(40)).await;
        wait.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let activity = ActivityTracker::new();
        let degrade = Arc::new(Notify::new());
        let tracker = activity.clone();

        let _scheduler = KeepAliveScheduler::spawn(
            Duration::from_secs(10),
            3,
            tx,
            activity,
            degrade,
        );

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tracker.touch();
        }
        // Six heartbeats and no degrade signal.
        let mut beats = 0;
        while rx.try_recv().is_ok() {
            beats += 1;
        }
        assert_eq!(beats, 6);
    }
}
