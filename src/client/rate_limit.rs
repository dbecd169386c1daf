use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::core::errors::ClientError;

/// Sliding-window rate limiter gating outgoing requests.
///
/// `acquire` suspends until a slot frees and never drops a caller. Waiters
/// queue on the inner mutex, which hands the lock out in FIFO order, so under
/// contention acquisitions complete in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    quota: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self {
            quota: quota.max(1) as usize,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait for a slot. The lock is held across the sleep so that later
    /// arrivals cannot overtake an earlier waiter.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            Self::prune(&mut calls, now, self.window);
            if calls.len() < self.quota {
                calls.push_back(now);
                return;
            }
            // Oldest recorded call decides when the next slot opens.
            let reopen = calls[0] + self.window;
            tokio::time::sleep_until(reopen).await;
        }
    }

    /// Fail-fast variant for callers configured not to suspend. A waiter
    /// parked in `acquire` holds the lock across its sleep, which means the
    /// window is exhausted; report that immediately instead of queueing.
    pub fn try_acquire(&self) -> Result<(), ClientError> {
        let Ok(mut calls) = self.calls.try_lock() else {
            return Err(ClientError::RateLimit(
                "window exhausted, waiters queued".to_string(),
            ));
        };
        let now = Instant::now();
        Self::prune(&mut calls, now, self.window);
        if calls.len() < self.quota {
            calls.push_back(now);
            Ok(())
        } else {
            Err(ClientError::RateLimit(format!(
                "{} calls in the last {:?}",
                calls.len(),
                self.window
            )))
        }
    }

    fn prune(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}
