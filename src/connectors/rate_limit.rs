//! Per-Binding Request Pacing
//! Each binding carries a requests-per-minute allowance; the connector
//! layer enforces it before every outbound call.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Sliding-window pacer. `acquire` sleeps until the window rolls;
/// `try_acquire` fails fast with `RateLimited` for venues whose policy is
/// to reject rather than queue.
pub struct RequestPacer {
    limit: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RequestPacer {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            limit: requests_per_minute.max(1) as usize,
            window: Duration::from_secs(60),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, now: Instant) -> usize {
        let mut sent = self.sent.lock();
        while let Some(front) = sent.front() {
            if now.duration_since(*front) >= self.window {
                sent.pop_front();
            } else {
                break;
            }
        }
        sent.len()
    }

    /// Time until a slot frees up, if the window is currently full.
    fn wait_needed(&self, now: Instant) -> Option<Duration> {
        if self.prune(now) < self.limit {
            return None;
        }
        let sent = self.sent.lock();
        sent.front()
            .map(|front| self.window.saturating_sub(now.duration_since(*front)))
    }

    fn record(&self, now: Instant) {
        self.sent.lock().push_back(now);
    }

    /// Sleep until the window admits another request, then record it.
    pub async fn acquire(&self) {
        loop {
            let now = Instant::now();
            match self.wait_needed(now) {
                None => {
                    self.record(now);
                    return;
                }
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "request pacer sleeping");
                    sleep(wait).await;
                }
            }
        }
    }

    /// Record a slot or fail with `RateLimited` carrying the retry-after.
    pub fn try_acquire(&self) -> Result<()> {
        let now = Instant::now();
        match self.wait_needed(now) {
            None => {
                self.record(now);
                Ok(())
            }
            Some(wait) => Err(GatewayError::RateLimited {
                retry_after_secs: wait.as_secs().max(1),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_acquire_fails_when_window_full() {
        let pacer = RequestPacer::new(3);
        for _ in 0..3 {
            pacer.try_acquire().unwrap();
        }
        match pacer.try_acquire() {
            Err(GatewayError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_until_window_rolls() {
        let pacer = RequestPacer::new(2);
        pacer.acquire().await;
        pacer.acquire().await;

        let start = Instant::now();
        // Third acquire must wait for the 60s window to roll. Paused time
        // auto-advances through the sleep.
        pacer.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(59));
    }
}
