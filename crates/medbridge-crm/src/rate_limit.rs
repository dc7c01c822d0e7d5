//! Sliding-window rate limiter for outbound CRM requests.
//!
//! The CRM enforces a hard per-second request budget and answers bursts with
//! HTTP 429 followed by temporary bans, so the client paces itself instead
//! of reacting: [`RateLimiter::acquire`] blocks until sending one more
//! request keeps the recent-request count within the window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use medbridge_core::RateLimitSettings;

/// Shared pacing gate. Cheap to clone behind an `Arc` at the client level;
/// all requests of one client must go through one instance.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            max_requests: settings.max_requests,
            window: Duration::from_secs(settings.window_secs),
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a request slot is free, then claim it.
    ///
    /// Slots are claimed in arrival order under the lock; a waiter re-checks
    /// after sleeping because other tasks may have claimed slots meanwhile.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut stamps = self.timestamps.lock().await;
                let now = Instant::now();
                while let Some(front) = stamps.front() {
                    if now.duration_since(*front) >= self.window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
                if stamps.len() < self.max_requests {
                    stamps.push_back(now);
                    return;
                }
                // Full window: sleep until the oldest entry ages out.
                self.window - now.duration_since(stamps[0])
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of requests currently inside the window.
    pub async fn in_flight(&self) -> usize {
        let mut stamps = self.timestamps.lock().await;
        let now = Instant::now();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        stamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_requests: usize, window_secs: u64) -> RateLimitSettings {
        RateLimitSettings {
            max_requests,
            window_secs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_budget_is_immediate() {
        let limiter = RateLimiter::new(&settings(7, 1));
        let start = Instant::now();
        for _ in 0..7 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_flight().await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn eighth_request_waits_for_window() {
        let limiter = RateLimiter::new(&settings(7, 1));
        for _ in 0..7 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_as_old_requests_age_out() {
        let limiter = RateLimiter::new(&settings(2, 1));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(600)).await;
        limiter.acquire().await;
        // Third slot opens when the first entry exits the window, not when
        // the whole window drains.
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
