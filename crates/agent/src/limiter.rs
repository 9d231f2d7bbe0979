//! Sliding-window admission control for outbound model calls.
//!
//! One limiter instance is shared process-wide by injection; every
//! outbound model call acquires from it regardless of which run issued
//! the call. Check-then-record happens under a single lock acquisition so
//! concurrent acquirers cannot oversubscribe the budget.

use std::collections::VecDeque;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

pub struct RateLimiter {
    window_ms: i64,
    max_requests: i64,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// A `window_ms` of zero or less disables throttling entirely;
    /// `max_requests` of zero or less means unlimited. Negative values
    /// are accepted as-is and behave as "never throttle".
    pub fn new(window_ms: i64, max_requests: i64) -> Self {
        Self { window_ms, max_requests, admitted: Mutex::new(VecDeque::new()) }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Admit one request, sleeping until the window has room. Returns the
    /// total time spent waiting.
    pub async fn acquire(&self) -> Duration {
        if self.window_ms <= 0 || self.max_requests <= 0 {
            return Duration::ZERO;
        }

        let window = Duration::from_millis(self.window_ms as u64);
        let started = Instant::now();

        loop {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();

                while let Some(oldest) = admitted.front() {
                    if now.duration_since(*oldest) >= window {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }

                if (admitted.len() as i64) < self.max_requests {
                    admitted.push_back(now);
                    return started.elapsed();
                }

                // Full window: wait exactly until the oldest retained
                // admission ages out, then re-evaluate.
                let oldest = *admitted.front().expect("window is full, front exists");
                window - now.duration_since(oldest)
            };

            sleep(wait).await;
        }
    }
}
