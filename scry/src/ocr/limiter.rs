use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window rate limiter: at most `limit` admissions within any
/// trailing `window`, with no bucket-boundary bursts.
///
/// Admission timestamps are kept in a queue. An admission frees its slot
/// exactly `window` after it was granted, so waiters sleep until the oldest
/// recorded admission expires and then re-check.
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            admissions: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Wait until a slot is free inside the trailing window, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admissions = self.admissions.lock().await;
                let now = Instant::now();
                while admissions
                    .front()
                    .map_or(false, |&t| now.duration_since(t) >= self.window)
                {
                    admissions.pop_front();
                }
                if admissions.len() < self.limit {
                    admissions.push_back(now);
                    return;
                }
                match admissions.front() {
                    Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}
