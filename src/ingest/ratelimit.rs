//! Two-limiter concurrency discipline for the history fan-out (spec.md §4.5.2, §5).
//!
//! The sliding-window shape is `cooprefr-bettersys::middleware::rate_limit`
//! generalized from per-IP state to one shared global limiter; the
//! exponential backoff with jitter is
//! `cooprefr-bettersys::scrapers::binance_session::BackoffCalculator`
//! reused almost unchanged. Both are cross-checked against the numbers in
//! `original_source/src/mkts_backend/esi/async_history.py`:
//! `AsyncLimiter(300, 60.0)`, `Semaphore(50)`, `uniform(0, 0.05)` jitter,
//! `backoff.expo` capped at `max_time=180`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const WINDOW_MAX_REQUESTS: usize = 300;
const WINDOW: Duration = Duration::from_secs(60);
const MAX_IN_FLIGHT: usize = 50;
const PREFLIGHT_JITTER_MAX_MS: u64 = 50;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_MAX_TOTAL: Duration = Duration::from_secs(180);

/// Sliding-window limiter: at most `WINDOW_MAX_REQUESTS` grants per rolling
/// `WINDOW`. Blocks (cooperatively) until a slot frees up.
pub struct RateLimiter {
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::with_capacity(WINDOW_MAX_REQUESTS)),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut ts = self.timestamps.lock();
                let now = Instant::now();
                while ts.front().is_some_and(|t| now.duration_since(*t) >= WINDOW) {
                    ts.pop_front();
                }
                if ts.len() < WINDOW_MAX_REQUESTS {
                    ts.push_back(now);
                    None
                } else {
                    let oldest = *ts.front().expect("len >= max implies non-empty");
                    Some(WINDOW.saturating_sub(now.duration_since(oldest)))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds simultaneous in-flight requests at `MAX_IN_FLIGHT`.
pub fn concurrency_semaphore() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(MAX_IN_FLIGHT))
}

/// Pre-flight jitter in `[0, PREFLIGHT_JITTER_MAX_MS]` ms, to avoid
/// synchronized bursts across concurrently scheduled requests.
pub fn preflight_jitter() -> Duration {
    Duration::from_millis(rand::random::<u64>() % (PREFLIGHT_JITTER_MAX_MS + 1))
}

/// Exponential backoff with jitter, bounded at `BACKOFF_MAX_TOTAL` total
/// elapsed wall time across all attempts for one logical request.
pub struct Backoff {
    attempt: u32,
    started: Instant,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
        }
    }

    /// Returns `None` once the cumulative backoff budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= BACKOFF_MAX_TOTAL {
            return None;
        }
        let base_ms = (BACKOFF_BASE_MS as f64) * BACKOFF_MULTIPLIER.powi(self.attempt as i32);
        let jitter = rand::random::<f64>() * base_ms * 0.3;
        self.attempt += 1;
        Some(Duration::from_millis((base_ms + jitter) as u64))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP status codes that are permanent failures for a single type_id's
/// history fetch — give up immediately, no retry, per spec.md §4.5.2.
pub fn is_permanent_status(status: u16) -> bool {
    matches!(status, 400 | 403 | 404)
}
