//! Rate limiting with sliding-window and token-bucket algorithms
//!
//! Two algorithms, same acquire contract:
//!
//! 1. **Sliding window**: counts request timestamps in the last N seconds.
//!    Simple and effective for per-minute API quotas.
//! 2. **Token bucket**: tokens replenish continuously, allowing controlled
//!    bursts while maintaining an average rate.
//!
//! `acquire` returns `false` on timeout, never errors. [`MultiLimiter`]
//! composes several limiters that must all admit.
//!
//! # Example
//!
//! ```no_run
//! use lumen_core_resilience::SlidingWindowLimiter;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let limiter = SlidingWindowLimiter::per_minute(60);
//! if limiter.acquire(Some(Duration::from_secs(30))).await {
//!     // make the call
//! }
//! # }
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Snapshot of a limiter's state
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStats {
    pub current_usage: usize,
    pub max_allowed: usize,
    pub window: Duration,
    pub total_acquired: u64,
    pub total_waited: u64,
}

/// Common acquire contract shared by all limiter shapes
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take one slot without waiting
    fn try_acquire(&self) -> bool;

    /// Take one slot, waiting up to `timeout` (forever when `None`).
    /// Returns `false` on timeout.
    async fn acquire(&self, timeout: Option<Duration>) -> bool;
}

struct WindowState {
    timestamps: VecDeque<Instant>,
    total_acquired: u64,
    total_waited: u64,
}

/// Sliding window rate limiter.
///
/// Tracks request timestamps and admits at most `max_requests` per window.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(WindowState {
                timestamps: VecDeque::new(),
                total_acquired: 0,
                total_waited: 0,
            }),
        }
    }

    pub fn per_second(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    fn evict_expired(state: &mut WindowState, window: Duration, now: Instant) {
        while let Some(front) = state.timestamps.front() {
            if now.duration_since(*front) >= window {
                state.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of requests currently inside the window
    pub fn current_usage(&self) -> usize {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        Self::evict_expired(&mut state, self.window, Instant::now());
        state.timestamps.len()
    }

    /// Time until a slot frees up (zero when one is free now)
    pub fn time_until_available(&self) -> Duration {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let now = Instant::now();
        Self::evict_expired(&mut state, self.window, now);

        if state.timestamps.len() < self.max_requests {
            return Duration::ZERO;
        }
        match state.timestamps.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        Self::evict_expired(&mut state, self.window, Instant::now());
        RateLimitStats {
            current_usage: state.timestamps.len(),
            max_allowed: self.max_requests,
            window: self.window,
            total_acquired: state.total_acquired,
            total_waited: state.total_waited,
        }
    }

    /// Drop all tracked timestamps
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        state.timestamps.clear();
        debug!("rate limiter reset");
    }

    /// Blocking acquire for synchronous callers (worker threads, CLIs).
    /// Never call from an async context; use [`RateLimiter::acquire`].
    pub fn acquire_blocking(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();

        loop {
            if self.try_acquire() {
                return true;
            }

            let mut wait = self.time_until_available();
            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed + wait > timeout {
                    return false;
                }
                wait = wait.min(timeout - elapsed);
            }

            if !wait.is_zero() {
                self.note_wait();
            }
            std::thread::sleep(wait + Duration::from_millis(10));
        }
    }

    fn note_wait(&self) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        state.total_waited += 1;
    }

    /// Try to take one slot without waiting
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let now = Instant::now();
        Self::evict_expired(&mut state, self.window, now);

        if state.timestamps.len() >= self.max_requests {
            return false;
        }
        state.timestamps.push_back(now);
        state.total_acquired += 1;
        true
    }

    /// Take one slot, waiting up to `timeout` (forever when `None`).
    /// Returns `false` on timeout.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();

        loop {
            if self.try_acquire() {
                return true;
            }

            let mut wait = self.time_until_available();
            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed + wait > timeout {
                    return false;
                }
                wait = wait.min(timeout - elapsed);
            }

            if !wait.is_zero() {
                self.note_wait();
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    max_requests = self.max_requests,
                    "rate limit reached, waiting"
                );
            }
            // Small buffer so the oldest timestamp has actually expired
            tokio::time::sleep(wait + Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn try_acquire(&self) -> bool {
        SlidingWindowLimiter::try_acquire(self)
    }

    async fn acquire(&self, timeout: Option<Duration>) -> bool {
        SlidingWindowLimiter::acquire(self, timeout).await
    }
}

struct BucketState {
    tokens: f64,
    last_update: Instant,
    total_acquired: u64,
    total_waited: u64,
}

/// Token bucket rate limiter.
///
/// Tokens replenish continuously at `rate` per second up to `burst`.
/// Each acquire consumes tokens, allowing bursts while holding the average.
pub struct TokenBucketLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_update: Instant::now(),
                total_acquired: 0,
                total_waited: 0,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_update = now;
    }

    /// Current token count after refill
    pub fn current_tokens(&self) -> f64 {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        self.refill(&mut state);
        state.tokens
    }

    /// Time until `tokens` are available
    pub fn time_until_tokens(&self, tokens: u32) -> Duration {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        self.refill(&mut state);
        if state.tokens >= tokens as f64 {
            return Duration::ZERO;
        }
        let needed = tokens as f64 - state.tokens;
        Duration::from_secs_f64(needed / self.rate)
    }

    /// Try to consume `tokens` without waiting
    pub fn try_acquire_n(&self, tokens: u32) -> bool {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        self.refill(&mut state);
        if state.tokens >= tokens as f64 {
            state.tokens -= tokens as f64;
            state.total_acquired += tokens as u64;
            return true;
        }
        false
    }

    /// Blocking acquire for synchronous callers
    pub fn acquire_blocking(&self, tokens: u32, timeout: Option<Duration>) -> bool {
        let started = Instant::now();

        loop {
            if self.try_acquire_n(tokens) {
                return true;
            }

            let mut wait = self.time_until_tokens(tokens);
            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed + wait > timeout {
                    return false;
                }
                wait = wait.min(timeout - elapsed);
            }

            if !wait.is_zero() {
                let mut state = self.state.lock().expect("limiter lock poisoned");
                state.total_waited += 1;
            }
            std::thread::sleep(wait + Duration::from_millis(1));
        }
    }

    /// Consume `tokens`, waiting up to `timeout`
    pub async fn acquire_n(&self, tokens: u32, timeout: Option<Duration>) -> bool {
        let started = Instant::now();

        loop {
            if self.try_acquire_n(tokens) {
                return true;
            }

            let mut wait = self.time_until_tokens(tokens);
            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed + wait > timeout {
                    return false;
                }
                wait = wait.min(timeout - elapsed);
            }

            if !wait.is_zero() {
                let mut state = self.state.lock().expect("limiter lock poisoned");
                state.total_waited += 1;
            }
            tokio::time::sleep(wait + Duration::from_millis(1)).await;
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        self.refill(&mut state);
        RateLimitStats {
            current_usage: (self.burst - state.tokens).round() as usize,
            max_allowed: self.burst as usize,
            window: Duration::from_secs_f64(self.burst / self.rate),
            total_acquired: state.total_acquired,
            total_waited: state.total_waited,
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    async fn acquire(&self, timeout: Option<Duration>) -> bool {
        self.acquire_n(1, timeout).await
    }
}

/// Composite limiter for multiple simultaneous limits.
///
/// All children must admit within the shared timeout budget, e.g. 10/s AND
/// 100/min against the same backend.
pub struct MultiLimiter {
    limiters: Vec<std::sync::Arc<dyn RateLimiter>>,
}

impl MultiLimiter {
    pub fn new(limiters: Vec<std::sync::Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }

    /// Acquire from every child; the timeout budget is shared across them
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();

        for limiter in &self.limiters {
            let remaining = match timeout {
                Some(t) => {
                    let elapsed = started.elapsed();
                    if elapsed >= t {
                        return false;
                    }
                    Some(t - elapsed)
                }
                None => None,
            };

            if !limiter.acquire(remaining).await {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sliding_window_admits_up_to_max() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.current_usage(), 3);
    }

    #[tokio::test]
    async fn test_sliding_window_evicts_old() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(30));

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_sliding_window_acquire_timeout_returns_false() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.acquire(Some(Duration::from_millis(20))).await);

        // Window is full for a minute; a short timeout must fail, not hang
        let admitted = limiter.acquire(Some(Duration::from_millis(20))).await;
        assert!(!admitted);
    }

    #[tokio::test]
    async fn test_sliding_window_acquire_waits_for_slot() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(40));
        assert!(limiter.try_acquire());

        let started = Instant::now();
        let admitted = limiter.acquire(Some(Duration::from_secs(2))).await;
        assert!(admitted);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_sliding_window_time_until_available() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert_eq!(limiter.time_until_available(), Duration::ZERO);

        assert!(limiter.try_acquire());
        let wait = limiter.time_until_available();
        assert!(wait > Duration::from_secs(55) && wait <= Duration::from_secs(60));
    }

    #[test]
    fn test_sliding_window_reset() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        limiter.reset();
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_sliding_window_stats() {
        let limiter = SlidingWindowLimiter::per_minute(10);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());

        let stats = limiter.stats();
        assert_eq!(stats.current_usage, 2);
        assert_eq!(stats.max_allowed, 10);
        assert_eq!(stats.total_acquired, 2);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_refill() {
        let limiter = TokenBucketLimiter::new(100.0, 3);

        assert!(limiter.try_acquire_n(3));
        assert!(!limiter.try_acquire_n(1));

        // 100 tokens/sec refills one within ~10ms
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.try_acquire_n(1));
    }

    #[tokio::test]
    async fn test_token_bucket_acquire_timeout() {
        let limiter = TokenBucketLimiter::new(0.5, 1);
        assert!(limiter.try_acquire_n(1));

        // Next token takes 2s; 30ms timeout must fail
        assert!(!limiter.acquire_n(1, Some(Duration::from_millis(30))).await);
    }

    #[tokio::test]
    async fn test_token_bucket_multi_token_acquire() {
        let limiter = TokenBucketLimiter::new(1000.0, 10);
        assert!(limiter.acquire_n(5, Some(Duration::from_secs(1))).await);
        assert!(limiter.acquire_n(5, Some(Duration::from_secs(1))).await);
    }

    #[test]
    fn test_token_bucket_time_until_tokens() {
        let limiter = TokenBucketLimiter::new(2.0, 2);
        assert!(limiter.try_acquire_n(2));

        let wait = limiter.time_until_tokens(1);
        assert!(wait > Duration::from_millis(200) && wait <= Duration::from_millis(600));
    }

    #[test]
    fn test_blocking_acquire() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(30));
        assert!(limiter.acquire_blocking(Some(Duration::from_millis(5))));
        // Second slot frees after the window slides
        assert!(limiter.acquire_blocking(Some(Duration::from_secs(2))));

        let bucket = TokenBucketLimiter::new(0.5, 1);
        assert!(bucket.acquire_blocking(1, Some(Duration::from_millis(5))));
        assert!(!bucket.acquire_blocking(1, Some(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn test_multi_limiter_requires_all() {
        let tight: Arc<dyn RateLimiter> = Arc::new(SlidingWindowLimiter::new(1, Duration::from_secs(60)));
        let loose: Arc<dyn RateLimiter> = Arc::new(SlidingWindowLimiter::new(100, Duration::from_secs(60)));
        let multi = MultiLimiter::new(vec![tight, loose]);

        assert!(multi.acquire(Some(Duration::from_millis(20))).await);
        // Tight child is exhausted for the rest of the window
        assert!(!multi.acquire(Some(Duration::from_millis(20))).await);
    }
}
