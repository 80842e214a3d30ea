//! Token-bucket rate limiter.
//!
//! Grounded in `original_source/src/network/rate_limiter.{hpp,cpp}`'s
//! `RateLimiter`/`RateLimiterManager` pair: a mutex-guarded bucket with an
//! atomic token count and grant-timestamp queue, refilled proportionally to
//! elapsed time, plus a registry keyed by tenant (there: exchange name).
//! The blocking `Acquire`/`AcquireWithTimeout` pair becomes `tokio::sync::Notify`
//! instead of `condition_variable` so waiters can be cancelled without
//! poisoning the bucket for everyone else.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Snapshot of a bucket's atomic counters. Resetting statistics
/// (`reset_statistics`) does not touch `tokens` or the grant-timestamp
/// queue -- only these counters.
#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RateLimiterStats {
        let total = self.total.load(Ordering::Relaxed);
        let admitted = self.admitted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let rejection_rate = if total == 0 {
            0.0
        } else {
            rejected as f64 / total as f64
        };
        RateLimiterStats {
            total,
            admitted,
            rejected,
            rejection_rate,
        }
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.admitted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimiterStats {
    pub total: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub rejection_rate: f64,
}

struct BucketState {
    capacity: u32,
    window: Duration,
    tokens: f64,
    last_refill: Instant,
    grants: VecDeque<Instant>,
}

impl BucketState {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            tokens: capacity as f64,
            last_refill: Instant::now(),
            grants: VecDeque::new(),
        }
    }

    /// Refills proportionally to elapsed fraction of the window; a full
    /// window produces a full refill.
    fn refill(&mut self, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed >= self.window {
            self.tokens = self.capacity as f64;
            self.last_refill = now;
            return;
        }
        if self.window.is_zero() {
            return;
        }
        let fraction = elapsed.as_secs_f64() / self.window.as_secs_f64();
        let added = self.capacity as f64 * fraction;
        if added > 0.0 {
            self.tokens = (self.tokens + added).min(self.capacity as f64);
            self.last_refill = now;
        }
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        while let Some(front) = self.grants.front() {
            if *front < cutoff {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.prune(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.grants.push_back(now);
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        self.prune(now);
        match self.grants.front() {
            Some(oldest) => {
                let next = *oldest + self.window;
                next.saturating_duration_since(now)
            }
            None => Duration::ZERO,
        }
    }

    fn observed_rate(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.window.is_zero() {
            return 0.0;
        }
        self.grants.len() as f64 / self.window.as_secs_f64()
    }
}

/// A single tenant's token bucket.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    counters: Counters,
    notify: Notify,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState::new(capacity, window)),
            counters: Counters::default(),
            notify: Notify::new(),
        }
    }

    /// Non-blocking admission check.
    pub fn try_acquire(&self) -> bool {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let admitted = {
            let mut state = self.state.lock();
            let was_full_refill = {
                let elapsed = now.saturating_duration_since(state.last_refill);
                elapsed >= state.window && state.window > Duration::ZERO
            };
            let ok = state.try_take(now);
            if was_full_refill {
                self.notify.notify_waiters();
            }
            ok
        };
        if admitted {
            self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Blocks until a token is available. A `N=0` bucket is a permanent
    /// reject: returns `false` immediately rather than blocking forever.
    pub async fn acquire(&self) -> bool {
        loop {
            if self.capacity_is_zero() {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            let notified = self.notify.notified();
            if self.try_acquire() {
                return true;
            }
            // Re-test after the wait: a waiter woken by a refill must
            // observe at least one token, but if another waiter raced us
            // the token may already be gone -- loop and re-check.
            let wait = {
                let mut state = self.state.lock();
                state.time_until_next_token(Instant::now())
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
            }
        }
    }

    /// Blocks until a token is available or `deadline` elapses.
    pub async fn acquire_with_deadline(&self, deadline: Instant) -> bool {
        loop {
            if Instant::now() >= deadline {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if self.capacity_is_zero() {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            let notified = self.notify.notified();
            if self.try_acquire() {
                return true;
            }
            let wait = {
                let mut state = self.state.lock();
                state.time_until_next_token(Instant::now())
            }
            .max(Duration::from_millis(1));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait.min(remaining)) => {}
            }
        }
    }

    fn capacity_is_zero(&self) -> bool {
        self.state.lock().capacity == 0
    }

    /// Atomically replaces `(capacity, window)`, clamping current tokens to
    /// the new capacity.
    pub fn reconfigure(&self, capacity: u32, window: Duration) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        state.window = window;
        state.tokens = state.tokens.min(capacity as f64);
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.counters.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.counters.reset();
    }

    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens
    }

    pub fn observed_rate(&self) -> f64 {
        self.state.lock().observed_rate(Instant::now())
    }

    pub fn time_until_next_token(&self) -> Duration {
        self.state.lock().time_until_next_token(Instant::now())
    }
}

/// Multi-tenant registry, the Rust analogue of `RateLimiterManager`.
pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    default_capacity: u32,
    default_window: Duration,
}

impl RateLimiterRegistry {
    pub fn new(default_capacity: u32, default_window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            default_capacity,
            default_window,
        }
    }

    /// Returns the bucket for `tenant_id`, creating one with the registry's
    /// default configuration if absent.
    pub fn bucket(&self, tenant_id: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(self.default_capacity, self.default_window))
            })
            .clone()
    }

    pub fn configure_tenant(&self, tenant_id: &str, capacity: u32, window: Duration) {
        let bucket = self.bucket(tenant_id);
        bucket.reconfigure(capacity, window);
    }

    pub fn try_acquire(&self, tenant_id: &str) -> bool {
        self.bucket(tenant_id).try_acquire()
    }

    pub fn tenants(&self) -> Vec<String> {
        self.buckets.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_admits_up_to_capacity_then_rejects() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        let stats = bucket.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.rejected, 1);
        assert!((stats.rejection_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn zero_capacity_is_permanent_reject() {
        let bucket = TokenBucket::new(0, Duration::from_secs(1));
        assert!(!bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn reconfigure_clamps_tokens_to_new_capacity() {
        let bucket = TokenBucket::new(10, Duration::from_secs(60));
        assert_eq!(bucket.available_tokens() as u32, 10);
        bucket.reconfigure(4, Duration::from_secs(60));
        assert!(bucket.available_tokens() <= 4.0);
    }

    #[test]
    fn reset_statistics_preserves_bucket_state() {
        let bucket = TokenBucket::new(2, Duration::from_secs(60));
        bucket.try_acquire();
        bucket.try_acquire();
        bucket.try_acquire(); // rejected
        bucket.reset_statistics();
        let stats = bucket.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.admitted, 0);
        assert_eq!(stats.rejected, 0);
        // bucket state (tokens) is independent of counters
        assert!(bucket.available_tokens() < 2.0);
    }

    #[tokio::test]
    async fn acquire_with_deadline_times_out_without_side_effects() {
        let bucket = TokenBucket::new(0, Duration::from_secs(1));
        let deadline = Instant::now() + Duration::from_millis(20);
        let ok = bucket.acquire_with_deadline(deadline).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn acquire_on_zero_capacity_bucket_is_a_permanent_reject() {
        let bucket = TokenBucket::new(0, Duration::from_secs(1));
        let ok = tokio::time::timeout(Duration::from_millis(50), bucket.acquire())
            .await
            .expect("acquire must resolve immediately rather than hang");
        assert!(!ok);
    }

    #[tokio::test]
    async fn acquire_unblocks_after_refill() {
        let bucket = Arc::new(TokenBucket::new(1, Duration::from_millis(50)));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        let b2 = bucket.clone();
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_millis(500);
            b2.acquire_with_deadline(deadline).await
        });
        let ok = handle.await.unwrap();
        assert!(ok);
    }

    #[test]
    fn registry_creates_independent_buckets_per_tenant() {
        let registry = RateLimiterRegistry::new(2, Duration::from_secs(60));
        assert!(registry.try_acquire("binance"));
        assert!(registry.try_acquire("binance"));
        assert!(!registry.try_acquire("binance"));
        // A different tenant has its own bucket.
        assert!(registry.try_acquire("kraken"));
    }
}
