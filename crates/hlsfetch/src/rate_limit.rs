//! Process-wide download rate limiting.
//!
//! One [`SpeedLimiter`] is shared by every in-flight segment read across all
//! tasks, so hundreds of concurrent HTTP reads aggregate to a single global
//! bytes-per-second budget. Tokens are minted continuously and consumed in
//! small 64-byte granules ahead of each read, which keeps the realized rate
//! close to the configured one even under heavy fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Bytes acquired per token operation. Small granules trade a little lock
/// traffic for rate precision under many concurrent readers.
const GRANULARITY: usize = 64;

/// Lowest effective rate; configured rates below this are raised to it.
const MIN_RATE_BYTES_PER_SEC: u64 = 640;

/// Floor on one wait so the timer wheel is not hammered with sub-millisecond
/// sleeps; tokens keep accruing while asleep, so throughput is unaffected.
const MIN_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct Bucket {
    /// Bytes minted per second.
    rate: f64,
    /// Currently available bytes.
    tokens: f64,
    /// Burst ceiling: a quarter second worth of budget.
    max_tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            tokens: 0.0,
            max_tokens: (rate / 4.0).max(GRANULARITY as f64),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Global token-bucket byte-rate limiter.
///
/// A rate of zero disables the limiter entirely: the fast path is a single
/// relaxed atomic load and reads pass through untouched. Disabling also
/// broadcasts a wakeup so readers blocked mid-acquire exit their waits
/// immediately instead of sleeping out their deficit.
#[derive(Debug)]
pub struct SpeedLimiter {
    bucket: Mutex<Option<Bucket>>,
    enabled: AtomicBool,
    changed: Notify,
}

impl SpeedLimiter {
    fn lock_bucket(&self) -> std::sync::MutexGuard<'_, Option<Bucket>> {
        self.bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a disabled limiter.
    pub fn new() -> Self {
        Self {
            bucket: Mutex::new(None),
            enabled: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// Reconfigure the shared budget in KB/s. Zero disables.
    ///
    /// Setting the same value again still rebuilds the bucket, which doubles
    /// as a forced refresh for readers stuck on a stale deficit.
    pub fn set(&self, kb_per_sec: u64) {
        if kb_per_sec == 0 {
            let was_enabled = self.enabled.swap(false, Ordering::SeqCst);
            *self.lock_bucket() = None;
            if was_enabled {
                debug!("download rate limit disabled");
            }
            self.changed.notify_waiters();
            return;
        }

        let rate = (kb_per_sec * 1024).max(MIN_RATE_BYTES_PER_SEC) as f64;
        *self.lock_bucket() = Some(Bucket::new(rate));
        self.enabled.store(true, Ordering::SeqCst);
        debug!(
            kb_per_sec,
            granularity = GRANULARITY,
            "download rate limit configured"
        );
        self.changed.notify_waiters();
    }

    /// Whether a budget is currently enforced.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Block until `amount` bytes of budget are available.
    ///
    /// Returns immediately when the limiter is disabled, including when it
    /// gets disabled while this call is waiting.
    pub async fn acquire(&self, amount: usize) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        let mut remaining = amount;
        while remaining > 0 {
            if !self.enabled.load(Ordering::Relaxed) {
                return;
            }

            let wait = {
                let mut guard = self.lock_bucket();
                match guard.as_mut() {
                    None => return,
                    Some(bucket) => {
                        bucket.refill();
                        // Consume whole granules while the budget lasts.
                        loop {
                            if remaining == 0 {
                                break None;
                            }
                            let chunk = remaining.min(GRANULARITY);
                            if bucket.tokens >= chunk as f64 {
                                bucket.tokens -= chunk as f64;
                                remaining -= chunk;
                            } else {
                                let deficit = chunk as f64 - bucket.tokens;
                                let delay = Duration::from_secs_f64(deficit / bucket.rate);
                                break Some(delay.max(MIN_WAIT));
                            }
                        }
                    }
                }
            };

            if let Some(delay) = wait {
                tokio::select! {
                    // Reconfigured or disabled: loop around and re-check.
                    _ = self.changed.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

impl Default for SpeedLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn disabled_limiter_is_transparent() {
        let limiter = SpeedLimiter::new();
        let start = std::time::Instant::now();
        limiter.acquire(10 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_paces_to_the_configured_rate() {
        let limiter = SpeedLimiter::new();
        limiter.set(1024); // 1 MiB/s

        let start = Instant::now();
        limiter.acquire(1024 * 1024).await;
        let elapsed = start.elapsed();

        // One MiB at one MiB/s starting from an empty bucket: about one
        // second of virtual time.
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1300), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn shared_readers_split_the_budget() {
        let limiter = Arc::new(SpeedLimiter::new());
        limiter.set(1024); // 1 MiB/s shared

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(256 * 1024).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let elapsed = start.elapsed();

        // Four readers pulling 256 KiB each from a 1 MiB/s bucket still take
        // about a second in aggregate.
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test]
    async fn disabling_wakes_blocked_readers() {
        let limiter = Arc::new(SpeedLimiter::new());
        limiter.set(1); // effectively 1 KB/s: a large acquire would take ages

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.acquire(10 * 1024 * 1024).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.set(0);

        // The blocked reader must exit promptly once the budget is lifted.
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("reader did not wake after disable")
            .unwrap();
        assert!(!limiter.is_enabled());
    }

    #[tokio::test]
    async fn raising_the_rate_wakes_blocked_readers() {
        let limiter = Arc::new(SpeedLimiter::new());
        limiter.set(1);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.acquire(512 * 1024).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.set(1024 * 1024); // effectively unconstrained for this acquire

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("reader did not pick up the new rate")
            .unwrap();
    }
}
