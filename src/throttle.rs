//! Token-bucket rate limiting for connection admission and message sending.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Keep the table from growing without bound: once it passes this size,
/// full (idle) buckets are dropped on the next check.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket throttle keyed by string (peer address or user id).
///
/// Each key starts with `burst` tokens and refills continuously at `rate`
/// tokens per `window`, capped at `burst`. A successful check consumes one
/// token.
#[derive(Debug)]
pub struct Throttle {
    rate: f64,
    burst: f64,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Throttle {
    pub fn new(rate: u32, burst: u32, window: Duration) -> Self {
        Self {
            rate: f64::from(rate),
            burst: f64::from(burst),
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether an event for `key` is allowed. Returns `true` if allowed
    /// (consuming a token), `false` if rate limited.
    ///
    /// If the throttle table is unavailable this fails open with a logged
    /// warning: a legitimate request is never dropped because of an
    /// infrastructure error.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(error = %poisoned, "throttle table unavailable, failing open");
                return true;
            }
        };

        if buckets.len() > PRUNE_THRESHOLD {
            // Stored token counts are stale until a key is checked again, so
            // the refill has to be applied here for idle buckets to read as
            // full and get dropped.
            let window = self.window.as_secs_f64();
            buckets.retain(|k, b| {
                if k == key {
                    return true;
                }
                let elapsed = now.duration_since(b.last_refill).as_secs_f64();
                b.tokens + elapsed / window * self.rate < self.burst
            });
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refill = elapsed / self.window.as_secs_f64() * self.rate;
        bucket.tokens = (bucket.tokens + refill).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_honored_then_limited() {
        let throttle = Throttle::new(1, 3, Duration::from_secs(60));
        assert!(throttle.check("key"));
        assert!(throttle.check("key"));
        assert!(throttle.check("key"));
        assert!(!throttle.check("key"));
    }

    #[test]
    fn one_window_refills_exactly_one_token() {
        let throttle = Throttle::new(1, 3, Duration::from_millis(50));
        for _ in 0..3 {
            assert!(throttle.check("key"));
        }
        assert!(!throttle.check("key"));

        std::thread::sleep(Duration::from_millis(60));

        assert!(throttle.check("key"));
        assert!(!throttle.check("key"));
    }

    #[test]
    fn keys_are_independent() {
        let throttle = Throttle::new(1, 1, Duration::from_secs(60));
        assert!(throttle.check("a"));
        assert!(!throttle.check("a"));
        assert!(throttle.check("b"));
    }

    #[test]
    fn prune_drops_idle_refilled_buckets() {
        // One-shot keys are the norm for an address-keyed throttle; once
        // their buckets have had time to refill they must be prunable, or
        // the table grows without bound.
        let throttle = Throttle::new(1, 1, Duration::from_millis(1));
        for i in 0..=PRUNE_THRESHOLD {
            throttle.check(&format!("a-{i}"));
        }
        std::thread::sleep(Duration::from_millis(10));

        for i in 0..100 {
            throttle.check(&format!("b-{i}"));
        }

        let len = throttle.buckets.lock().unwrap().len();
        assert!(len <= 200, "bucket table not pruned, {len} entries");
    }

    #[test]
    fn tokens_cap_at_burst() {
        let throttle = Throttle::new(10, 2, Duration::from_millis(10));
        assert!(throttle.check("key"));
        assert!(throttle.check("key"));
        std::thread::sleep(Duration::from_millis(100));
        // Long idle period refills to burst, not beyond.
        assert!(throttle.check("key"));
        assert!(throttle.check("key"));
        assert!(!throttle.check("key"));
    }
}
