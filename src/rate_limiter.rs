//! Quota-unit token bucket for mailbox calls
//!
//! Gmail meters each user in quota units per second (250 by default). Every
//! method has a fixed unit price; the client charges the bucket before each
//! request and waits when the bucket is dry.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Mailbox operations and their quota-unit price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    ListMessages,
    GetMessage,
    ListLabels,
    GetLabel,
    CreateLabel,
    ModifyMessage,
}

impl QuotaCost {
    pub fn units(self) -> u32 {
        match self {
            QuotaCost::ListLabels | QuotaCost::GetLabel => 1,
            QuotaCost::ListMessages
            | QuotaCost::GetMessage
            | QuotaCost::CreateLabel
            | QuotaCost::ModifyMessage => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaStats {
    pub units_consumed: u64,
    pub calls: u64,
    /// Calls that had to wait for the bucket to refill
    pub throttled_calls: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    per_second: f64,
    refilled_at: Instant,
    stats: QuotaStats,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
        self.refilled_at = now;
    }

    /// Take `units` now, or report how long until they will be there
    fn take(&mut self, units: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= units {
            self.tokens -= units;
            None
        } else {
            let missing = units - self.tokens;
            Some(Duration::from_secs_f64(missing / self.per_second))
        }
    }
}

/// Shared handle; clones draw from the same bucket
#[derive(Debug, Clone)]
pub struct QuotaRateLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

impl QuotaRateLimiter {
    /// `per_second` units refill rate, `burst` units capacity (starts full)
    pub fn new(per_second: f64, burst: f64) -> Self {
        let per_second = per_second.max(1.0);
        // Capacity must cover the priciest call
        let capacity = burst.max(QuotaCost::GetMessage.units() as f64);
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                per_second,
                refilled_at: Instant::now(),
                stats: QuotaStats::default(),
            })),
        }
    }

    /// Wait until `cost` units are available and consume them
    pub async fn acquire(&self, cost: QuotaCost) {
        let units = cost.units() as f64;
        let mut throttled = false;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.take(units, Instant::now()) {
                    None => {
                        bucket.stats.units_consumed += cost.units() as u64;
                        bucket.stats.calls += 1;
                        if throttled {
                            bucket.stats.throttled_calls += 1;
                        }
                        trace!("{:?}: {:.1} quota units left", cost, bucket.tokens);
                        return;
                    }
                    Some(wait) => wait,
                }
            };

            throttled = true;
            debug!("Quota exhausted, waiting {:?} for {:?}", wait, cost);
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn stats(&self) -> QuotaStats {
        self.bucket.lock().await.stats
    }
}

impl Default for QuotaRateLimiter {
    fn default() -> Self {
        Self::new(250.0, 500.0)
    }
}
