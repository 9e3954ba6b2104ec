//! Token-bucket rate limiting for broker traffic, split by traffic class per
//! §5 of the specification: order-class (submits/cancels) and info-class
//! (polling) have independent budgets so a burst of one never starves the
//! other.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_sec: u32) -> Self {
        let rate = rate_per_sec.max(1) as f64;
        Self {
            capacity: rate,
            tokens: rate,
            refill_per_sec: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn wait_estimate(&self) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::from_millis(50);
        }
        Duration::from_secs_f64((1.0 - self.tokens.max(0.0)) / self.refill_per_sec)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrafficClass {
    Order,
    Info,
}

pub struct RateLimiter {
    order_bucket: Mutex<Bucket>,
    info_bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(order_per_sec: u32, info_per_sec: u32) -> Self {
        Self {
            order_bucket: Mutex::new(Bucket::new(order_per_sec)),
            info_bucket: Mutex::new(Bucket::new(info_per_sec)),
        }
    }

    /// Blocks until a token of the given class is available.
    pub async fn acquire(&self, class: TrafficClass) {
        let bucket = match class {
            TrafficClass::Order => &self.order_bucket,
            TrafficClass::Info => &self.info_bucket,
        };
        loop {
            let wait = {
                let mut b = bucket.lock().await;
                if b.try_take() {
                    return;
                }
                b.wait_estimate()
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
