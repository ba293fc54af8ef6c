use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};
use typed_builder::TypedBuilder;

#[derive(Error, Debug, Clone)]
#[error("log stream closed")]
pub struct Closed;

/// Backpressure knobs for the append path. The in-flight limit and the
/// write-rate limit are independent; either alone can delay an append.
#[derive(Debug, Clone, TypedBuilder)]
pub struct FlowControlOptions {
    #[builder(default = 1024)]
    pub max_inflight_appends: usize,

    /// Admitted appends per second; unlimited when unset or zero.
    #[builder(default = None)]
    pub max_appends_per_second: Option<u32>,
}

impl Default for FlowControlOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct TokenBucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u32) -> Self {
        Self {
            rate: rate as f64,
            // A full one-second burst to start with.
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token, or reports how long to wait before retrying.
    fn try_take(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
        }
    }
}

/// Held by an admitted append until it is durable (or dropped on
/// failure); releasing it frees in-flight capacity.
pub struct AppendPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct FlowControl {
    inflight: Arc<Semaphore>,
    rate: Option<Mutex<TokenBucket>>,
}

impl FlowControl {
    pub fn new(options: &FlowControlOptions) -> Self {
        Self {
            inflight: Arc::new(Semaphore::new(options.max_inflight_appends)),
            rate: options
                .max_appends_per_second
                .filter(|&r| r > 0)
                .map(|r| Mutex::new(TokenBucket::new(r))),
        }
    }

    /// Admits one append, suspending (not thread blocking) until both
    /// the rate window and the in-flight budget allow it.
    pub async fn admit(&self) -> Result<AppendPermit, Closed> {
        if let Some(bucket) = &self.rate {
            loop {
                let wait = bucket.lock().try_take();
                match wait {
                    None => break,
                    Some(d) => tokio::time::sleep(d).await,
                }
            }
        }

        let permit = self
            .inflight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Closed)?;

        Ok(AppendPermit { _permit: permit })
    }

    /// Wakes all waiters with `Closed`. Idempotent.
    pub fn close(&self) {
        self.inflight.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inflight_limit() {
        let fc = FlowControl::new(&FlowControlOptions::builder().max_inflight_appends(2).build());

        let p1 = fc.admit().await.unwrap();
        let _p2 = fc.admit().await.unwrap();

        // Third admit must wait until a permit is released.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), fc.admit()).await;
        assert!(blocked.is_err());

        drop(p1);
        let p3 = tokio::time::timeout(Duration::from_millis(50), fc.admit()).await;
        assert!(p3.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delays() {
        let fc = FlowControl::new(
            &FlowControlOptions::builder()
                .max_appends_per_second(Some(10))
                .build(),
        );

        // Drain the initial burst.
        for _ in 0..10 {
            drop(fc.admit().await.unwrap());
        }

        let start = Instant::now();
        drop(fc.admit().await.unwrap());
        // One more token takes ~100ms at 10/s.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_zero_rate_admits_without_limit() {
        let fc = FlowControl::new(
            &FlowControlOptions::builder()
                .max_appends_per_second(Some(0))
                .build(),
        );

        for _ in 0..100 {
            drop(fc.admit().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let fc = Arc::new(FlowControl::new(
            &FlowControlOptions::builder().max_inflight_appends(1).build(),
        ));
        let held = fc.admit().await.unwrap();

        let fc2 = fc.clone();
        let waiter = tokio::spawn(async move { fc2.admit().await });

        fc.close();
        assert!(waiter.await.unwrap().is_err());
        drop(held);
    }
}
