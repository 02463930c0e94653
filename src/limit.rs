use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("rate limiter wait cancelled")]
    Cancelled,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter in front of every external listing call.
///
/// Refills at `rate` tokens per second up to `burst`; `acquire` suspends
/// until a token is available or the caller is cancelled.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            rate: rate_per_sec as f64,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LimitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(LimitError::Cancelled);
            }
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(LimitError::Cancelled),
            }
        }
    }
}
