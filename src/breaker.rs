use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected at the gate without invoking the wrapped call.
    #[error("circuit breaker is open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

/// Three-state circuit breaker shared by the workers of one process.
///
/// All state lives in atomics; the `open -> half-open` transition is a
/// compare-and-swap so exactly one caller wins the probe after the
/// cool-down, and everyone else keeps getting rejected until the probe
/// resolves the state.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    failures: AtomicU32,
    last_failure_nanos: AtomicU64,
    state: AtomicU8,
    origin: Instant,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            failures: AtomicU32::new(0),
            last_failure_nanos: AtomicU64::new(0),
            state: AtomicU8::new(CLOSED),
            origin: Instant::now(),
        }
    }

    /// Run `f` behind the gate. A gate refusal surfaces as
    /// [`BreakerError::Open`] and records no new failure.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute() {
            return Err(BreakerError::Open);
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == OPEN
    }

    fn can_execute(&self) -> bool {
        match self.state.load(Ordering::SeqCst) {
            CLOSED => true,
            OPEN => {
                let last = Duration::from_nanos(self.last_failure_nanos.load(Ordering::SeqCst));
                if self.origin.elapsed().saturating_sub(last) > self.reset_timeout {
                    // Winner of the CAS gets the single probe attempt.
                    self.state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                } else {
                    false
                }
            }
            HALF_OPEN => false,
            _ => false,
        }
    }

    fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_failure_nanos
            .store(self.origin.elapsed().as_nanos() as u64, Ordering::SeqCst);

        if self
            .state
            .compare_exchange(HALF_OPEN, OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
        if failures >= self.max_failures {
            self.state.store(OPEN, Ordering::SeqCst);
        }
    }

    fn record_success(&self) {
        if self
            .state
            .compare_exchange(HALF_OPEN, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.failures.store(0, Ordering::SeqCst);
        }
    }
}
