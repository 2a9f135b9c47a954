//! Bounded (or unbounded) retry with capped exponential backoff.
//!
//! One policy type is shared by every stage that retries: ledger reconnects,
//! reconciliation, and bus publishes. Each stage only decides which of its
//! errors are worth retrying via [`Transient`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Classifies an error as retryable.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Outcome of a retried operation along with how many attempts it took.
#[derive(Debug)]
pub struct Attempted<V> {
    pub attempts: u32,
    pub value: V,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(3, Duration::from_millis(200), Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_backoff,
            max_backoff,
            multiplier: 2,
            jitter: true,
        }
    }

    pub fn unbounded(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff,
            max_backoff,
            multiplier: 2,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt may follow `failures` failed ones.
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }

    /// Upper bound of the delay after `failures` consecutive failures (1-based).
    pub fn nominal_backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1);
        let factor = u128::from(self.multiplier.max(1))
            .checked_pow(exp)
            .unwrap_or(u128::MAX);
        let nanos = self
            .initial_backoff
            .as_nanos()
            .saturating_mul(factor)
            .min(self.max_backoff.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Delay to sleep after `failures` consecutive failures, jittered if enabled.
    pub fn backoff(&self, failures: u32) -> Duration {
        let nominal = self.nominal_backoff(failures);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let half = nominal / 2;
        let spread = (nominal - half).as_nanos() as u64;
        half + Duration::from_nanos(rand::thread_rng().gen_range(0..=spread))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<Attempted<T>, Attempted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            match op(attempt).await {
                Ok(value) => {
                    return Ok(Attempted {
                        attempts: attempt,
                        value,
                    });
                }
                Err(error) if error.is_transient() && self.allows_retry(attempt) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(attempt, ?delay, %error, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(Attempted {
                        attempts: attempt,
                        value: error,
                    });
                }
            }
        }
    }
}
