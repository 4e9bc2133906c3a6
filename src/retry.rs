//! Bounded exponential-backoff retry shared by the LLM and census clients.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::RequestConfig;
use crate::error::{DataSourceError, LlmError};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// Whether the failed call may be retried.
    fn is_retryable(&self) -> bool;

    /// Minimum wait requested by the remote side, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        LlmError::is_retryable(self)
    }
}

impl Retryable for DataSourceError {
    fn is_retryable(&self) -> bool {
        DataSourceError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DataSourceError::Throttled { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was not retryable; returned as-is.
    Fatal(E),
    /// Every attempt failed.
    Exhausted { last: E, retries: u32 },
}

/// Retry schedule: `max_retries` extra attempts, delay doubling from `base_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with an explicit budget.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Build the policy from request configuration.
    pub fn from_config(config: &RequestConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.retry_delay_ms))
    }

    /// Maximum number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(retry - 1);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `call` until it succeeds, fails fatally, or the budget is spent.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut retries = 0;
        let mut wait = Duration::ZERO;

        loop {
            if retries > 0 {
                let delay = self.delay_for(retries).max(wait);
                warn!(
                    operation = %operation,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match call().await {
                Ok(value) => {
                    info!(
                        operation = %operation,
                        latency_ms = start.elapsed().as_millis(),
                        "Request succeeded"
                    );
                    return Ok(value);
                }
                Err(e) => {
                    error!(
                        operation = %operation,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Request failed"
                    );
                    if !e.is_retryable() {
                        return Err(RetryError::Fatal(e));
                    }
                    if retries >= self.max_retries {
                        return Err(RetryError::Exhausted { last: e, retries });
                    }
                    wait = e.retry_after().unwrap_or(Duration::ZERO);
                    retries += 1;
                }
            }
        }
    }
}
