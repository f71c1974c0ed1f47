//! Retry policy shared by the fetch engine and the persistence gateway.
//!
//! Dispatch rules, by [`Failure`] variant:
//!
//! - `RateLimited { wait }`: sleep exactly `wait` and issue the identical
//!   request again. Does not count against the attempt budget.
//! - `Transient`: exponential backoff with jitter, capped at `max_delay_ms`,
//!   at most `max_attempts` attempts in total. Exhaustion is reported as
//!   `Fatal`.
//! - `Validation` / `Fatal`: returned immediately.

use crate::error::Failure;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// Backoff settings for transient failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for an operation failing transiently (>= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomization factor in [0, 1): each delay is drawn from
    /// `interval * [1 - jitter, 1 + jitter]`
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Returns a description of the first invalid setting, if any.
    pub fn check(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("base_delay_ms must not exceed max_delay_ms".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be >= 1.0".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err("jitter must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

/// Executes fallible async operations according to [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Fresh backoff state for one operation.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.base_delay())
            .with_max_interval(self.config.max_delay())
            .with_multiplier(self.config.multiplier)
            .with_randomization_factor(self.config.jitter)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Next transient-failure delay, never above `max_delay`.
    pub fn next_delay(&self, backoff: &mut ExponentialBackoff) -> Duration {
        backoff
            .next_backoff()
            .unwrap_or_else(|| self.config.max_delay())
            .min(self.config.max_delay())
    }

    /// Run `op` until it succeeds or fails non-retryably.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        self.execute(operation, None, op).await
    }

    /// Like [`RetryPolicy::run`], but every attempt holds a permit from `gate`.
    ///
    /// The permit is kept while serving a rate-limit wait, so no other holder
    /// of the gate talks to the source during a flood wait. It is released
    /// during transient backoff.
    pub async fn run_gated<T, F, Fut>(
        &self,
        operation: &str,
        gate: &Semaphore,
        op: F,
    ) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        self.execute(operation, Some(gate), op).await
    }

    async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        gate: Option<&Semaphore>,
        mut op: F,
    ) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut backoff = self.backoff();
        let mut failures = 0u32;

        loop {
            let permit = match gate {
                Some(gate) => Some(
                    gate.acquire()
                        .await
                        .map_err(|_| Failure::fatal("session gate closed"))?,
                ),
                None => None,
            };

            match op().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(operation, failures, "Operation recovered after retries");
                    }
                    return Ok(value);
                }
                Err(Failure::RateLimited { wait }) => {
                    metrics::counter!("medlens.retry.rate_limited").increment(1);
                    warn!(
                        operation,
                        wait_secs = wait.as_secs(),
                        "Rate limited, waiting before repeating the request"
                    );
                    tokio::time::sleep(wait).await;
                    drop(permit);
                }
                Err(Failure::Transient(message)) => {
                    drop(permit);
                    failures += 1;
                    metrics::counter!("medlens.retry.transient").increment(1);

                    if failures >= self.config.max_attempts {
                        error!(
                            operation,
                            attempts = failures,
                            error = %message,
                            "Retries exhausted"
                        );
                        return Err(Failure::Fatal(format!(
                            "{} failed after {} attempts: {}",
                            operation, failures, message
                        )));
                    }

                    let delay = self.next_delay(&mut backoff);
                    warn!(
                        operation,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
