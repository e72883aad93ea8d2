//! Retry policies and the rate-limit-aware chain reader.
//!
//! Two independent policies bound a settlement attempt:
//!
//! - [`ReadRetryPolicy`]: exponential backoff, applied only to rate-limited
//!   reads. Any other read failure propagates immediately.
//! - [`DepositRetryPolicy`]: linear backoff for the deposit transaction,
//!   covering transient mempool and nonce races.
//!
//! Every wait races a [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{DepositRetryConfig, ReadRetryConfig};
use crate::error::{ChainError, SettlementError, is_rate_limited};

/// Exponential backoff for rate-limited reads.
///
/// The delay before retry `attempt` (numbered from 0) is
/// `min(base_delay * 2^attempt, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound of a single delay.
    pub max_delay: Duration,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        ReadRetryConfig::default().into()
    }
}

impl From<ReadRetryConfig> for ReadRetryPolicy {
    fn from(config: ReadRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReadRetryPolicy {
    /// Delay before the retry numbered `attempt`, counting from 0.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Linear backoff for the deposit transaction.
///
/// The delay after failed attempt `n` (numbered from 1) is `step * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositRetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay unit.
    pub step: Duration,
}

impl Default for DepositRetryPolicy {
    fn default() -> Self {
        DepositRetryConfig::default().into()
    }
}

impl From<DepositRetryConfig> for DepositRetryPolicy {
    fn from(config: DepositRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            step: Duration::from_millis(config.step_ms),
        }
    }
}

impl DepositRetryPolicy {
    /// Delay after the failed attempt numbered `attempt`, counting from 1.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt)
    }
}

/// Runs `fut` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`SettlementError::Cancelled`] if the token is cancelled first.
pub async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, SettlementError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SettlementError::Cancelled),
        output = fut => Ok(output),
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`SettlementError::Cancelled`] if the token is cancelled first.
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<(), SettlementError> {
    cancellable(cancel, tokio::time::sleep(duration)).await
}

/// Wraps chain reads with rate-limit detection and exponential backoff.
#[derive(Debug, Clone)]
pub struct ChainReader {
    policy: ReadRetryPolicy,
    cancel: CancellationToken,
}

impl ChainReader {
    /// Creates a reader bound to one settlement attempt.
    #[must_use]
    pub const fn new(policy: ReadRetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// The cancellation token of this attempt.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs `call`, retrying while it fails with a rate-limited error.
    ///
    /// At most `max_retries + 1` calls are made. `operation` names the read
    /// in logs and errors.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::ChainRead`] with the last error once the
    /// call fails for a reason other than rate limiting or retries run out,
    /// and [`SettlementError::Cancelled`] if cancelled.
    pub async fn read<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, SettlementError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut attempt = 0;
        loop {
            match cancellable(&self.cancel, call()).await? {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.policy.max_retries && is_rate_limited(&err) => {
                    let delay = self.policy.delay(attempt);
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Rate limited chain read, backing off"
                    );
                    sleep(&self.cancel, delay).await?;
                    attempt += 1;
                }
                Err(source) => return Err(SettlementError::ChainRead { operation, source }),
            }
        }
    }
}
