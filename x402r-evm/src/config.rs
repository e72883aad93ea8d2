//! Settlement configuration.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! TOML input supports environment variable expansion in string values with
//! `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! receipt_timeout_secs = 30
//!
//! [read_retry]
//! max_retries = 5
//! base_delay_ms = 1000
//! max_delay_ms = 16000
//!
//! [deposit_retry]
//! max_attempts = 5
//! step_ms = 1000
//!
//! [deployment_poll]
//! attempts = 5
//! step_ms = 1000
//!
//! [deployer]
//! source = "fixed"
//! address = "$CREATEX_ADDRESS"
//! ```

use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::address::CREATEX_ADDRESS;

/// Top-level settlement configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Retry policy for rate-limited chain reads.
    pub read_retry: ReadRetryConfig,
    /// Retry policy for the deposit transaction.
    pub deposit_retry: DepositRetryConfig,
    /// Polling for relay code after a confirmed deployment.
    pub deployment_poll: DeploymentPollConfig,
    /// Where the `CreateX` deployer address comes from.
    pub deployer: DeployerSource,
    /// How long the alloy adapter waits for a receipt (default: 30).
    pub receipt_timeout_secs: ReceiptTimeout,
}

/// Exponential backoff for rate-limited reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadRetryConfig {
    /// Retries after the first attempt (default: 5).
    pub max_retries: u32,
    /// Delay before the first retry (default: 1000).
    pub base_delay_ms: u64,
    /// Upper bound of a single delay (default: 16000).
    pub max_delay_ms: u64,
}

impl Default for ReadRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
        }
    }
}

/// Linear backoff for the deposit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositRetryConfig {
    /// Total attempts, including the first (default: 5).
    pub max_attempts: u32,
    /// Delay unit; the delay after attempt `n` is `n * step_ms` (default: 1000).
    pub step_ms: u64,
}

impl Default for DepositRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step_ms: 1_000,
        }
    }
}

/// Code polling after a deployment receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentPollConfig {
    /// Total probes (default: 5).
    pub attempts: u32,
    /// Delay unit; the delay after probe `n` is `n * step_ms` (default: 1000).
    pub step_ms: u64,
}

impl Default for DeploymentPollConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            step_ms: 1_000,
        }
    }
}

impl DeploymentPollConfig {
    /// Delay after the probe numbered `attempt` (from 1).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.step_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Source of the `CreateX` deployer address used in relay address computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DeployerSource {
    /// A fixed address, the canonical `CreateX` deployment by default.
    Fixed {
        /// Deployer address.
        address: Address,
    },
    /// Ask each factory with `getCreateX()`.
    Factory,
}

impl Default for DeployerSource {
    fn default() -> Self {
        Self::Fixed {
            address: CREATEX_ADDRESS,
        }
    }
}

/// Receipt wait timeout in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptTimeout(pub u64);

impl Default for ReceiptTimeout {
    fn default() -> Self {
        Self(30)
    }
}

impl ReceiptTimeout {
    /// The timeout as a [`Duration`].
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl SettlementConfig {
    /// Parses a TOML document after expanding `$VAR` / `${VAR}` references.
    ///
    /// # Errors
    ///
    /// Returns an error if the expanded document is not valid configuration.
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(&expand_env_vars(input))
    }
}

/// Expands `$VAR` and `${VAR}` patterns in a string from environment variables.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    expand_vars(input, |name| std::env::var(name).ok())
}

fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.next_if_eq(&'{').is_some();
        let mut closed = false;
        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    closed = true;
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            var_name.push(c);
            chars.next();
        }

        let value = if var_name.is_empty() {
            None
        } else {
            lookup(&var_name)
        };
        if let Some(value) = value {
            result.push_str(&value);
        } else {
            // Leave unresolved variable as-is
            result.push('$');
            if braced {
                result.push('{');
            }
            result.push_str(&var_name);
            if closed {
                result.push('}');
            }
        }
    }

    result
}
