#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EIP-155 (EVM) escrow relay settlement for the x402r refund extension.
//!
//! A payment carrying the `refund` extension pays a merchant's relay proxy
//! instead of the merchant. The proxy lives at an address derived from the
//! factory, the merchant payout address and the `CreateX` deployer, so a
//! route can advertise it before it exists. On settlement this crate deploys
//! the proxy when needed, checks that the payment is bound to it, and calls
//! `executeDeposit` to move the authorized funds into escrow.
//!
//! # Architecture
//!
//! - [`address`] - Deterministic relay address computation
//! - [`signature`] - Splitting authorization signatures into `(v, r, s)`
//! - [`chain`] - Typed capability traits for every contract touched
//! - [`provider`] - Alloy-backed implementation of the capabilities
//! - [`retry`] - Read and deposit retry policies, cancellation helpers
//! - [`deploy`] - On-demand relay deployment
//! - [`classify`] - Describing failed deposits
//! - [`settle`] - The settlement state machine
//! - [`hook`] - A settle hook embedding the executor in a facilitator
//! - [`config`] - Settlement configuration
//!
//! # Feature Flags
//!
//! - `telemetry` - Tracing spans around chain calls and settlement events

/// Awaits a future, optionally instrumenting it with a tracing span.
macro_rules! traced {
    ($fut:expr, $span:expr) => {{
        #[cfg(feature = "telemetry")]
        {
            use tracing::Instrument;
            $fut.instrument($span).await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            $fut.await
        }
    }};
}

pub mod address;
pub mod chain;
pub mod classify;
pub mod config;
pub mod contract;
pub mod deploy;
pub mod error;
pub mod hook;
pub mod provider;
pub mod retry;
pub mod settle;
pub mod signature;
pub mod types;

#[cfg(test)]
mod testing;

pub use address::{CREATEX_ADDRESS, compute_relay_address};
pub use config::SettlementConfig;
pub use error::{ChainError, SettlementError, SettlementErrorKind};
pub use hook::RefundSettleHook;
pub use provider::AlloyRelayChain;
pub use settle::{SettlementExecutor, SettlementOutcome, SettlementReceipt};
