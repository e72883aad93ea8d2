#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the x402r refund extension.
//!
//! x402r routes an x402 payment into an escrow instead of straight to the
//! merchant. The merchant is represented on-chain by a relay proxy, deployed
//! on demand at a deterministic address, which forwards each signed
//! ERC-3009 authorization into a shared escrow contract.
//!
//! This crate is chain-agnostic. It holds the wire types exchanged between
//! buyers, sellers and facilitators, the `refund` extension metadata, and the
//! seams a facilitator uses to embed escrow settlement. The EVM settlement
//! core lives in `x402r-evm`.
//!
//! # Modules
//!
//! - [`proto`] - V2 payment payload, requirements and settle response types
//! - [`timestamp`] - String-encoded Unix timestamps for authorization windows
//! - [`extension`] - The `refund` extension and route-side "refundable" marker
//! - [`hooks`] - Settle hooks for embedding escrow settlement in a facilitator
//! - [`cache`] - Bounded, nonce-keyed cache of settlement results
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation

pub mod cache;
pub mod extension;
pub mod hooks;
pub mod proto;
pub mod timestamp;
