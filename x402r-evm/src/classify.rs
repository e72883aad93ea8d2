//! Turning opaque deposit failures into actionable descriptions.
//!
//! A failed `executeDeposit` usually surfaces as a nested RPC error. The
//! [`ErrorClassifier`] runs a chain of [`FailureClassifier`]s over it, in
//! order, and uses the first description one of them produces. If none
//! matches, a fallback explains which causes earlier settlement steps have
//! already ruled out. Classification never fails.

use std::error::Error;
use std::fmt::{self, Debug};

use alloy_primitives::Bytes;
use alloy_sol_types::{Revert, SolError};
use alloy_transport::TransportError;

use crate::error::{ChainError, is_rate_limited, revert_reason_from_message};

/// Placeholder some nodes report instead of a real reason.
const GENERIC_REVERT: &str = "execution reverted";

/// Description used when no classifier matches.
pub const FALLBACK_DESCRIPTION: &str = "executeDeposit reverted without a decodable reason. \
     The relay proxy was readable, the merchant is registered with the escrow and the \
     authorization nonce is unused, so the failure is inside the deposit call chain: \
     receiveWithAuthorization on the token (signature, validity window or balance) or \
     the deposit note on the escrow";

/// One step of the classification chain.
pub trait FailureClassifier: Send + Sync {
    /// Returns a description if this classifier recognizes `err`.
    fn classify(&self, err: &(dyn Error + 'static)) -> Option<String>;
}

/// Recognizes rate limiting that outlived the retry policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitClassifier;

impl FailureClassifier for RateLimitClassifier {
    fn classify(&self, err: &(dyn Error + 'static)) -> Option<String> {
        is_rate_limited(err).then(|| format!("RPC provider kept rate limiting the deposit: {err}"))
    }
}

/// Uses a structured revert reason found anywhere in the cause chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevertReasonClassifier;

impl FailureClassifier for RevertReasonClassifier {
    fn classify(&self, err: &(dyn Error + 'static)) -> Option<String> {
        causes(err).find_map(|e| {
            let reason = e.downcast_ref::<ChainError>().map_or_else(
                || revert_reason_from_message(&e.to_string()).map(str::to_owned),
                |chain| chain.revert_reason().map(str::to_owned),
            )?;
            let reason = reason.trim();
            (!reason.is_empty() && !reason.eq_ignore_ascii_case(GENERIC_REVERT))
                .then(|| reason.to_owned())
        })
    }
}

/// Decodes an ABI-encoded `Error(string)` from revert data in the cause chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbiErrorStringClassifier;

impl FailureClassifier for AbiErrorStringClassifier {
    fn classify(&self, err: &(dyn Error + 'static)) -> Option<String> {
        causes(err).find_map(|e| revert_data(e).and_then(|data| decode_error_string(&data)))
    }
}

/// Ordered chain of [`FailureClassifier`]s with a fixed fallback.
pub struct ErrorClassifier {
    classifiers: Vec<Box<dyn FailureClassifier>>,
}

impl Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("classifiers", &self.classifiers.len())
            .finish()
    }
}

impl Default for ErrorClassifier {
    /// Rate limit, then revert reason, then ABI-decoded `Error(string)`.
    fn default() -> Self {
        Self {
            classifiers: vec![
                Box::new(RateLimitClassifier),
                Box::new(RevertReasonClassifier),
                Box::new(AbiErrorStringClassifier),
            ],
        }
    }
}

impl ErrorClassifier {
    /// Creates a classifier running `classifiers` in order.
    #[must_use]
    pub fn new(classifiers: Vec<Box<dyn FailureClassifier>>) -> Self {
        Self { classifiers }
    }

    /// Describes `err` with the first matching classifier, or the fallback.
    #[must_use]
    pub fn describe(&self, err: &(dyn Error + 'static)) -> String {
        self.classifiers
            .iter()
            .find_map(|classifier| classifier.classify(err))
            .unwrap_or_else(|| FALLBACK_DESCRIPTION.to_owned())
    }
}

fn causes<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    let mut next = Some(err);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.source();
        Some(current)
    })
}

fn revert_data(err: &(dyn Error + 'static)) -> Option<Bytes> {
    if let Some(chain) = err.downcast_ref::<ChainError>() {
        return chain.data().cloned();
    }
    if let Some(transport) = err.downcast_ref::<TransportError>() {
        return transport
            .as_error_resp()
            .and_then(alloy_json_rpc::ErrorPayload::as_revert_data);
    }
    err.downcast_ref::<alloy_contract::Error>()
        .and_then(alloy_contract::Error::as_revert_data)
}

/// Decodes `Error(string)` revert data, dropping trailing NUL padding.
fn decode_error_string(data: &[u8]) -> Option<String> {
    let revert = Revert::abi_decode(data).ok()?;
    let reason = revert.reason.trim_end_matches('\0').trim();
    (!reason.is_empty()).then(|| reason.to_owned())
}
