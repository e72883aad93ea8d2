//! The x402r `refund` extension.
//!
//! A resource server that wants escrowed, refundable payments advertises the
//! extension on its route and points `payTo` at the merchant's relay proxy.
//! The client echoes the extension back in its payment payload, where the
//! facilitator reads it:
//!
//! ```json
//! "extensions": {
//!   "refund": {
//!     "info": {
//!       "factoryAddress": "0x41Cc4D337FEC5E91ddcf4C363700FC6dB5f3A814",
//!       "merchantPayouts": {
//!         "0x224d6e0fa6b803ce9edd863b0bbeb5dfd183de4f": "0x1234567890123456789012345678901234567890"
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! `merchantPayouts` maps relay proxy addresses to merchant payout addresses.
//! It may name proxies that are not deployed yet and is the only source of
//! truth for who owns such a relay. Once a relay is deployed its on-chain
//! state takes precedence over this map.

use std::collections::HashMap;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proto::{PaymentPayload, PaymentRequirements};

/// Key of the refund extension in `extensions` maps.
pub const REFUND_EXTENSION_KEY: &str = "refund";

/// Boolean marker placed in a payment option's `extra` to flag it as refundable.
pub const REFUNDABLE_MARKER_KEY: &str = "_x402rRefundable";

/// The `refund` extension as carried in a payment payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundExtension {
    /// Relay factory and proxy ownership metadata.
    pub info: RefundExtensionInfo,
}

/// Relay factory and proxy-to-merchant mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundExtensionInfo {
    /// Relay factory contract that deploys merchant proxies.
    pub factory_address: Address,

    /// Relay proxy address (as written by the server) to merchant payout address.
    #[serde(default)]
    pub merchant_payouts: HashMap<String, Address>,
}

/// Errors from reading the refund extension.
#[derive(Debug, thiserror::Error)]
pub enum RefundExtensionError {
    /// The extension is present but does not have the expected shape.
    #[error("malformed refund extension: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl RefundExtension {
    /// Reads the refund extension from a payment payload.
    ///
    /// Returns `Ok(None)` when the payload carries no refund extension.
    ///
    /// # Errors
    ///
    /// Returns [`RefundExtensionError::Malformed`] if the extension is present
    /// but cannot be decoded.
    pub fn from_payload(payload: &PaymentPayload) -> Result<Option<Self>, RefundExtensionError> {
        payload
            .extension(REFUND_EXTENSION_KEY)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(RefundExtensionError::from)
    }
}

impl RefundExtensionInfo {
    /// Looks up the merchant payout address declared for a relay proxy.
    ///
    /// The proxy is matched by exact key first, then case-insensitively, so
    /// checksummed and lowercase spellings of the same address both resolve.
    /// A zero payout address counts as absent.
    #[must_use]
    pub fn merchant_payout_for(&self, proxy: &str) -> Option<Address> {
        self.merchant_payouts
            .get(proxy)
            .or_else(|| {
                self.merchant_payouts
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(proxy))
                    .map(|(_, payout)| payout)
            })
            .copied()
            .filter(|payout| !payout.is_zero())
    }
}

/// Builds the `refund` extension value a route advertises.
///
/// `payouts` pairs each relay proxy address with its merchant payout address.
#[must_use]
pub fn declare_refund_extension(
    factory: Address,
    payouts: impl IntoIterator<Item = (Address, Address)>,
) -> Value {
    let info = RefundExtensionInfo {
        factory_address: factory,
        merchant_payouts: payouts
            .into_iter()
            .map(|(proxy, payout)| (proxy.to_checksum(None), payout))
            .collect(),
    };
    serde_json::json!({ "info": info })
}

/// Flags a payment option as eligible for escrow settlement.
///
/// Non-object `extra` values are replaced by an object holding only the marker.
pub fn mark_refundable(option: &mut PaymentRequirements) {
    if !option.extra.is_object() {
        option.extra = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(extra) = &mut option.extra {
        extra.insert(REFUNDABLE_MARKER_KEY.to_owned(), Value::Bool(true));
    }
}

/// Returns `true` if the option was flagged with [`mark_refundable`].
#[must_use]
pub fn is_refundable(option: &PaymentRequirements) -> bool {
    option
        .extra
        .get(REFUNDABLE_MARKER_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
