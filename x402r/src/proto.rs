//! V2 wire types for x402 payments that may carry the `refund` extension.
//!
//! All types serialize to JSON using camelCase field names. Only the V2
//! protocol (CAIP-2 network identifiers, `accepted` requirements embedded in
//! the payload) can carry extensions, so V1 shapes are not modelled here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// A CAIP-2 network identifier such as `eip155:8453`.
pub type Network = String;

/// Protocol extension data attached to x402 wire types.
///
/// Keys are extension names; values are arbitrary JSON data specific to each extension.
pub type Extensions = HashMap<String, Value>;

/// Describes the resource being accessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// The URL of the resource.
    pub url: String,

    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional MIME type of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// V2 payment requirements: one payment option offered by a resource server.
///
/// For escrow settlement `pay_to` is the merchant's relay proxy, not the
/// merchant payout address.
///
/// ```json
/// {
///   "scheme": "exact",
///   "network": "eip155:8453",
///   "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
///   "amount": "1000000",
///   "payTo": "0x...",
///   "maxTimeoutSeconds": 300,
///   "extra": {}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme identifier (e.g., "exact").
    pub scheme: String,

    /// CAIP-2 network identifier (e.g., "eip155:8453").
    pub network: Network,

    /// Asset address (e.g., USDC contract address).
    pub asset: String,

    /// Amount in smallest unit (e.g., "1000000" for 1 USDC).
    pub amount: String,

    /// Recipient address.
    pub pay_to: String,

    /// Maximum time in seconds for payment validity.
    pub max_timeout_seconds: u64,

    /// Additional scheme-specific data (e.g., EIP-712 domain params).
    #[serde(default = "default_empty_object")]
    pub extra: Value,
}

/// V2 payment payload sent by the client to fulfil a payment requirement.
///
/// ```json
/// {
///   "x402Version": 2,
///   "payload": { "authorization": {...}, "signature": "0x..." },
///   "accepted": { "scheme": "exact", "network": "eip155:8453", ... },
///   "extensions": { "refund": { "info": {...} } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version (always 2 for V2).
    #[serde(default = "default_v2")]
    pub x402_version: u32,

    /// Scheme-specific payload data.
    pub payload: Value,

    /// The payment requirements being fulfilled.
    pub accepted: PaymentRequirements,

    /// Optional resource information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,

    /// Optional extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

impl PaymentPayload {
    /// Returns the extension value registered under `key`, if any.
    #[must_use]
    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.as_ref().and_then(|e| e.get(key))
    }
}

/// Response from a successful settlement.
///
/// Failed settlements never produce a response; the hook aborts instead.
/// Serialized in the flat wire form with `"success": true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleResponse {
    /// The address that paid.
    pub payer: String,
    /// The on-chain transaction hash.
    pub transaction: String,
    /// The network where settlement occurred.
    pub network: Network,
    /// Optional protocol extensions returned by the facilitator.
    pub extensions: Option<Extensions>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire<'a> {
    success: bool,
    payer: &'a str,
    transaction: &'a str,
    network: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions: Option<&'a Extensions>,
}

impl Serialize for SettleResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        SettleResponseWire {
            success: true,
            payer: &self.payer,
            transaction: &self.transaction,
            network: &self.network,
            extensions: self.extensions.as_ref(),
        }
        .serialize(serializer)
    }
}

const fn default_v2() -> u32 {
    2
}

fn default_empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
