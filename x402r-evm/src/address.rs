//! Deterministic relay proxy addresses.
//!
//! The relay factory deploys each merchant's proxy through the `CreateX`
//! `deployCreate3` entry point, so the proxy address depends only on the
//! deployer and the salt, never on bytecode. The salt is derived from the
//! factory and merchant payout addresses, which lets anyone predict a
//! merchant's relay before it exists:
//!
//! 1. `salt = keccak256(abi.encodePacked(factory, merchantPayout))`
//! 2. `guardedSalt = keccak256(abi.encode(salt))` (`CreateX` salt guarding)
//! 3. `proxy = create2(deployer, guardedSalt, CREATE3_PROXY_INITCODE_HASH)`
//! 4. `relay = create(proxy, nonce = 1)`

use std::str::FromStr;

use alloy_primitives::{Address, B256, address, b256, keccak256};

use crate::error::SettlementError;

/// Canonical `CreateX` deployer, identical on every supported chain.
pub const CREATEX_ADDRESS: Address = address!("0xba5Ed099633D3B313e4D5F7bdc1305d3c28ba5Ed");

/// `keccak256` of the minimal CREATE3 proxy init code used by `CreateX`.
pub const CREATE3_PROXY_INITCODE_HASH: B256 =
    b256!("0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f");

/// Computes the relay proxy address the factory will deploy for `merchant`.
#[must_use]
pub fn compute_relay_address(deployer: Address, factory: Address, merchant: Address) -> Address {
    let salt = keccak256([factory.as_slice(), merchant.as_slice()].concat());
    let guarded_salt = keccak256(salt);
    let create3_proxy = deployer.create2(guarded_salt, CREATE3_PROXY_INITCODE_HASH);
    create3_proxy.create(1)
}

/// Parses an address in any casing, with or without the `0x` prefix.
///
/// # Errors
///
/// Returns [`SettlementError::InvalidAddress`] if `value` is not 20 hex bytes.
pub fn parse_address(value: &str) -> Result<Address, SettlementError> {
    Address::from_str(value.trim()).map_err(|e| SettlementError::invalid_address(value, e))
}

/// String-input variant of [`compute_relay_address`].
///
/// Inputs are parsed before hashing, so checksummed, lowercase and uppercase
/// spellings of the same address give the same result.
///
/// # Errors
///
/// Returns [`SettlementError::InvalidAddress`] for the first malformed input.
pub fn compute_relay_address_str(
    deployer: &str,
    factory: &str,
    merchant: &str,
) -> Result<Address, SettlementError> {
    Ok(compute_relay_address(
        parse_address(deployer)?,
        parse_address(factory)?,
        parse_address(merchant)?,
    ))
}
