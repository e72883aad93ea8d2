//! Typed chain capabilities used by the settlement core.
//!
//! Each on-chain contract the settlement protocol touches gets its own trait
//! with typed method signatures. [`RelayChain`] bundles all of them and is
//! implemented automatically for any type that implements every capability.
//!
//! Implementations:
//! - [`AlloyRelayChain`](crate::provider::AlloyRelayChain) over an alloy provider with a wallet
//! - an in-memory scripted chain used by the unit tests

use std::future::Future;

use alloy_primitives::{Address, B256, Bytes, TxHash, U256};

use crate::error::ChainError;
use crate::signature::DecodedSignature;

/// Final status of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// The transaction executed successfully.
    Success,
    /// The transaction was mined but reverted.
    Reverted,
}

/// Arguments of `executeDeposit` on a relay proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositCall {
    /// Payer who signed the authorization.
    pub from: Address,
    /// Amount in the token's smallest unit.
    pub amount: U256,
    /// Authorization valid-after timestamp.
    pub valid_after: U256,
    /// Authorization valid-before timestamp.
    pub valid_before: U256,
    /// Authorization nonce.
    pub nonce: B256,
    /// Split ECDSA signature.
    pub signature: DecodedSignature,
}

/// Generic chain access: code probes, receipts and signer identities.
pub trait ChainClient: Send + Sync {
    /// Returns the bytecode at `address`. Empty bytes mean no contract.
    fn get_code(&self, address: Address) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    /// Waits for `tx` to be mined and returns its status.
    fn wait_for_receipt(
        &self,
        tx: TxHash,
    ) -> impl Future<Output = Result<ReceiptStatus, ChainError>> + Send;

    /// Addresses of the accounts paying for transactions.
    fn signer_addresses(&self) -> Vec<Address>;
}

/// The relay factory.
pub trait RelayFactory: Send + Sync {
    /// `getRelayAddress(merchant)`: the factory's own prediction of the relay address.
    fn get_relay_address(
        &self,
        factory: Address,
        merchant: Address,
    ) -> impl Future<Output = Result<Address, ChainError>> + Send;

    /// `deployRelay(merchant)`: submits the deployment and returns its hash.
    fn deploy_relay(
        &self,
        factory: Address,
        merchant: Address,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    /// `getCreateX()`: the `CreateX` deployer the factory uses.
    fn get_create_x(
        &self,
        factory: Address,
    ) -> impl Future<Output = Result<Address, ChainError>> + Send;
}

/// A merchant's relay proxy.
pub trait RelayProxy: Send + Sync {
    /// `MERCHANT_PAYOUT()`.
    fn merchant_payout(
        &self,
        proxy: Address,
    ) -> impl Future<Output = Result<Address, ChainError>> + Send;

    /// `TOKEN()`.
    fn token(&self, proxy: Address) -> impl Future<Output = Result<Address, ChainError>> + Send;

    /// `ESCROW()`.
    fn escrow(&self, proxy: Address) -> impl Future<Output = Result<Address, ChainError>> + Send;

    /// `executeDeposit(...)`: submits the deposit and returns its hash.
    fn execute_deposit(
        &self,
        proxy: Address,
        call: DepositCall,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;
}

/// The shared escrow.
pub trait Escrow: Send + Sync {
    /// `registeredMerchants(merchant)`.
    fn registered_merchants(
        &self,
        escrow: Address,
        merchant: Address,
    ) -> impl Future<Output = Result<bool, ChainError>> + Send;
}

/// An ERC-3009 token.
pub trait Token: Send + Sync {
    /// `authorizationState(authorizer, nonce)`: `true` once the nonce is used.
    fn authorization_state(
        &self,
        token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> impl Future<Output = Result<bool, ChainError>> + Send;
}

/// Everything the settlement executor needs from a chain.
pub trait RelayChain: ChainClient + RelayFactory + RelayProxy + Escrow + Token {}

impl<T> RelayChain for T where T: ChainClient + RelayFactory + RelayProxy + Escrow + Token {}
