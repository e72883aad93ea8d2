//! Alloy-backed chain capabilities.
//!
//! [`AlloyRelayChain`] implements every trait in [`crate::chain`] over an
//! alloy provider that can sign transactions. Contract calls go through the
//! `sol!` bindings in [`crate::contract`]; all alloy errors are converted to
//! [`ChainError`] so rate limits and revert data survive.

use std::time::Duration;

use alloy_network::{Ethereum, EthereumWallet, NetworkWallet, ReceiptResponse};
use alloy_primitives::{Address, B256, Bytes, TxHash};
use alloy_provider::fillers::{
    BlobGasFiller, CachedNonceManager, ChainIdFiller, FillProvider, GasFiller, JoinFill,
    NonceFiller, WalletFiller,
};
use alloy_provider::{
    Identity, PendingTransactionBuilder, Provider, ProviderBuilder, RootProvider, WalletProvider,
};
use url::Url;

use crate::chain::{
    ChainClient, DepositCall, Escrow, ReceiptStatus, RelayFactory, RelayProxy, Token,
};
use crate::config::ReceiptTimeout;
use crate::contract::{IEip3009, IEscrow, IRelayFactory, IRelayProxy};
use crate::error::ChainError;

/// Gas, blob gas, nonce and chain ID fillers.
pub type RelayFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<CachedNonceManager>, ChainIdFiller>>,
>;

/// HTTP provider with [`RelayFiller`] and an [`EthereumWallet`].
pub type HttpRelayProvider = FillProvider<
    JoinFill<JoinFill<Identity, RelayFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// Chain capabilities over an alloy provider with a wallet.
#[derive(Debug, Clone)]
pub struct AlloyRelayChain<P> {
    provider: P,
    receipt_timeout: Duration,
}

impl<P> AlloyRelayChain<P> {
    /// Wraps `provider`. Receipt waits give up after `receipt_timeout`.
    pub const fn new(provider: P, receipt_timeout: ReceiptTimeout) -> Self {
        Self {
            provider,
            receipt_timeout: receipt_timeout.as_duration(),
        }
    }

    /// The underlying provider.
    pub const fn provider(&self) -> &P {
        &self.provider
    }
}

impl AlloyRelayChain<HttpRelayProvider> {
    /// Connects to an HTTP JSON-RPC endpoint, signing with `wallet`.
    ///
    /// # Errors
    ///
    /// Returns an error if the wallet has no signers.
    pub fn connect_http(
        url: Url,
        wallet: EthereumWallet,
        receipt_timeout: ReceiptTimeout,
    ) -> Result<Self, ChainError> {
        let signers = NetworkWallet::<Ethereum>::signer_addresses(&wallet).collect::<Vec<_>>();
        if signers.is_empty() {
            return Err(ChainError::new("at least one signer must be provided"));
        }

        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(
                    NonceFiller::new(CachedNonceManager::default()),
                    ChainIdFiller::default(),
                ),
            ),
        );
        let provider: HttpRelayProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_http(url);

        #[cfg(feature = "telemetry")]
        tracing::info!(signers = ?signers, "Using relay chain provider");

        Ok(Self::new(provider, receipt_timeout))
    }
}

impl<P: Provider + WalletProvider> ChainClient for AlloyRelayChain<P> {
    async fn get_code(&self, address: Address) -> Result<Bytes, ChainError> {
        Ok(self.provider.get_code_at(address).await?)
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<ReceiptStatus, ChainError> {
        let receipt = PendingTransactionBuilder::new(self.provider.root().clone(), tx)
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await?;
        if ReceiptResponse::status(&receipt) {
            Ok(ReceiptStatus::Success)
        } else {
            Ok(ReceiptStatus::Reverted)
        }
    }

    fn signer_addresses(&self) -> Vec<Address> {
        self.provider.signer_addresses().collect()
    }
}

impl<P: Provider + WalletProvider> RelayFactory for AlloyRelayChain<P> {
    async fn get_relay_address(
        &self,
        factory: Address,
        merchant: Address,
    ) -> Result<Address, ChainError> {
        let factory = IRelayFactory::new(factory, &self.provider);
        Ok(factory.getRelayAddress(merchant).call().await?)
    }

    async fn deploy_relay(
        &self,
        factory: Address,
        merchant: Address,
    ) -> Result<TxHash, ChainError> {
        let factory = IRelayFactory::new(factory, &self.provider);
        let pending = factory.deployRelay(merchant).send().await?;
        Ok(*pending.tx_hash())
    }

    async fn get_create_x(&self, factory: Address) -> Result<Address, ChainError> {
        let factory = IRelayFactory::new(factory, &self.provider);
        Ok(factory.getCreateX().call().await?)
    }
}

impl<P: Provider + WalletProvider> RelayProxy for AlloyRelayChain<P> {
    async fn merchant_payout(&self, proxy: Address) -> Result<Address, ChainError> {
        let proxy = IRelayProxy::new(proxy, &self.provider);
        Ok(proxy.MERCHANT_PAYOUT().call().await?)
    }

    async fn token(&self, proxy: Address) -> Result<Address, ChainError> {
        let proxy = IRelayProxy::new(proxy, &self.provider);
        Ok(proxy.TOKEN().call().await?)
    }

    async fn escrow(&self, proxy: Address) -> Result<Address, ChainError> {
        let proxy = IRelayProxy::new(proxy, &self.provider);
        Ok(proxy.ESCROW().call().await?)
    }

    async fn execute_deposit(
        &self,
        proxy: Address,
        call: DepositCall,
    ) -> Result<TxHash, ChainError> {
        let proxy = IRelayProxy::new(proxy, &self.provider);
        let pending = proxy
            .executeDeposit(
                call.from,
                call.amount,
                call.valid_after,
                call.valid_before,
                call.nonce,
                call.signature.v,
                call.signature.r,
                call.signature.s,
            )
            .send()
            .await?;
        Ok(*pending.tx_hash())
    }
}

impl<P: Provider + WalletProvider> Escrow for AlloyRelayChain<P> {
    async fn registered_merchants(
        &self,
        escrow: Address,
        merchant: Address,
    ) -> Result<bool, ChainError> {
        let escrow = IEscrow::new(escrow, &self.provider);
        Ok(escrow.registeredMerchants(merchant).call().await?)
    }
}

impl<P: Provider + WalletProvider> Token for AlloyRelayChain<P> {
    async fn authorization_state(
        &self,
        token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> Result<bool, ChainError> {
        let token = IEip3009::new(token, &self.provider);
        Ok(token.authorizationState(authorizer, nonce).call().await?)
    }
}
