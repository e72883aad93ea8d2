//! On-demand relay proxy deployment.
//!
//! A merchant's relay is deployed lazily the first time a payment is settled
//! through it. Before spending gas the deployer checks that the factory
//! predicts the same address this crate computes. After the deployment is
//! confirmed it polls until code is visible at the relay address, since some
//! networks expose new code a few blocks after the receipt.

use std::error::Error;

use alloy_primitives::{Address, TxHash};
use x402r::extension::RefundExtensionInfo;

use crate::address::compute_relay_address;
use crate::chain::{ReceiptStatus, RelayChain};
use crate::config::DeploymentPollConfig;
use crate::error::SettlementError;
use crate::retry::{ChainReader, cancellable, sleep};

/// Provider message fragments meaning the signer cannot pay for gas.
const INSUFFICIENT_FUNDS_MARKERS: [&str; 3] = [
    "insufficient funds",
    "insufficient balance",
    "gas required exceeds",
];

/// A relay proxy known to have code on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployedRelay {
    /// Relay proxy address.
    pub proxy: Address,
    /// Escrow the proxy deposits into.
    pub escrow: Address,
}

/// The relay a payment settles through, with its merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRelay {
    /// Relay proxy address.
    pub proxy: Address,
    /// Escrow the proxy deposits into.
    pub escrow: Address,
    /// Merchant payout address the proxy serves.
    pub merchant_payout: Address,
}

/// Verifies relay proxies exist and deploys them when they do not.
#[derive(Debug)]
pub struct RelayDeployer<'a, C> {
    chain: &'a C,
    reader: &'a ChainReader,
    poll: DeploymentPollConfig,
}

impl<'a, C: RelayChain> RelayDeployer<'a, C> {
    /// Creates a deployer for one settlement attempt.
    #[must_use]
    pub const fn new(chain: &'a C, reader: &'a ChainReader, poll: DeploymentPollConfig) -> Self {
        Self {
            chain,
            reader,
            poll,
        }
    }

    /// Returns `true` if `address` holds contract code.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::ChainRead`] if the probe fails.
    pub async fn has_code(&self, address: Address) -> Result<bool, SettlementError> {
        let code = self
            .reader
            .read("getCode", || self.chain.get_code(address))
            .await?;
        Ok(!code.is_empty())
    }

    /// Makes sure the relay for `merchant` exists and returns it.
    ///
    /// An existing relay is trusted as deployed; its escrow is read from the
    /// proxy. Otherwise the relay is deployed through `factory`.
    ///
    /// # Errors
    ///
    /// Returns a deployment or chain read [`SettlementError`].
    pub async fn ensure_deployed(
        &self,
        factory: Address,
        deployer: Address,
        merchant: Address,
    ) -> Result<DeployedRelay, SettlementError> {
        let proxy = compute_relay_address(deployer, factory, merchant);
        if self.has_code(proxy).await? {
            let escrow = self.read_escrow(proxy).await?;
            return Ok(DeployedRelay { proxy, escrow });
        }
        self.deploy(factory, proxy, merchant).await
    }

    /// Resolves the relay behind `pay_to`.
    ///
    /// A deployed relay is described by its own immutables, and must sit at
    /// the address derived from the merchant it reports. For an undeployed
    /// one the merchant comes from the extension's `merchantPayouts`, and the
    /// relay is deployed. Returns `None` when `pay_to` is not deployed and no
    /// merchant is declared for it.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::AddressMismatch`] if the merchant's relay is
    /// not `pay_to`, or a deployment or chain read error.
    pub async fn resolve(
        &self,
        factory: Address,
        deployer: Address,
        pay_to: Address,
        declared_pay_to: &str,
        info: &RefundExtensionInfo,
    ) -> Result<Option<ResolvedRelay>, SettlementError> {
        if self.has_code(pay_to).await? {
            let merchant_payout = self
                .reader
                .read("MERCHANT_PAYOUT", || self.chain.merchant_payout(pay_to))
                .await?;
            ensure_derived(deployer, factory, merchant_payout, pay_to)?;
            let escrow = self.read_escrow(pay_to).await?;
            return Ok(Some(ResolvedRelay {
                proxy: pay_to,
                escrow,
                merchant_payout,
            }));
        }

        let Some(merchant_payout) = info.merchant_payout_for(declared_pay_to) else {
            #[cfg(feature = "telemetry")]
            tracing::debug!(pay_to = %pay_to, "No merchant declared for undeployed relay");
            return Ok(None);
        };

        ensure_derived(deployer, factory, merchant_payout, pay_to)?;
        let deployed = self.ensure_deployed(factory, deployer, merchant_payout).await?;
        Ok(Some(ResolvedRelay {
            proxy: deployed.proxy,
            escrow: deployed.escrow,
            merchant_payout,
        }))
    }

    async fn deploy(
        &self,
        factory: Address,
        computed: Address,
        merchant: Address,
    ) -> Result<DeployedRelay, SettlementError> {
        let expected = self
            .reader
            .read("getRelayAddress", || self.chain.get_relay_address(factory, merchant))
            .await?;
        if expected != computed {
            return Err(SettlementError::AddressMismatch { computed, expected });
        }

        let cancel = self.reader.cancel_token();
        let submitted = traced!(
            cancellable(cancel, self.chain.deploy_relay(factory, merchant)),
            tracing::info_span!("deploy_relay",
                factory = %factory,
                merchant = %merchant,
                otel.kind = "client",
            )
        )?;
        let tx = match submitted {
            Ok(tx) => tx,
            Err(err) if is_insufficient_funds(&err) => {
                return Err(SettlementError::InsufficientDeploymentFunds {
                    account: self.chain.signer_addresses().first().copied(),
                    message: err.to_string(),
                });
            }
            Err(err) => {
                // Gas estimation reverts when the relay already exists.
                if let Some(relay) = self.deployed_elsewhere(computed).await? {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(
                        proxy = %computed,
                        error = %err,
                        "Relay deployment rejected but relay exists"
                    );
                    return Ok(relay);
                }
                return Err(SettlementError::DeploymentFailed(err));
            }
        };

        let status = traced!(
            cancellable(cancel, self.chain.wait_for_receipt(tx)),
            tracing::info_span!("wait_for_receipt", tx = %tx, otel.kind = "client")
        )?
        .map_err(SettlementError::DeploymentFailed)?;

        if status == ReceiptStatus::Reverted {
            if let Some(relay) = self.deployed_elsewhere(computed).await? {
                #[cfg(feature = "telemetry")]
                tracing::warn!(
                    proxy = %computed,
                    tx = %tx,
                    "Relay deployment reverted but relay exists"
                );
                return Ok(relay);
            }
            return Err(SettlementError::DeploymentReverted { proxy: computed, tx });
        }

        self.await_code(computed, expected, tx).await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(proxy = %computed, merchant = %merchant, tx = %tx, "Relay deployed");

        let escrow = self.read_escrow(computed).await?;
        Ok(DeployedRelay {
            proxy: computed,
            escrow,
        })
    }

    /// Re-probes `proxy` after a failed deployment, since another settlement
    /// may have deployed the same relay first.
    async fn deployed_elsewhere(
        &self,
        proxy: Address,
    ) -> Result<Option<DeployedRelay>, SettlementError> {
        if !self.has_code(proxy).await? {
            return Ok(None);
        }
        let escrow = self.read_escrow(proxy).await?;
        Ok(Some(DeployedRelay { proxy, escrow }))
    }

    async fn await_code(
        &self,
        computed: Address,
        expected: Address,
        tx: TxHash,
    ) -> Result<(), SettlementError> {
        let attempts = self.poll.attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.has_code(computed).await? {
                return Ok(());
            }
            if attempt >= attempts {
                return Err(SettlementError::DeploymentNotObserved {
                    computed,
                    expected,
                    tx,
                });
            }
            sleep(self.reader.cancel_token(), self.poll.delay(attempt)).await?;
            attempt += 1;
        }
    }

    async fn read_escrow(&self, proxy: Address) -> Result<Address, SettlementError> {
        self.reader
            .read("ESCROW", || self.chain.escrow(proxy))
            .await
    }
}

fn ensure_derived(
    deployer: Address,
    factory: Address,
    merchant: Address,
    pay_to: Address,
) -> Result<(), SettlementError> {
    let computed = compute_relay_address(deployer, factory, merchant);
    if computed == pay_to {
        Ok(())
    } else {
        Err(SettlementError::AddressMismatch {
            computed,
            expected: pay_to,
        })
    }
}

fn is_insufficient_funds(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        let message = err.to_string().to_ascii_lowercase();
        if INSUFFICIENT_FUNDS_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_primitives::{address, b256};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::address::CREATEX_ADDRESS;
    use crate::error::{ChainError, SettlementErrorKind};
    use crate::retry::ReadRetryPolicy;
    use crate::testing::{MockChain, Write};

    const FACTORY: Address = address!("0x41Cc4D337FEC5E91ddcf4C363700FC6dB5f3A814");
    const MERCHANT: Address = address!("0x1234567890123456789012345678901234567890");
    const PROXY: Address = address!("0x224d6e0fa6b803ce9edd863b0bbeb5dfd183de4f");
    const ESCROW: Address = address!("0xe5c0000000000000000000000000000000000001");
    const TX: TxHash = b256!("0x1111111111111111111111111111111111111111111111111111111111111111");

    fn reader() -> ChainReader {
        ChainReader::new(ReadRetryPolicy::default(), CancellationToken::new())
    }

    fn chain() -> MockChain {
        let chain = MockChain::new();
        chain.set_code(FACTORY);
        chain.set_relay_prediction(FACTORY, MERCHANT, PROXY);
        chain.set_deploy_tx(TX);
        chain.set_proxy(PROXY, MERCHANT, Address::ZERO, ESCROW);
        chain
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploys_missing_relay() {
        let chain = chain();
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let relay = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap();

        assert_eq!(
            relay,
            DeployedRelay {
                proxy: PROXY,
                escrow: ESCROW
            }
        );
        assert_eq!(
            chain.writes(),
            vec![Write::DeployRelay {
                factory: FACTORY,
                merchant: MERCHANT
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_relay_is_not_redeployed() {
        let chain = chain();
        chain.set_code(PROXY);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let relay = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap();

        assert_eq!(relay.escrow, ESCROW);
        assert!(chain.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_disagreement_is_fatal_before_deploy() {
        let chain = chain();
        chain.set_relay_prediction(
            FACTORY,
            MERCHANT,
            address!("0x00000000000000000000000000000000000000aa"),
        );
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let err = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SettlementErrorKind::AddressMismatch);
        assert!(chain.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_that_never_appears_is_reported_after_polling() {
        let chain = chain();
        chain.set_deploy_creates_code(false);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());
        let start = Instant::now();

        let err = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SettlementErrorKind::DeploymentNotObserved);
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 + 3 + 4));
        let message = err.to_string();
        assert!(message.contains(&PROXY.to_string()));
        assert!(message.contains(&TX.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_code_is_picked_up_by_polling() {
        let chain = chain();
        chain.set_deploy_creates_code(false);
        chain.set_code_after_probes(PROXY, 4);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());
        let start = Instant::now();

        deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_deploy_of_existing_relay_is_tolerated() {
        let chain = chain();
        chain.set_deploy_receipt(ReceiptStatus::Reverted);
        chain.set_code_after_probes(PROXY, 2);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let relay = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap();

        assert_eq!(relay.proxy, PROXY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_deploy_of_existing_relay_is_tolerated() {
        let chain = chain();
        chain.fail_deploy(
            ChainError::new("execution reverted: relay already deployed").with_rpc_code(3),
        );
        chain.set_code_after_probes(PROXY, 2);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let relay = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap();

        assert_eq!(
            relay,
            DeployedRelay {
                proxy: PROXY,
                escrow: ESCROW
            }
        );
        assert_eq!(chain.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_deploy_without_code_is_fatal() {
        let chain = chain();
        chain.set_deploy_receipt(ReceiptStatus::Reverted);
        chain.set_deploy_creates_code(false);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let err = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SettlementErrorKind::DeploymentReverted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_funds_names_signer() {
        let chain = chain();
        chain.fail_deploy(ChainError::new(
            "server returned an error response: error code -32000: Insufficient Funds for gas * price + value",
        ));
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let err = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SettlementErrorKind::InsufficientDeploymentFunds);
        assert!(err.to_string().contains(&MockChain::SIGNER.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_submission_errors_are_generic() {
        let chain = chain();
        chain.fail_deploy(ChainError::new("nonce too low"));
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());

        let err = deployer
            .ensure_deployed(FACTORY, CREATEX_ADDRESS, MERCHANT)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SettlementErrorKind::DeploymentFailed);
        assert!(err.to_string().contains("nonce too low"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_uses_onchain_state_for_deployed_relay() {
        let chain = chain();
        chain.set_code(PROXY);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());
        let stale = address!("0x00000000000000000000000000000000000000bb");
        let info = RefundExtensionInfo {
            factory_address: FACTORY,
            merchant_payouts: [(PROXY.to_string(), stale)].into_iter().collect(),
        };

        let resolved = deployer
            .resolve(FACTORY, CREATEX_ADDRESS, PROXY, &PROXY.to_string(), &info)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.merchant_payout, MERCHANT);
        assert_eq!(resolved.escrow, ESCROW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_rejects_deployed_contract_off_the_relay_address() {
        let chain = chain();
        let foreign = address!("0x00000000000000000000000000000000f0f0f0f0");
        chain.set_code(foreign);
        chain.set_proxy(foreign, MERCHANT, Address::ZERO, ESCROW);
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());
        let info = RefundExtensionInfo {
            factory_address: FACTORY,
            merchant_payouts: [(foreign.to_string(), MERCHANT)].into_iter().collect(),
        };

        let err = deployer
            .resolve(FACTORY, CREATEX_ADDRESS, foreign, &foreign.to_string(), &info)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::AddressMismatch { computed, expected }
                if computed == PROXY && expected == foreign
        ));
        assert!(chain.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_deploys_declared_relay() {
        let chain = chain();
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());
        let info = RefundExtensionInfo {
            factory_address: FACTORY,
            merchant_payouts: [(PROXY.to_string(), MERCHANT)].into_iter().collect(),
        };

        let resolved = deployer
            .resolve(FACTORY, CREATEX_ADDRESS, PROXY, &PROXY.to_string(), &info)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            resolved,
            ResolvedRelay {
                proxy: PROXY,
                escrow: ESCROW,
                merchant_payout: MERCHANT,
            }
        );
        assert_eq!(chain.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_without_declared_merchant_is_not_applicable() {
        let chain = chain();
        let reader = reader();
        let deployer = RelayDeployer::new(&chain, &reader, DeploymentPollConfig::default());
        let info = RefundExtensionInfo {
            factory_address: FACTORY,
            merchant_payouts: Default::default(),
        };

        let resolved = deployer
            .resolve(FACTORY, CREATEX_ADDRESS, PROXY, &PROXY.to_string(), &info)
            .await
            .unwrap();

        assert!(resolved.is_none());
        assert!(chain.writes().is_empty());
    }
}
