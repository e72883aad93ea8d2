//! The escrow relay settlement state machine.
//!
//! [`SettlementExecutor::settle`] walks a fixed sequence of checks and
//! stops at the first failure:
//!
//! 1. Read the `refund` extension. Without it the payment is not ours.
//! 2. Check the factory has code.
//! 3. Resolve the relay proxy behind `payTo`, deploying it if needed.
//! 4. Check the merchant is registered with the proxy's escrow.
//! 5. Check the authorization pays the proxy.
//! 6. Check the proxy's token and escrow match the payment.
//! 7. Split the signature. Non-ECDSA signatures are not ours.
//! 8. Check the authorization nonce is unused, on a best-effort basis.
//! 9. Call `executeDeposit`, retrying with linear backoff.
//!
//! Every check that can fail runs before any gas is spent on the deposit.

use std::sync::Arc;

use alloy_primitives::{Address, TxHash, U256};
use tokio_util::sync::CancellationToken;
#[cfg(feature = "telemetry")]
use tracing::instrument;
use x402r::extension::RefundExtension;
use x402r::proto::{Network, PaymentPayload, PaymentRequirements};

use crate::address::parse_address;
use crate::chain::{DepositCall, ReceiptStatus, RelayChain};
use crate::classify::ErrorClassifier;
use crate::config::{DeployerSource, SettlementConfig};
use crate::deploy::{RelayDeployer, ResolvedRelay};
use crate::error::{ChainError, SettlementError};
use crate::retry::{ChainReader, DepositRetryPolicy, cancellable, sleep};
use crate::signature::{self, SignatureDecoding};
use crate::types::{Eip3009Authorization, Eip3009Payload};

/// A deposit that landed in escrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    /// The `executeDeposit` transaction.
    pub tx_hash: TxHash,
    /// Network the deposit was made on.
    pub network: Network,
    /// The payer who signed the authorization.
    pub payer: Address,
}

/// Non-fatal result of [`SettlementExecutor::settle`].
///
/// Fatal results are returned as [`SettlementError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The payment is not an escrow relay payment this executor handles.
    /// The caller should settle it the normal way.
    NotApplicable,
    /// The payment was deposited into escrow.
    Success(SettlementReceipt),
}

/// Settles refundable payments through merchant relay proxies.
pub struct SettlementExecutor<C> {
    chain: C,
    config: SettlementConfig,
    classifier: Arc<ErrorClassifier>,
}

impl<C> std::fmt::Debug for SettlementExecutor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementExecutor")
            .field("config", &self.config)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl<C> SettlementExecutor<C> {
    /// Creates an executor over `chain` with the default error classifier.
    pub fn new(chain: C, config: SettlementConfig) -> Self {
        Self {
            chain,
            config,
            classifier: Arc::new(ErrorClassifier::default()),
        }
    }

    /// Replaces the classifier used to describe failed deposits.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// The chain this executor settles on.
    pub const fn chain(&self) -> &C {
        &self.chain
    }

    /// The active configuration.
    pub const fn config(&self) -> &SettlementConfig {
        &self.config
    }
}

impl<C: RelayChain> SettlementExecutor<C> {
    /// Settles `payload` through the merchant's relay proxy.
    ///
    /// Returns [`SettlementOutcome::NotApplicable`] when the payload carries
    /// no `refund` extension or is signed with a non-ECDSA signature. Any
    /// error means the payment must not be settled another way.
    ///
    /// # Errors
    ///
    /// Returns a [`SettlementError`] for the first check that fails, or
    /// [`SettlementError::Cancelled`] once `cancel` fires.
    #[cfg_attr(feature = "telemetry", instrument(skip_all, err, fields(
        network = %requirements.network,
        pay_to = %requirements.pay_to
    )))]
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        cancel: &CancellationToken,
    ) -> Result<SettlementOutcome, SettlementError> {
        let extension = match RefundExtension::from_payload(payload) {
            Ok(Some(extension)) => extension,
            Ok(None) => return Ok(SettlementOutcome::NotApplicable),
            Err(e) => return Err(SettlementError::InvalidExtension(e.to_string())),
        };
        let info = extension.info;

        let eip3009: Eip3009Payload = serde_json::from_value(payload.payload.clone())
            .map_err(|e| SettlementError::InvalidPayload(e.to_string()))?;
        let authorization = eip3009.authorization;
        let pay_to = parse_address(&requirements.pay_to)?;
        let asset = parse_address(&requirements.asset)?;

        // No gas is spent on a relay the authorization does not pay.
        ensure_binding(&authorization, pay_to)?;

        let reader = ChainReader::new(self.config.read_retry.into(), cancel.clone());
        let deployer = RelayDeployer::new(&self.chain, &reader, self.config.deployment_poll);

        let factory = info.factory_address;
        if !deployer.has_code(factory).await? {
            return Err(SettlementError::InvalidFactory(factory));
        }
        let create_x = match self.config.deployer {
            DeployerSource::Fixed { address } => address,
            DeployerSource::Factory => {
                reader
                    .read("getCreateX", || self.chain.get_create_x(factory))
                    .await?
            }
        };

        let Some(relay) = deployer
            .resolve(factory, create_x, pay_to, &requirements.pay_to, &info)
            .await?
        else {
            return Ok(SettlementOutcome::NotApplicable);
        };

        let registered = reader
            .read("registeredMerchants", || {
                self.chain.registered_merchants(relay.escrow, relay.merchant_payout)
            })
            .await?;
        if !registered {
            return Err(SettlementError::MerchantNotRegistered {
                merchant: relay.merchant_payout,
                escrow: relay.escrow,
            });
        }

        ensure_binding(&authorization, relay.proxy)?;
        self.ensure_consistent(&reader, &relay, asset).await?;

        let SignatureDecoding::Ecdsa(signature) = signature::decode(&eip3009.signature) else {
            #[cfg(feature = "telemetry")]
            tracing::debug!(
                proxy = %relay.proxy,
                "Signature is not ECDSA, not settling through relay"
            );
            return Ok(SettlementOutcome::NotApplicable);
        };

        self.ensure_nonce_unused(&reader, asset, &authorization).await?;

        let call = DepositCall {
            from: authorization.from,
            amount: authorization.value.0,
            valid_after: U256::from(authorization.valid_after.as_secs()),
            valid_before: U256::from(authorization.valid_before.as_secs()),
            nonce: authorization.nonce,
            signature,
        };
        let tx_hash = self.execute_deposit(cancel, relay.proxy, call).await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(
            proxy = %relay.proxy,
            payer = %authorization.from,
            tx = %tx_hash,
            "Deposit executed"
        );

        Ok(SettlementOutcome::Success(SettlementReceipt {
            tx_hash,
            network: requirements.network.clone(),
            payer: authorization.from,
        }))
    }

    async fn ensure_consistent(
        &self,
        reader: &ChainReader,
        relay: &ResolvedRelay,
        asset: Address,
    ) -> Result<(), SettlementError> {
        let token = reader
            .read("TOKEN", || self.chain.token(relay.proxy))
            .await?;
        if token != asset {
            return Err(SettlementError::ProxyConsistencyError {
                field: "token",
                declared: token,
                expected: asset,
            });
        }
        let escrow = reader
            .read("ESCROW", || self.chain.escrow(relay.proxy))
            .await?;
        if escrow != relay.escrow {
            return Err(SettlementError::ProxyConsistencyError {
                field: "escrow",
                declared: escrow,
                expected: relay.escrow,
            });
        }
        Ok(())
    }

    /// Tokens without an `authorizationState` view are let through.
    async fn ensure_nonce_unused(
        &self,
        reader: &ChainReader,
        token: Address,
        authorization: &Eip3009Authorization,
    ) -> Result<(), SettlementError> {
        let used = reader
            .read("authorizationState", || {
                self.chain
                    .authorization_state(token, authorization.from, authorization.nonce)
            })
            .await;
        match used {
            Ok(true) => Err(SettlementError::NonceReused(authorization.nonce)),
            Ok(false) => Ok(()),
            Err(SettlementError::Cancelled) => Err(SettlementError::Cancelled),
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(token = %token, error = %err, "Skipping nonce check");
                #[cfg(not(feature = "telemetry"))]
                let _ = err;
                Ok(())
            }
        }
    }

    async fn execute_deposit(
        &self,
        cancel: &CancellationToken,
        proxy: Address,
        call: DepositCall,
    ) -> Result<TxHash, SettlementError> {
        let policy = DepositRetryPolicy::from(self.config.deposit_retry);
        let mut attempt = 1;
        loop {
            match self.try_deposit(cancel, proxy, call).await? {
                Ok(tx) => return Ok(tx),
                Err(err) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(
                        proxy = %proxy,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Deposit attempt failed, retrying"
                    );
                    #[cfg(not(feature = "telemetry"))]
                    let _ = err;
                    sleep(cancel, delay).await?;
                    attempt += 1;
                }
                Err(source) => {
                    let reason = self.classifier.describe(&source);
                    return Err(SettlementError::DepositFailed { reason, source });
                }
            }
        }
    }

    /// One submission and receipt wait. The outer error is cancellation only.
    async fn try_deposit(
        &self,
        cancel: &CancellationToken,
        proxy: Address,
        call: DepositCall,
    ) -> Result<Result<TxHash, ChainError>, SettlementError> {
        let submitted = traced!(
            cancellable(cancel, self.chain.execute_deposit(proxy, call)),
            tracing::info_span!("execute_deposit",
                proxy = %proxy,
                from = %call.from,
                amount = %call.amount,
                otel.kind = "client",
            )
        )?;
        let tx = match submitted {
            Ok(tx) => tx,
            Err(err) => return Ok(Err(err)),
        };

        let status = traced!(
            cancellable(cancel, self.chain.wait_for_receipt(tx)),
            tracing::info_span!("wait_for_receipt", tx = %tx, otel.kind = "client")
        )?;
        Ok(match status {
            Ok(ReceiptStatus::Success) => Ok(tx),
            Ok(ReceiptStatus::Reverted) => {
                Err(ChainError::new(format!("deposit transaction {tx} reverted")))
            }
            Err(err) => Err(err),
        })
    }
}

fn ensure_binding(
    authorization: &Eip3009Authorization,
    proxy: Address,
) -> Result<(), SettlementError> {
    if authorization.to == proxy {
        Ok(())
    } else {
        Err(SettlementError::AuthorizationBindingMismatch {
            authorized: authorization.to,
            proxy,
        })
    }
}
