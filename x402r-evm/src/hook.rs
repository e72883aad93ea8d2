//! A settle hook that routes refundable payments into escrow.
//!
//! [`RefundSettleHook`] wraps a [`SettlementExecutor`] for use in a
//! facilitator's [`SettleHooks`](x402r::hooks::SettleHooks) list:
//!
//! - no `refund` extension, or a non-ECDSA signature: [`HookOutcome::Continue`]
//! - deposit executed: [`HookOutcome::Settled`], cached by nonce
//! - any settlement error: [`HookOutcome::Abort`], never a fallback

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use tokio_util::sync::CancellationToken;
use x402r::cache::SettlementCache;
use x402r::hooks::{HookOutcome, SettleHook, SettleHookContext};
use x402r::proto::{PaymentPayload, SettleResponse};

use crate::chain::RelayChain;
use crate::error::SettlementError;
use crate::settle::{SettlementExecutor, SettlementOutcome, SettlementReceipt};
use crate::types::Eip3009Payload;

/// Settle hook backed by a [`SettlementExecutor`].
#[derive(Debug)]
pub struct RefundSettleHook<C> {
    executor: Arc<SettlementExecutor<C>>,
    cache: Arc<SettlementCache<SettleResponse>>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl<C> Clone for RefundSettleHook<C> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            cache: Arc::clone(&self.cache),
            timeout: self.timeout,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<C> RefundSettleHook<C> {
    /// Creates a hook with a default-sized result cache and no timeout.
    pub fn new(executor: Arc<SettlementExecutor<C>>) -> Self {
        Self {
            executor,
            cache: Arc::new(SettlementCache::default()),
            timeout: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Uses `cache` for results of completed settlements.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<SettlementCache<SettleResponse>>) -> Self {
        self.cache = cache;
        self
    }

    /// Cancels a settlement still running after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancels in-flight settlements when `shutdown` fires.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The result cache.
    pub fn cache(&self) -> &SettlementCache<SettleResponse> {
        &self.cache
    }
}

impl<C: RelayChain> RefundSettleHook<C> {
    async fn run(&self, ctx: &SettleHookContext) -> HookOutcome {
        let nonce = authorization_nonce(&ctx.payment_payload);
        if let Some(response) = nonce.and_then(|nonce| self.cache.get(&nonce)) {
            #[cfg(feature = "telemetry")]
            tracing::debug!(nonce = ?nonce, "Returning cached settlement");
            return HookOutcome::Settled(response);
        }

        let cancel = self.shutdown.child_token();
        let settle = self.executor.settle(
            &ctx.payment_payload,
            &ctx.payment_requirements,
            &cancel,
        );
        let result = match self.timeout {
            Some(limit) => tokio::select! {
                result = settle => result,
                () = tokio::time::sleep(limit) => {
                    cancel.cancel();
                    Err(SettlementError::Cancelled)
                }
            },
            None => settle.await,
        };

        match result {
            Ok(SettlementOutcome::NotApplicable) => HookOutcome::Continue,
            Ok(SettlementOutcome::Success(receipt)) => {
                let response = settle_response(receipt);
                if let Some(nonce) = nonce {
                    self.cache.insert(nonce, response.clone());
                }
                HookOutcome::Settled(response)
            }
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(kind = %err.kind(), error = %err, "Escrow settlement aborted");
                HookOutcome::Abort {
                    reason: err.kind().as_str().to_owned(),
                    message: err.to_string(),
                }
            }
        }
    }
}

impl<C: RelayChain + 'static> SettleHook for RefundSettleHook<C> {
    fn before_settle<'a>(
        &'a self,
        ctx: &'a SettleHookContext,
    ) -> Pin<Box<dyn Future<Output = HookOutcome> + Send + 'a>> {
        Box::pin(self.run(ctx))
    }
}

fn authorization_nonce(payload: &PaymentPayload) -> Option<B256> {
    serde_json::from_value::<Eip3009Payload>(payload.payload.clone())
        .ok()
        .map(|payload| payload.authorization.nonce)
}

fn settle_response(receipt: SettlementReceipt) -> SettleResponse {
    SettleResponse {
        payer: receipt.payer.to_string(),
        transaction: receipt.tx_hash.to_string(),
        network: receipt.network,
        extensions: None,
    }
}
