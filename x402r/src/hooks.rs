//! Settle hooks for embedding escrow settlement in a facilitator.
//!
//! A facilitator runs its registered [`SettleHook`]s before its own settle
//! path. A hook can let the request through, take over settlement entirely,
//! or abort it with a reason. The escrow relay hook in `x402r-evm` uses the
//! second form: payloads carrying the `refund` extension are settled through
//! the merchant's relay proxy and never reach the plain transfer path.

use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::proto::{PaymentPayload, PaymentRequirements, SettleResponse};

/// Outcome of a "before settle" hook.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    /// The hook does not apply; run the next hook or the default settle path.
    Continue,
    /// The hook settled the payment itself. Skip the default settle path.
    Settled(SettleResponse),
    /// Abort settlement with the given reason and human-readable message.
    Abort {
        /// Machine-readable reason for aborting (e.g., `"merchant_not_registered"`).
        reason: String,
        /// Human-readable message describing why settlement was aborted.
        message: String,
    },
}

/// Context passed to settle hooks.
pub struct SettleHookContext {
    /// The payment payload being settled.
    pub payment_payload: PaymentPayload,
    /// The requirements the payload is settled against.
    pub payment_requirements: PaymentRequirements,
}

impl Debug for SettleHookContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettleHookContext")
            .field("network", &self.payment_requirements.network)
            .field("pay_to", &self.payment_requirements.pay_to)
            .finish_non_exhaustive()
    }
}

/// A hook invoked before the facilitator settles a payment.
///
/// This trait is dyn-compatible for use in heterogeneous hook lists.
pub trait SettleHook: Send + Sync {
    /// Called before settlement.
    fn before_settle<'a>(
        &'a self,
        ctx: &'a SettleHookContext,
    ) -> Pin<Box<dyn Future<Output = HookOutcome> + Send + 'a>>;
}

/// An ordered list of settle hooks.
///
/// Hooks run in registration order. The first outcome other than
/// [`HookOutcome::Continue`] wins and the remaining hooks are skipped.
#[derive(Clone, Default)]
pub struct SettleHooks {
    hooks: Vec<Arc<dyn SettleHook>>,
}

impl Debug for SettleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettleHooks")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl SettleHooks {
    /// Creates an empty hook list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook.
    #[must_use]
    pub fn with_hook(mut self, hook: impl SettleHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Appends a shared hook.
    pub fn push(&mut self, hook: Arc<dyn SettleHook>) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns `true` if no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs the hooks in order and returns the first decisive outcome.
    pub async fn before_settle(&self, ctx: &SettleHookContext) -> HookOutcome {
        for (index, hook) in self.hooks.iter().enumerate() {
            match hook.before_settle(ctx).await {
                HookOutcome::Continue => {}
                decisive => {
                    #[cfg(feature = "telemetry")]
                    tracing::debug!(hook = index, ?ctx, "Settle hook decided outcome");
                    #[cfg(not(feature = "telemetry"))]
                    let _ = index;
                    return decisive;
                }
            }
        }
        HookOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Fixed {
        outcome: HookOutcome,
        calls: Arc<AtomicUsize>,
    }

    impl SettleHook for Fixed {
        fn before_settle<'a>(
            &'a self,
            _ctx: &'a SettleHookContext,
        ) -> Pin<Box<dyn Future<Output = HookOutcome> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcome.clone();
            Box::pin(async move { outcome })
        }
    }

    fn ctx() -> SettleHookContext {
        let requirements: PaymentRequirements = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "network": "eip155:8453",
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "amount": "1",
            "payTo": "0x224d6e0fa6b803ce9edd863b0bbeb5dfd183de4f",
            "maxTimeoutSeconds": 60
        }))
        .unwrap();
        SettleHookContext {
            payment_payload: PaymentPayload {
                x402_version: 2,
                payload: serde_json::Value::Null,
                accepted: requirements.clone(),
                resource: None,
                extensions: None,
            },
            payment_requirements: requirements,
        }
    }

    #[tokio::test]
    async fn test_empty_hooks_continue() {
        let hooks = SettleHooks::new();
        assert!(matches!(
            hooks.before_settle(&ctx()).await,
            HookOutcome::Continue
        ));
    }

    #[tokio::test]
    async fn test_first_decisive_outcome_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let hooks = SettleHooks::new()
            .with_hook(Fixed {
                outcome: HookOutcome::Continue,
                calls: Arc::clone(&first),
            })
            .with_hook(Fixed {
                outcome: HookOutcome::Abort {
                    reason: "merchant_not_registered".into(),
                    message: "no".into(),
                },
                calls: Arc::clone(&second),
            })
            .with_hook(Fixed {
                outcome: HookOutcome::Continue,
                calls: Arc::clone(&third),
            });

        let outcome = hooks.before_settle(&ctx()).await;
        assert!(matches!(
            outcome,
            HookOutcome::Abort { ref reason, .. } if reason == "merchant_not_registered"
        ));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }
}
