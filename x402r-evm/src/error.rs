//! Error types for escrow relay settlement.
//!
//! [`ChainError`] is the single error raised by the chain capabilities in
//! [`crate::chain`]. It keeps the pieces of an RPC failure that settlement
//! decisions depend on (HTTP status, JSON-RPC code, revert reason and revert
//! data) next to the original error, which stays reachable through
//! [`Error::source`].
//!
//! [`SettlementError`] is the fatal outcome of a settlement attempt.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use alloy_json_rpc::RpcError;
use alloy_primitives::{Address, B256, Bytes, TxHash};
use alloy_provider::PendingTransactionError;
use alloy_transport::{TransportError, TransportErrorKind};

/// HTTP status and JSON-RPC code used by providers to signal rate limiting.
const RATE_LIMIT_STATUS: u16 = 429;

/// JSON-RPC "limit exceeded" code returned by some providers instead of 429.
const RPC_LIMIT_EXCEEDED: i64 = -32005;

/// Lowercase message fragments that indicate rate limiting.
const RATE_LIMIT_MARKERS: [&str; 3] = ["rate limit", "too many requests", "429"];

/// A failed chain read, write or receipt wait.
#[derive(Debug)]
pub struct ChainError {
    message: String,
    status: Option<u16>,
    rpc_code: Option<i64>,
    revert_reason: Option<String>,
    data: Option<Bytes>,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl ChainError {
    /// Creates an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            rpc_code: None,
            revert_reason: None,
            data: None,
            source: None,
        }
    }

    /// Attaches an HTTP status code.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches a JSON-RPC error code.
    #[must_use]
    pub const fn with_rpc_code(mut self, code: i64) -> Self {
        self.rpc_code = Some(code);
        self
    }

    /// Attaches a decoded revert reason.
    #[must_use]
    pub fn with_revert_reason(mut self, reason: impl Into<String>) -> Self {
        self.revert_reason = Some(reason.into());
        self
    }

    /// Attaches raw revert data.
    #[must_use]
    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches the underlying error.
    #[must_use]
    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status of the failed request, if known.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// JSON-RPC error code, if the node answered with an error payload.
    #[must_use]
    pub const fn rpc_code(&self) -> Option<i64> {
        self.rpc_code
    }

    /// Revert reason reported by the node, if any.
    #[must_use]
    pub fn revert_reason(&self) -> Option<&str> {
        self.revert_reason.as_deref()
    }

    /// Raw revert data, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Returns `true` if this error, taken on its own, signals rate limiting.
    ///
    /// See [`is_rate_limited`] for the check over a whole cause chain.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(RATE_LIMIT_STATUS)
            || self.rpc_code.is_some_and(|code| {
                code == i64::from(RATE_LIMIT_STATUS) || code == RPC_LIMIT_EXCEEDED
            })
            || mentions_rate_limit(&self.message)
    }
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ChainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn Error + 'static))
    }
}

/// Returns `true` if `err` or any error in its cause chain signals rate limiting.
///
/// A [`ChainError`] in the chain is checked for status and JSON-RPC code;
/// every other error is checked by message.
#[must_use]
pub fn is_rate_limited(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let hit = e
            .downcast_ref::<ChainError>()
            .map_or_else(|| mentions_rate_limit(&e.to_string()), ChainError::is_rate_limited);
        if hit {
            return true;
        }
        current = e.source();
    }
    false
}

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Extracts `<reason>` from an `execution reverted: <reason>` node message.
pub(crate) fn revert_reason_from_message(message: &str) -> Option<&str> {
    let (_, reason) = message.split_once("execution reverted:")?;
    let reason = reason.trim();
    (!reason.is_empty()).then_some(reason)
}

impl From<TransportError> for ChainError {
    fn from(err: TransportError) -> Self {
        let mut chain_error = Self::new(err.to_string());
        match &err {
            RpcError::ErrorResp(payload) => {
                chain_error = chain_error.with_rpc_code(payload.code);
                if let Some(reason) = revert_reason_from_message(&payload.message) {
                    chain_error = chain_error.with_revert_reason(reason);
                }
                if let Some(data) = payload.as_revert_data() {
                    chain_error = chain_error.with_data(data);
                }
            }
            RpcError::Transport(TransportErrorKind::HttpError(http)) => {
                chain_error = chain_error.with_status(http.status);
            }
            _ => {}
        }
        chain_error.with_source(err)
    }
}

impl From<PendingTransactionError> for ChainError {
    fn from(err: PendingTransactionError) -> Self {
        match err {
            PendingTransactionError::TransportError(e) => e.into(),
            other => Self::new(other.to_string()).with_source(other),
        }
    }
}

impl From<alloy_contract::Error> for ChainError {
    fn from(err: alloy_contract::Error) -> Self {
        match err {
            alloy_contract::Error::TransportError(e) => e.into(),
            alloy_contract::Error::PendingTransactionError(e) => e.into(),
            other => Self::new(other.to_string()).with_source(other),
        }
    }
}

/// Machine-readable kind of a [`SettlementError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettlementErrorKind {
    /// The refund extension is present but malformed.
    InvalidExtension,
    /// The payment payload is not an ERC-3009 authorization.
    InvalidPayload,
    /// An address could not be parsed.
    InvalidAddress,
    /// The factory address has no code.
    InvalidFactory,
    /// Caller and on-chain factory disagree on the relay address.
    AddressMismatch,
    /// The deployment transaction reverted and no relay code appeared.
    DeploymentReverted,
    /// The deployment confirmed but relay code never appeared.
    DeploymentNotObserved,
    /// The facilitator cannot pay deployment gas.
    InsufficientDeploymentFunds,
    /// The deployment transaction could not be submitted or confirmed.
    DeploymentFailed,
    /// The merchant is not registered with the escrow.
    MerchantNotRegistered,
    /// The authorization does not pay the relay proxy.
    AuthorizationBindingMismatch,
    /// The proxy's token or escrow differs from what was expected.
    ProxyConsistencyError,
    /// The authorization nonce was already used.
    NonceReused,
    /// The deposit failed after all attempts.
    DepositFailed,
    /// A chain read failed.
    ChainRead,
    /// The caller cancelled the settlement.
    Cancelled,
}

impl SettlementErrorKind {
    /// Snake-case identifier, suitable as a settle-response error reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidExtension => "invalid_extension",
            Self::InvalidPayload => "invalid_payload",
            Self::InvalidAddress => "invalid_address",
            Self::InvalidFactory => "invalid_factory",
            Self::AddressMismatch => "address_mismatch",
            Self::DeploymentReverted => "deployment_reverted",
            Self::DeploymentNotObserved => "deployment_not_observed",
            Self::InsufficientDeploymentFunds => "insufficient_deployment_funds",
            Self::DeploymentFailed => "deployment_failed",
            Self::MerchantNotRegistered => "merchant_not_registered",
            Self::AuthorizationBindingMismatch => "authorization_binding_mismatch",
            Self::ProxyConsistencyError => "proxy_consistency_error",
            Self::NonceReused => "nonce_reused",
            Self::DepositFailed => "deposit_failed",
            Self::ChainRead => "chain_read",
            Self::Cancelled => "cancelled",
        }
    }

    /// Coarse category of this kind.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::InvalidExtension
            | Self::InvalidPayload
            | Self::InvalidAddress
            | Self::InvalidFactory
            | Self::AddressMismatch => ErrorCategory::Configuration,
            Self::MerchantNotRegistered => ErrorCategory::Registration,
            Self::AuthorizationBindingMismatch
            | Self::ProxyConsistencyError
            | Self::NonceReused => ErrorCategory::Binding,
            Self::ChainRead => ErrorCategory::Transient,
            Self::DeploymentReverted
            | Self::DeploymentNotObserved
            | Self::DeploymentFailed
            | Self::DepositFailed => ErrorCategory::Execution,
            Self::InsufficientDeploymentFunds => ErrorCategory::Resource,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

impl Display for SettlementErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse grouping of settlement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad factory, extension or address metadata. Not retried.
    Configuration,
    /// The merchant must register with the escrow first.
    Registration,
    /// A misdirected authorization or a misconfigured relay.
    Binding,
    /// RPC failures that outlived the read retry policy.
    Transient,
    /// On-chain execution failed.
    Execution,
    /// The facilitator account lacks funds.
    Resource,
    /// The caller gave up.
    Cancelled,
}

/// Fatal outcome of a settlement attempt.
///
/// Once an error is returned the payment was committed to escrow settlement;
/// callers must abort instead of falling back to a plain transfer.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// The refund extension is present but malformed.
    #[error("Invalid refund extension: {0}")]
    InvalidExtension(String),
    /// The payment payload is not an ERC-3009 authorization.
    #[error("Invalid payment payload: {0}")]
    InvalidPayload(String),
    /// An address could not be parsed.
    #[error("Invalid address {value:?}: {reason}")]
    InvalidAddress {
        /// The offending input.
        value: String,
        /// Parser message.
        reason: String,
    },
    /// The factory address has no code.
    #[error("Relay factory {0} has no code on this network")]
    InvalidFactory(Address),
    /// Caller and on-chain factory disagree on the relay address.
    #[error(
        "Relay address mismatch: computed {computed}, but {expected} was expected. Check the factory version and CreateX deployer"
    )]
    AddressMismatch {
        /// Address computed locally.
        computed: Address,
        /// Address reported by the factory or declared as `payTo`.
        expected: Address,
    },
    /// The deployment transaction reverted and no relay code appeared.
    #[error("Relay deployment for {proxy} reverted in transaction {tx}")]
    DeploymentReverted {
        /// Relay address.
        proxy: Address,
        /// Deployment transaction.
        tx: TxHash,
    },
    /// The deployment confirmed but relay code never appeared.
    #[error(
        "Relay deployment not observed: no code at computed address {computed} (factory expected {expected}) after transaction {tx}"
    )]
    DeploymentNotObserved {
        /// Address computed locally.
        computed: Address,
        /// Address reported by the factory.
        expected: Address,
        /// Deployment transaction.
        tx: TxHash,
    },
    /// The facilitator cannot pay deployment gas.
    #[error(
        "Insufficient funds to deploy relay: fund facilitator account {}. {message}",
        display_account(.account.as_ref())
    )]
    InsufficientDeploymentFunds {
        /// First signer of the facilitator wallet.
        account: Option<Address>,
        /// Provider message.
        message: String,
    },
    /// The deployment transaction could not be submitted or confirmed.
    #[error("Relay deployment failed: {0}")]
    DeploymentFailed(#[source] ChainError),
    /// The merchant is not registered with the escrow.
    #[error(
        "Merchant {merchant} is not registered with escrow {escrow}. Register the payout address with the escrow contract before accepting refundable payments"
    )]
    MerchantNotRegistered {
        /// Merchant payout address.
        merchant: Address,
        /// Escrow contract.
        escrow: Address,
    },
    /// The authorization does not pay the relay proxy.
    #[error("Authorization was signed for {authorized}, not for relay proxy {proxy}")]
    AuthorizationBindingMismatch {
        /// Recipient in the signed authorization.
        authorized: Address,
        /// Relay proxy being settled against.
        proxy: Address,
    },
    /// The proxy's token or escrow differs from what was expected.
    #[error("Relay proxy {field} mismatch: proxy declares {declared}, expected {expected}")]
    ProxyConsistencyError {
        /// `"token"` or `"escrow"`.
        field: &'static str,
        /// Value read from the proxy.
        declared: Address,
        /// Value the settlement expected.
        expected: Address,
    },
    /// The authorization nonce was already used.
    #[error("Authorization nonce {0} has already been used")]
    NonceReused(B256),
    /// The deposit failed after all attempts.
    #[error("Deposit failed: {reason}")]
    DepositFailed {
        /// Classified failure description.
        reason: String,
        /// Error from the last attempt.
        #[source]
        source: ChainError,
    },
    /// A chain read failed.
    #[error("Chain read {operation} failed: {source}")]
    ChainRead {
        /// Name of the read.
        operation: &'static str,
        /// Underlying error.
        #[source]
        source: ChainError,
    },
    /// The caller cancelled the settlement.
    #[error("Settlement cancelled")]
    Cancelled,
}

fn display_account(account: Option<&Address>) -> String {
    account.map_or_else(|| "<unknown>".to_owned(), Address::to_string)
}

impl SettlementError {
    /// Machine-readable kind.
    #[must_use]
    pub const fn kind(&self) -> SettlementErrorKind {
        match self {
            Self::InvalidExtension(_) => SettlementErrorKind::InvalidExtension,
            Self::InvalidPayload(_) => SettlementErrorKind::InvalidPayload,
            Self::InvalidAddress { .. } => SettlementErrorKind::InvalidAddress,
            Self::InvalidFactory(_) => SettlementErrorKind::InvalidFactory,
            Self::AddressMismatch { .. } => SettlementErrorKind::AddressMismatch,
            Self::DeploymentReverted { .. } => SettlementErrorKind::DeploymentReverted,
            Self::DeploymentNotObserved { .. } => SettlementErrorKind::DeploymentNotObserved,
            Self::InsufficientDeploymentFunds { .. } => {
                SettlementErrorKind::InsufficientDeploymentFunds
            }
            Self::DeploymentFailed(_) => SettlementErrorKind::DeploymentFailed,
            Self::MerchantNotRegistered { .. } => SettlementErrorKind::MerchantNotRegistered,
            Self::AuthorizationBindingMismatch { .. } => {
                SettlementErrorKind::AuthorizationBindingMismatch
            }
            Self::ProxyConsistencyError { .. } => SettlementErrorKind::ProxyConsistencyError,
            Self::NonceReused(_) => SettlementErrorKind::NonceReused,
            Self::DepositFailed { .. } => SettlementErrorKind::DepositFailed,
            Self::ChainRead { .. } => SettlementErrorKind::ChainRead,
            Self::Cancelled => SettlementErrorKind::Cancelled,
        }
    }

    /// Coarse category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    pub(crate) fn invalid_address(value: &str, err: impl Display) -> Self {
        Self::InvalidAddress {
            value: value.to_owned(),
            reason: err.to_string(),
        }
    }
}
