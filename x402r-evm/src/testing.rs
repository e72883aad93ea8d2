//! Scripted in-memory chain and payment fixtures for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use alloy_primitives::{Address, B256, Bytes, TxHash, address, b256};
use serde_json::json;
use x402r::extension::{REFUND_EXTENSION_KEY, declare_refund_extension};
use x402r::proto::{PaymentPayload, PaymentRequirements};

use crate::chain::{
    ChainClient, DepositCall, Escrow, ReceiptStatus, RelayFactory, RelayProxy, Token,
};
use crate::error::ChainError;

/// A state-changing call observed by [`MockChain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    DeployRelay { factory: Address, merchant: Address },
    ExecuteDeposit { proxy: Address, call: DepositCall },
}

#[derive(Debug, Clone, Copy)]
struct ProxyState {
    merchant_payout: Address,
    token: Address,
    escrow: Address,
}

#[derive(Debug)]
struct State {
    code: HashSet<Address>,
    code_after_probes: HashMap<Address, u32>,
    probes: HashMap<Address, u32>,
    relay_predictions: HashMap<(Address, Address), Address>,
    create_x: HashMap<Address, Address>,
    proxies: HashMap<Address, ProxyState>,
    registered: HashSet<(Address, Address)>,
    used_nonces: HashSet<(Address, Address, B256)>,
    authorization_state_supported: bool,
    deploy_tx: TxHash,
    deploy_receipt: ReceiptStatus,
    deploy_creates_code: bool,
    deploy_failure: Option<ChainError>,
    deposit_failures: VecDeque<ChainError>,
    deposit_receipts: VecDeque<ReceiptStatus>,
    rate_limits: HashMap<&'static str, u32>,
    writes: Vec<Write>,
}

/// Chain double implementing every capability from in-memory state.
///
/// Reads of unknown proxies fail like a call to an address without code.
/// Deployments succeed and create code at the factory's predicted address
/// unless scripted otherwise.
#[derive(Debug)]
pub struct MockChain {
    state: Mutex<State>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    /// The only facilitator signer.
    pub const SIGNER: Address = address!("0x5e1e000000000000000000000000000000000001");

    /// Hash returned for every deposit submission.
    pub const DEPOSIT_TX: TxHash =
        b256!("0xd000000000000000000000000000000000000000000000000000000000000001");

    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                code: HashSet::new(),
                code_after_probes: HashMap::new(),
                probes: HashMap::new(),
                relay_predictions: HashMap::new(),
                create_x: HashMap::new(),
                proxies: HashMap::new(),
                registered: HashSet::new(),
                used_nonces: HashSet::new(),
                authorization_state_supported: true,
                deploy_tx: b256!(
                    "0xde00000000000000000000000000000000000000000000000000000000000001"
                ),
                deploy_receipt: ReceiptStatus::Success,
                deploy_creates_code: true,
                deploy_failure: None,
                deposit_failures: VecDeque::new(),
                deposit_receipts: VecDeque::new(),
                rate_limits: HashMap::new(),
                writes: Vec::new(),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_code(&self, address: Address) {
        self.with_state(|s| s.code.insert(address));
    }

    /// Code appears at `address` from its `probe`-th `getCode` on.
    pub fn set_code_after_probes(&self, address: Address, probe: u32) {
        self.with_state(|s| s.code_after_probes.insert(address, probe));
    }

    pub fn set_relay_prediction(&self, factory: Address, merchant: Address, proxy: Address) {
        self.with_state(|s| s.relay_predictions.insert((factory, merchant), proxy));
    }

    pub fn set_create_x(&self, factory: Address, deployer: Address) {
        self.with_state(|s| s.create_x.insert(factory, deployer));
    }

    pub fn set_proxy(
        &self,
        proxy: Address,
        merchant_payout: Address,
        token: Address,
        escrow: Address,
    ) {
        self.with_state(|s| {
            s.proxies.insert(
                proxy,
                ProxyState {
                    merchant_payout,
                    token,
                    escrow,
                },
            )
        });
    }

    pub fn set_registered(&self, escrow: Address, merchant: Address) {
        self.with_state(|s| s.registered.insert((escrow, merchant)));
    }

    pub fn set_nonce_used(&self, token: Address, authorizer: Address, nonce: B256) {
        self.with_state(|s| s.used_nonces.insert((token, authorizer, nonce)));
    }

    /// Makes `authorizationState` revert, as on tokens without ERC-3009 views.
    pub fn disable_authorization_state(&self) {
        self.with_state(|s| s.authorization_state_supported = false);
    }

    pub fn set_deploy_tx(&self, tx: TxHash) {
        self.with_state(|s| s.deploy_tx = tx);
    }

    pub fn set_deploy_receipt(&self, status: ReceiptStatus) {
        self.with_state(|s| s.deploy_receipt = status);
    }

    pub fn set_deploy_creates_code(&self, creates_code: bool) {
        self.with_state(|s| s.deploy_creates_code = creates_code);
    }

    /// The next deployment submission fails with `err`.
    pub fn fail_deploy(&self, err: ChainError) {
        self.with_state(|s| s.deploy_failure = Some(err));
    }

    /// Deposit submissions fail with these errors, in order, before succeeding.
    pub fn fail_deposits(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.with_state(|s| s.deposit_failures.extend(errors));
    }

    /// Receipts of successfully submitted deposits, in order. Default: success.
    pub fn set_deposit_receipts(&self, statuses: impl IntoIterator<Item = ReceiptStatus>) {
        self.with_state(|s| s.deposit_receipts.extend(statuses));
    }

    /// The next `times` calls of `method` fail with HTTP 429.
    pub fn rate_limit(&self, method: &'static str, times: u32) {
        self.with_state(|s| s.rate_limits.insert(method, times));
    }

    pub fn writes(&self) -> Vec<Write> {
        self.with_state(|s| s.writes.clone())
    }

    pub fn deposit_count(&self) -> usize {
        self.with_state(|s| {
            s.writes
                .iter()
                .filter(|w| matches!(w, Write::ExecuteDeposit { .. }))
                .count()
        })
    }

    fn throttle(state: &mut State, method: &'static str) -> Result<(), ChainError> {
        match state.rate_limits.get_mut(method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ChainError::new("HTTP error 429 with body: Too Many Requests").with_status(429))
            }
            _ => Ok(()),
        }
    }

    fn proxy(state: &State, proxy: Address) -> Result<ProxyState, ChainError> {
        state
            .proxies
            .get(&proxy)
            .copied()
            .ok_or_else(|| ChainError::new("execution reverted").with_rpc_code(3))
    }
}

impl ChainClient for MockChain {
    async fn get_code(&self, address: Address) -> Result<Bytes, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "getCode")?;
            let probes = s.probes.entry(address).or_default();
            *probes += 1;
            let late = s
                .code_after_probes
                .get(&address)
                .is_some_and(|threshold| *probes >= *threshold);
            if s.code.contains(&address) || late {
                Ok(Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]))
            } else {
                Ok(Bytes::new())
            }
        })
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<ReceiptStatus, ChainError> {
        self.with_state(|s| {
            if tx == s.deploy_tx {
                Ok(s.deploy_receipt)
            } else {
                Ok(s.deposit_receipts.pop_front().unwrap_or(ReceiptStatus::Success))
            }
        })
    }

    fn signer_addresses(&self) -> Vec<Address> {
        vec![Self::SIGNER]
    }
}

impl RelayFactory for MockChain {
    async fn get_relay_address(
        &self,
        factory: Address,
        merchant: Address,
    ) -> Result<Address, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "getRelayAddress")?;
            s.relay_predictions
                .get(&(factory, merchant))
                .copied()
                .ok_or_else(|| ChainError::new("execution reverted"))
        })
    }

    async fn deploy_relay(
        &self,
        factory: Address,
        merchant: Address,
    ) -> Result<TxHash, ChainError> {
        self.with_state(|s| {
            s.writes.push(Write::DeployRelay { factory, merchant });
            if let Some(err) = s.deploy_failure.take() {
                return Err(err);
            }
            if s.deploy_creates_code && s.deploy_receipt == ReceiptStatus::Success {
                if let Some(proxy) = s.relay_predictions.get(&(factory, merchant)).copied() {
                    s.code.insert(proxy);
                }
            }
            Ok(s.deploy_tx)
        })
    }

    async fn get_create_x(&self, factory: Address) -> Result<Address, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "getCreateX")?;
            s.create_x
                .get(&factory)
                .copied()
                .ok_or_else(|| ChainError::new("execution reverted"))
        })
    }
}

impl RelayProxy for MockChain {
    async fn merchant_payout(&self, proxy: Address) -> Result<Address, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "MERCHANT_PAYOUT")?;
            Self::proxy(s, proxy).map(|p| p.merchant_payout)
        })
    }

    async fn token(&self, proxy: Address) -> Result<Address, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "TOKEN")?;
            Self::proxy(s, proxy).map(|p| p.token)
        })
    }

    async fn escrow(&self, proxy: Address) -> Result<Address, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "ESCROW")?;
            Self::proxy(s, proxy).map(|p| p.escrow)
        })
    }

    async fn execute_deposit(
        &self,
        proxy: Address,
        call: DepositCall,
    ) -> Result<TxHash, ChainError> {
        self.with_state(|s| {
            s.writes.push(Write::ExecuteDeposit { proxy, call });
            s.deposit_failures
                .pop_front()
                .map_or(Ok(Self::DEPOSIT_TX), Err)
        })
    }
}

impl Escrow for MockChain {
    async fn registered_merchants(
        &self,
        escrow: Address,
        merchant: Address,
    ) -> Result<bool, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "registeredMerchants")?;
            Ok(s.registered.contains(&(escrow, merchant)))
        })
    }
}

impl Token for MockChain {
    async fn authorization_state(
        &self,
        token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> Result<bool, ChainError> {
        self.with_state(|s| {
            Self::throttle(s, "authorizationState")?;
            if !s.authorization_state_supported {
                return Err(ChainError::new("execution reverted"));
            }
            Ok(s.used_nonces.contains(&(token, authorizer, nonce)))
        })
    }
}

// A refundable payment of 10000 units to the relay of MERCHANT under FACTORY.

pub const FACTORY: Address = address!("0x41Cc4D337FEC5E91ddcf4C363700FC6dB5f3A814");
pub const MERCHANT: Address = address!("0x1234567890123456789012345678901234567890");
pub const PROXY: Address = address!("0x224d6e0fa6b803ce9edd863b0bbeb5dfd183de4f");
pub const ESCROW: Address = address!("0xe5c0000000000000000000000000000000000001");
pub const USDC: Address = address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
pub const PAYER: Address = address!("0x857b06519E91e3A54538791bDbb0E22373e36b66");
pub const NONCE: B256 =
    b256!("0xf3746613c2d920b5fdabc0856f2aeb2d4f88ee6037b8cc5d04a71a4462f13480");

pub fn ecdsa_signature() -> Bytes {
    let mut raw = vec![0x11; 32];
    raw.extend_from_slice(&[0x22; 32]);
    raw.push(28);
    raw.into()
}

pub fn requirements() -> PaymentRequirements {
    PaymentRequirements {
        scheme: "exact".into(),
        network: "eip155:84532".into(),
        asset: USDC.to_string(),
        amount: "10000".into(),
        pay_to: PROXY.to_checksum(None),
        max_timeout_seconds: 300,
        extra: json!({}),
    }
}

pub fn payload_to(to: Address, signature: Bytes) -> PaymentPayload {
    let requirements = requirements();
    PaymentPayload {
        x402_version: 2,
        payload: json!({
            "signature": signature,
            "authorization": {
                "from": PAYER,
                "to": to,
                "value": "10000",
                "validAfter": "1740672089",
                "validBefore": "1740672154",
                "nonce": NONCE,
            }
        }),
        accepted: requirements,
        resource: None,
        extensions: Some(
            [(
                REFUND_EXTENSION_KEY.to_owned(),
                declare_refund_extension(FACTORY, [(PROXY, MERCHANT)]),
            )]
            .into_iter()
            .collect(),
        ),
    }
}

pub fn payload() -> PaymentPayload {
    payload_to(PROXY, ecdsa_signature())
}

/// Factory deployed, relay not yet deployed, merchant registered.
pub fn relay_chain() -> MockChain {
    let chain = MockChain::new();
    chain.set_code(FACTORY);
    chain.set_relay_prediction(FACTORY, MERCHANT, PROXY);
    chain.set_proxy(PROXY, MERCHANT, USDC, ESCROW);
    chain.set_registered(ESCROW, MERCHANT);
    chain
}
