//! Solidity interface definitions for the escrow relay contracts.
//!
//! Contains the minimal ABI surface the settlement core depends on:
//! - [`IRelayFactory`] - deterministic relay deployment
//! - [`IRelayProxy`] - per-merchant relay that forwards authorizations into escrow
//! - [`IEscrow`] - shared escrow holding the merchant registry
//! - [`IEip3009`] - authorization-state view on ERC-3009 tokens
//! - [`Sig6492`] - ABI-decodable prefix of an EIP-6492 wrapped signature

use alloy_sol_types::sol;

sol! {
    /// Relay factory deploying one proxy per merchant through `CreateX`.
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IRelayFactory {
        function getRelayAddress(address merchantPayout) external view returns (address);
        function deployRelay(address merchantPayout) external returns (address);
        function getCreateX() external view returns (address);
    }
}

sol! {
    /// Merchant relay proxy. Its immutables are fixed at deployment.
    ///
    /// `executeDeposit` pulls funds with `receiveWithAuthorization` on the
    /// token and notes the deposit in the escrow.
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IRelayProxy {
        function MERCHANT_PAYOUT() external view returns (address);
        function TOKEN() external view returns (address);
        function ESCROW() external view returns (address);
        function executeDeposit(
            address fromUser,
            uint256 amount,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

sol! {
    /// Shared escrow. Only registered merchants can receive deposits.
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IEscrow {
        function registeredMerchants(address merchant) external view returns (bool);
    }
}

sol! {
    /// ERC-3009 authorization-state view.
    ///
    /// Reference: <https://eips.ethereum.org/EIPS/eip-3009>
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IEip3009 {
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
    }
}

sol! {
    /// Solidity-compatible struct for decoding the prefix of an EIP-6492 signature.
    ///
    /// Matches the tuple `(address factory, bytes factoryCalldata, bytes innerSig)`.
    #[allow(missing_docs)]
    #[derive(Debug)]
    struct Sig6492 {
        address factory;
        bytes   factoryCalldata;
        bytes   innerSig;
    }
}
