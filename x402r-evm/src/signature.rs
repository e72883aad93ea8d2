//! Splitting transfer-authorization signatures into `(v, r, s)`.
//!
//! The relay proxy's `executeDeposit` only accepts split ECDSA components,
//! so anything that is not a 65-byte ECDSA signature after unwrapping is
//! reported as [`SignatureDecoding::Unsupported`] and left to the regular
//! settlement path.

use alloy_primitives::{B256, Bytes, Signature, hex};
use alloy_sol_types::SolType;

use crate::contract::Sig6492;

/// The fixed 32-byte magic suffix defined by [EIP-6492](https://eips.ethereum.org/EIPS/eip-6492).
const EIP6492_MAGIC_SUFFIX: [u8; 32] =
    hex!("6492649264926492649264926492649264926492649264926492649264926492");

/// Length of a raw `r || s || v` ECDSA signature.
const ECDSA_SIGNATURE_LEN: usize = 65;

/// ECDSA signature components in the form `executeDeposit` expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedSignature {
    /// Recovery id, normalized to 27 or 28.
    pub v: u8,
    /// `r` component.
    pub r: B256,
    /// `s` component.
    pub s: B256,
}

/// Result of [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureDecoding {
    /// A 65-byte ECDSA signature.
    Ecdsa(DecodedSignature),
    /// Not an ECDSA signature (e.g. an EIP-1271 contract signature).
    Unsupported,
}

/// Decodes a signature, unwrapping an EIP-6492 envelope first.
///
/// If the envelope cannot be decoded the original bytes are used as-is.
#[must_use]
pub fn decode(signature: &Bytes) -> SignatureDecoding {
    let inner = unwrap_eip6492(signature).unwrap_or_else(|| signature.clone());
    if inner.len() != ECDSA_SIGNATURE_LEN {
        return SignatureDecoding::Unsupported;
    }
    Signature::from_raw(&inner).map_or(SignatureDecoding::Unsupported, |sig| {
        SignatureDecoding::Ecdsa(DecodedSignature {
            v: 27 + u8::from(sig.v()),
            r: B256::from(sig.r()),
            s: B256::from(sig.s()),
        })
    })
}

fn unwrap_eip6492(bytes: &Bytes) -> Option<Bytes> {
    let body = bytes.strip_suffix(EIP6492_MAGIC_SUFFIX.as_slice())?;
    Sig6492::abi_decode_params(body)
        .ok()
        .map(|sig6492| sig6492.innerSig)
}
