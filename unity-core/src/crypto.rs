//! The crypto seam: `unity-core` needs hashing and signature verification
//! to compute ids and evaluate claims, but owns none of the actual
//! primitives. `unity-crypto` provides the implementation; everything in
//! this crate that needs a digest or a signature check takes `&dyn
//! CryptoProvider` (or a generic `C: CryptoProvider`) instead of reaching
//! for a concrete hash crate directly.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{Address, U160, U256};

/// A 65-byte recoverable ECDSA signature: one recovery-id byte followed
/// by the 64-byte `(r, s)` pair. Stored in a `BTreeSet` on
/// `SignedTransaction`, mirroring the original `std::set<compact_signature>`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CompactSignature(pub [u8; 65]);

impl Ord for CompactSignature {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for CompactSignature {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for CompactSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", hex::encode(self.0))
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret key")]
    BadSecretKey,
    #[error("signature recovery failed")]
    RecoveryFailed,
    #[error("signature verification failed")]
    InvalidSignature,
}

/// Hashing and signature operations needed by the core data model.
/// Implemented by `unity-crypto::Secp256k1Provider`.
pub trait CryptoProvider: Send + Sync {
    /// Plain single SHA-256, used for proposal digests and PoW hashing.
    fn sha256(&self, data: &[u8]) -> U256;

    /// RIPEMD-160(SHA-256(data)), used for transaction ids, block ids and
    /// address derivation — truncated/expanded as needed by the caller.
    fn hash160(&self, data: &[u8]) -> U160;

    /// Derives the address that owns a compressed public key.
    fn address_from_public_key(&self, pubkey: &[u8]) -> Address;

    /// Recovers the signing address from a message digest and a compact
    /// signature, without needing to know the address up front.
    fn recover_address(&self, digest: &U256, sig: &CompactSignature) -> Result<Address, CryptoError>;

    /// Signs a message digest with a raw 32-byte secret key.
    fn sign_digest(&self, secret: &[u8; 32], digest: &U256) -> Result<CompactSignature, CryptoError>;
}
