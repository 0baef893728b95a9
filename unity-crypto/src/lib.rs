//! Concrete cryptographic primitives backing `unity_core::crypto::CryptoProvider`:
//! SHA-256 and RIPEMD-160 hashing, and recoverable Secp256k1 ECDSA
//! signatures (§3.1, §6.5). The core crate never touches `secp256k1` or
//! `sha2` directly; every hash and signature operation it needs comes
//! through this provider.

use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use unity_core::crypto::{CompactSignature, CryptoError, CryptoProvider};
use unity_core::primitives::{Address, U160, U256};

/// The production `CryptoProvider`. Cheap to construct (wraps a
/// `secp256k1::Secp256k1` context, itself cheap since 0.29 moved the
/// precomputed tables behind the `global-context` feature) and safe to
/// share across threads.
pub struct Secp256k1Provider {
    ctx: Secp256k1<secp256k1::All>,
}

impl Secp256k1Provider {
    pub fn new() -> Self {
        Secp256k1Provider { ctx: Secp256k1::new() }
    }

    /// Generates a fresh keypair: a raw 32-byte secret and its
    /// 33-byte compressed public key.
    pub fn generate_keypair(&self) -> ([u8; 32], Vec<u8>) {
        let mut rng = OsRng;
        let secret = SecretKey::new(&mut rng);
        let public = PublicKey::from_secret_key(&self.ctx, &secret);
        (secret.secret_bytes(), public.serialize().to_vec())
    }
}

impl Default for Secp256k1Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for Secp256k1Provider {
    fn sha256(&self, data: &[u8]) -> U256 {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn hash160(&self, data: &[u8]) -> U160 {
        let sha = Sha256::digest(data);
        let ripemd = Ripemd160::digest(sha);
        let mut out = [0u8; 20];
        out.copy_from_slice(&ripemd);
        out
    }

    fn address_from_public_key(&self, pubkey: &[u8]) -> Address {
        Address::from_bytes(self.hash160(pubkey))
    }

    fn recover_address(&self, digest: &U256, sig: &CompactSignature) -> Result<Address, CryptoError> {
        let recid = RecoveryId::from_i32(sig.0[0] as i32).map_err(|_| CryptoError::RecoveryFailed)?;
        let rec_sig = RecoverableSignature::from_compact(&sig.0[1..65], recid)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        let msg = Message::from_digest(*digest);
        let pubkey = self
            .ctx
            .recover_ecdsa(&msg, &rec_sig)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(self.address_from_public_key(&pubkey.serialize()))
    }

    fn sign_digest(&self, secret: &[u8; 32], digest: &U256) -> Result<CompactSignature, CryptoError> {
        let sk = SecretKey::from_slice(secret).map_err(|_| CryptoError::BadSecretKey)?;
        let msg = Message::from_digest(*digest);
        let rec_sig = self.ctx.sign_ecdsa_recoverable(&msg, &sk);
        let (recid, compact) = rec_sig.serialize_compact();
        let mut bytes = [0u8; 65];
        bytes[0] = recid.to_i32() as u8;
        bytes[1..].copy_from_slice(&compact);
        Ok(CompactSignature(bytes))
    }
}

/// Renders an address as base58, matching the wallet's and RPC's
/// human-facing string form (the `Address` type's own `Display` already
/// does this; these free functions exist for callers that only have
/// raw bytes, e.g. a founder-code import or a pts-address conversion).
pub fn address_to_string(addr: &Address) -> String {
    addr.to_string()
}

pub fn address_from_string(s: &str) -> Result<Address, unity_core::error::AddressError> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_roundtrips() {
        let provider = Secp256k1Provider::new();
        let (secret, pubkey) = provider.generate_keypair();
        let owner = provider.address_from_public_key(&pubkey);
        let digest = provider.sha256(b"hello unity");
        let sig = provider.sign_digest(&secret, &digest).unwrap();
        let recovered = provider.recover_address(&digest, &sig).unwrap();
        assert_eq!(owner, recovered);
    }

    #[test]
    fn hash160_is_ripemd_of_sha256() {
        let provider = Secp256k1Provider::new();
        let direct = provider.hash160(b"abc");
        let sha = Sha256::digest(b"abc");
        let expected = Ripemd160::digest(sha);
        assert_eq!(&direct[..], &expected[..]);
    }

    #[test]
    fn tampered_digest_recovers_a_different_address() {
        let provider = Secp256k1Provider::new();
        let (secret, pubkey) = provider.generate_keypair();
        let owner = provider.address_from_public_key(&pubkey);
        let digest = provider.sha256(b"message one");
        let sig = provider.sign_digest(&secret, &digest).unwrap();
        let other_digest = provider.sha256(b"message two");
        let recovered = provider.recover_address(&other_digest, &sig).unwrap();
        assert_ne!(owner, recovered);
    }
}
