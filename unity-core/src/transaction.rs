//! Transactions: inputs that reference past outputs, outputs that carry
//! a claim predicate, and the signature set that authorizes spending.

use std::collections::BTreeSet;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::canonical::{hash160_of, sha256_of, CanonicalDecode, CanonicalEncode, Decoder, Encoder};
use crate::claim::Claim;
use crate::crypto::{CompactSignature, CryptoError, CryptoProvider};
use crate::error::CanonicalError;
use crate::primitives::{Address, Asset, OutputReference, U160};

/// One spend: a reference to a prior output plus whatever bytes that
/// output's claim predicate needs to be satisfied (e.g. nothing for a
/// plain signature spend, a pts-to-address proof for `ClaimByPts`).
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct TrxInput {
    pub output_ref: OutputReference,
    pub input_data: Vec<u8>,
}

impl TrxInput {
    pub fn new(output_ref: OutputReference) -> TrxInput {
        TrxInput { output_ref, input_data: Vec::new() }
    }
}

impl CanonicalEncode for TrxInput {
    fn encode(&self, enc: &mut Encoder) {
        self.output_ref.encode(enc);
        enc.write_bytes(&self.input_data);
    }
}

impl CanonicalDecode for TrxInput {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(TrxInput { output_ref: OutputReference::decode(dec)?, input_data: dec.read_bytes()? })
    }
}

/// One new output: an asset amount locked behind a claim.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TrxOutput {
    pub amount: Asset,
    pub claim: Claim,
}

impl TrxOutput {
    pub fn new(amount: Asset, claim: Claim) -> TrxOutput {
        TrxOutput { amount, claim }
    }

    pub fn to_signature(owner: Address, amount: Asset) -> TrxOutput {
        TrxOutput { amount, claim: Claim::BySignature { owner } }
    }
}

impl CanonicalEncode for TrxOutput {
    fn encode(&self, enc: &mut Encoder) {
        self.amount.encode(enc);
        self.claim.encode(enc);
    }
}

impl CanonicalDecode for TrxOutput {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(TrxOutput { amount: Asset::decode(dec)?, claim: Claim::decode(dec)? })
    }
}

/// Maps inputs to outputs. `stake` carries the last 8 bytes of a recent
/// block id and doubles as an anti-replay nonce and a proof-of-stake
/// input; `valid_after`/`valid_until` bound the transaction's acceptance
/// window (unix seconds, `0` meaning "no bound" for `valid_until`).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub stake: u64,
    pub timestamp: i64,
    pub valid_after: i64,
    pub valid_until: i64,
    pub inputs: Vec<TrxInput>,
    pub outputs: Vec<TrxOutput>,
}

impl Transaction {
    pub fn new(timestamp: i64) -> Transaction {
        Transaction {
            version: 0,
            stake: 0,
            timestamp,
            valid_after: 0,
            valid_until: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn is_time_valid(&self, now: i64) -> bool {
        now >= self.valid_after && (self.valid_until == 0 || now <= self.valid_until)
    }
}

impl CanonicalEncode for Transaction {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u8(self.version);
        enc.write_u64(self.stake);
        enc.write_i64(self.timestamp);
        enc.write_i64(self.valid_after);
        enc.write_i64(self.valid_until);
        enc.write_seq(&self.inputs);
        enc.write_seq(&self.outputs);
    }
}

impl CanonicalDecode for Transaction {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(Transaction {
            version: dec.read_u8()?,
            stake: dec.read_u64()?,
            timestamp: dec.read_i64()?,
            valid_after: dec.read_i64()?,
            valid_until: dec.read_i64()?,
            inputs: dec.read_seq()?,
            outputs: dec.read_seq()?,
        })
    }
}

/// A `Transaction` plus the compact ECDSA signatures authorizing its
/// inputs. `Deref`s to the inner transaction so callers can read fields
/// without unwrapping, mirroring the original's derivation relationship
/// without needing a base-class vtable.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub trx: Transaction,
    pub sigs: BTreeSet<CompactSignature>,
}

impl Deref for SignedTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.trx
    }
}

impl SignedTransaction {
    pub fn new(trx: Transaction) -> SignedTransaction {
        SignedTransaction { trx, sigs: BTreeSet::new() }
    }

    /// 160-bit transaction id: hash160 of the canonical encoding of the
    /// unsigned transaction body (signatures are not part of the id).
    pub fn id<C: CryptoProvider>(&self, crypto: &C) -> U160 {
        hash160_of(&self.trx, |data| crypto.hash160(data))
    }

    /// Signs the transaction's digest, appending the resulting signature.
    pub fn sign<C: CryptoProvider>(&mut self, crypto: &C, secret: &[u8; 32]) -> Result<(), CryptoError> {
        let digest = sha256_of(&self.trx, |d| crypto.sha256(d));
        let sig = crypto.sign_digest(secret, &digest)?;
        self.sigs.insert(sig);
        Ok(())
    }

    /// Recovers the set of addresses that signed this transaction.
    pub fn get_signed_addresses<C: CryptoProvider>(
        &self,
        crypto: &C,
    ) -> Result<BTreeSet<Address>, CryptoError> {
        let digest = sha256_of(&self.trx, |d| crypto.sha256(d));
        self.sigs.iter().map(|sig| crypto.recover_address(&digest, sig)).collect()
    }

    /// Canonical encoded size in bytes, used for fee-rate and
    /// block-size-budget computations.
    pub fn size(&self) -> usize {
        let mut enc = Encoder::new();
        self.trx.encode(&mut enc);
        enc.write_varint(self.sigs.len() as u64);
        for sig in &self.sigs {
            enc.write_raw(&sig.0);
        }
        enc.into_bytes().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Amount, AssetUnit};
    use unity_crypto::Secp256k1Provider;

    #[test]
    fn signing_roundtrips_through_recovery() {
        let crypto = Secp256k1Provider::new();
        let (secret, pubkey) = crypto.generate_keypair();
        let owner = crypto.address_from_public_key(&pubkey);

        let mut trx = Transaction::new(1_700_000_000);
        trx.outputs.push(TrxOutput::to_signature(owner, Asset::new(Amount::from_units(1), AssetUnit::BTS)));
        let mut signed = SignedTransaction::new(trx);
        signed.sign(&crypto, &secret).unwrap();

        let signers = signed.get_signed_addresses(&crypto).unwrap();
        assert!(signers.contains(&owner));
    }

    #[test]
    fn unsigned_id_is_stable_across_signature_additions() {
        let crypto = Secp256k1Provider::new();
        let (secret, _pubkey) = crypto.generate_keypair();
        let trx = Transaction::new(42);
        let mut signed = SignedTransaction::new(trx);
        let id_before = signed.id(&crypto);
        signed.sign(&crypto, &secret).unwrap();
        assert_eq!(id_before, signed.id(&crypto));
    }
}
