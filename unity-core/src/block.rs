//! Block headers and full blocks.

use serde::{Deserialize, Serialize};

use crate::canonical::{hash160_of, CanonicalDecode, CanonicalEncode, Decoder, Encoder};
use crate::crypto::CryptoProvider;
use crate::error::CanonicalError;
use crate::primitives::{Amount, U160};
use crate::transaction::SignedTransaction;

/// Everything needed to validate a block except the transaction bodies
/// themselves. The block id is `hash160` of this struct's canonical
/// encoding.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev: U160,
    pub block_num: u64,
    pub timestamp: i64,
    pub next_difficulty: u128,
    /// Currency supply immediately after this block.
    pub total_shares: Amount,
    pub avail_coindays: Amount,
    /// Coin-days-destroyed by the transactions in this block.
    pub total_cdd: Amount,
    /// Fee-per-byte required of the *next* block's candidates; tracks
    /// block saturation (§3.3 invariant 7).
    pub next_fee: Amount,
    pub trx_merkle_root: U160,
    pub noncea: u64,
    pub nonceb: u64,
}

impl BlockHeader {
    pub fn id<C: CryptoProvider>(&self, crypto: &C) -> U160 {
        hash160_of(self, |data| crypto.hash160(data))
    }
}

impl CanonicalEncode for BlockHeader {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u32(self.version);
        enc.write_raw(&self.prev);
        enc.write_u64(self.block_num);
        enc.write_i64(self.timestamp);
        enc.write_u128(self.next_difficulty);
        self.total_shares.encode(enc);
        self.avail_coindays.encode(enc);
        self.total_cdd.encode(enc);
        self.next_fee.encode(enc);
        enc.write_raw(&self.trx_merkle_root);
        enc.write_u64(self.noncea);
        enc.write_u64(self.nonceb);
    }
}

impl CanonicalDecode for BlockHeader {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(BlockHeader {
            version: dec.read_u32()?,
            prev: U160::decode(dec)?,
            block_num: dec.read_u64()?,
            timestamp: dec.read_i64()?,
            next_difficulty: dec.read_u128()?,
            total_shares: Amount::decode(dec)?,
            avail_coindays: Amount::decode(dec)?,
            total_cdd: Amount::decode(dec)?,
            next_fee: Amount::decode(dec)?,
            trx_merkle_root: U160::decode(dec)?,
            noncea: dec.read_u64()?,
            nonceb: dec.read_u64()?,
        })
    }
}

/// A header plus its full ordered transaction list.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TrxBlock {
    pub header: BlockHeader,
    pub trxs: Vec<SignedTransaction>,
}

impl TrxBlock {
    pub fn id<C: CryptoProvider>(&self, crypto: &C) -> U160 {
        self.header.id(crypto)
    }
}

/// §3.3 invariant 4's work function. A header's PoW "value" is the
/// reciprocal of its double-hash interpreted as a big integer: smaller
/// hashes (more leading zero bits) yield a larger value, so "value ≥
/// required difficulty" reads the same way conventional PoW targets do.
pub fn proof_of_work_value<C: CryptoProvider>(crypto: &C, header: &BlockHeader) -> u128 {
    let mut enc = crate::canonical::Encoder::new();
    header.encode(&mut enc);
    let first = crypto.sha256(enc.bytes());
    let second = crypto.sha256(&first);
    let leading = u128::from_be_bytes(second[0..16].try_into().unwrap()).max(1);
    u128::MAX / leading
}

/// Binary Merkle root over transaction ids, duplicating the last id when
/// the level has an odd count (the standard Bitcoin-style construction).
pub fn merkle_root<C: CryptoProvider>(crypto: &C, trx_ids: &[U160]) -> U160 {
    if trx_ids.is_empty() {
        return [0u8; 20];
    }
    let mut level: Vec<U160> = trx_ids.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut buf = Vec::with_capacity(40);
            buf.extend_from_slice(&pair[0]);
            buf.extend_from_slice(&pair[1]);
            next.push(crypto.hash160(&buf));
        }
        level = next;
    }
    level[0]
}

/// Builds the genesis block: block_num 0, zero prev id, the given initial
/// allocations as plain `ClaimBySignature` outputs in a single unsigned
/// coinbase-style transaction, and a merkle root computed over that one
/// transaction's id.
pub fn genesis_block<C: CryptoProvider>(
    crypto: &C,
    timestamp: i64,
    initial_difficulty: u128,
    allocations: &[(crate::primitives::Address, Amount)],
) -> TrxBlock {
    use crate::primitives::{Asset, AssetUnit};
    use crate::transaction::{Transaction, TrxOutput};

    let mut total = Amount::ZERO;
    let mut trx = Transaction::new(timestamp);
    trx.valid_after = 0;
    trx.valid_until = 0;
    for (addr, amount) in allocations {
        trx.outputs.push(TrxOutput::to_signature(*addr, Asset::new(*amount, AssetUnit::BTS)));
        total = total.checked_add(*amount).expect("genesis allocation overflow");
    }
    let signed = SignedTransaction::new(trx);
    let trx_id = signed.id(crypto);
    let root = merkle_root(crypto, &[trx_id]);

    let header = BlockHeader {
        version: 1,
        prev: [0u8; 20],
        block_num: 0,
        timestamp,
        next_difficulty: initial_difficulty,
        total_shares: total,
        avail_coindays: Amount::ZERO,
        total_cdd: Amount::ZERO,
        next_fee: Amount::from_raw(0),
        trx_merkle_root: root,
        noncea: 0,
        nonceb: 0,
    };

    TrxBlock { header, trxs: vec![signed] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unity_crypto::Secp256k1Provider;

    #[test]
    fn merkle_root_of_single_id_is_itself() {
        let crypto = Secp256k1Provider::new();
        let id = [5u8; 20];
        assert_eq!(merkle_root(&crypto, &[id]), id);
    }

    #[test]
    fn merkle_root_handles_odd_counts_by_duplication() {
        let crypto = Secp256k1Provider::new();
        let ids = vec![[1u8; 20], [2u8; 20], [3u8; 20]];
        let with_dup = merkle_root(&crypto, &ids);
        let mut padded = ids.clone();
        padded.push(ids[2]);
        let explicit = merkle_root(&crypto, &padded);
        assert_eq!(with_dup, explicit);
    }

    #[test]
    fn genesis_block_allocates_total_shares() {
        let crypto = Secp256k1Provider::new();
        let (_, pubkey) = crypto.generate_keypair();
        let addr = crypto.address_from_public_key(&pubkey);
        let block = genesis_block(&crypto, 1_700_000_000, 1_000_000, &[(addr, Amount::from_units(100))]);
        assert_eq!(block.header.total_shares, Amount::from_units(100));
        assert_eq!(block.header.block_num, 0);
    }
}
