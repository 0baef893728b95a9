//! Checkpointing for `unity_core::ledger::LedgerState` (§6.3): the
//! ledger's own authoritative applied chain, keyed by height under
//! `chain/blocks`, distinct from `unity-forkdb`'s candidate-graph trees
//! (which key by id and keep every fork, not just the applied one).
//!
//! `LedgerState` itself stays a pure in-memory structure (it cannot
//! depend on this crate without a cycle); this is the load-on-open and
//! write-through layer a node wraps around it. On open, every persisted
//! block is replayed through `LedgerState::push_block` in height order
//! to rebuild the UTXO set, market indices and trx index — the same
//! "index rebuilt from an authoritative map, never a substitute for it"
//! pattern `unity_core::market::index_output` already documents for the
//! in-memory side.

use unity_core::crypto::CryptoProvider;
use unity_core::ledger::LedgerState;
use unity_core::primitives::{Address, PtsAddress};
use unity_core::TrxBlock;

use crate::{trees, Database, Result, StorageError, TypedTree};

pub struct LedgerStore {
    blocks: TypedTree<u64, TrxBlock>,
    pts_registry: TypedTree<PtsAddress, Address>,
}

impl LedgerStore {
    pub fn open(db: &Database) -> Result<Self> {
        Ok(LedgerStore { blocks: db.typed(trees::BLOCKS)?, pts_registry: db.typed(trees::PTS_REGISTRY)? })
    }

    /// Rebuilds a `LedgerState` by replaying every persisted block from
    /// genesis, then layering the persisted pts-address registrations on
    /// top (registration is out-of-band data, not produced by block
    /// application itself).
    pub fn load<C: CryptoProvider>(&self, crypto: &C) -> Result<LedgerState> {
        let mut state = LedgerState::new();
        let mut heights: Vec<u64> = self.blocks.iter()?.into_iter().map(|(h, _)| h).collect();
        heights.sort_unstable();
        for height in heights {
            if let Some(block) = self.blocks.get(&height)? {
                state.push_block(crypto, &block).map_err(|e| StorageError::Corrupt(e.to_string()))?;
            }
        }
        for (pts, owner) in self.pts_registry.iter()? {
            state.register_pts(pts, owner);
        }
        Ok(state)
    }

    /// Persists a newly-applied block. Called alongside (immediately
    /// after) `LedgerState::push_block` so a restart can replay exactly
    /// what was applied.
    pub fn persist_block(&self, block: &TrxBlock) -> Result<()> {
        self.blocks.put(&block.header.block_num, block)
    }

    /// Reverses `persist_block` for a popped tip, mirroring
    /// `LedgerState::pop_block`.
    pub fn remove_block(&self, height: u64) -> Result<()> {
        self.blocks.remove(&height)
    }

    pub fn register_pts(&self, pts: &PtsAddress, owner: &Address) -> Result<()> {
        self.pts_registry.put(pts, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unity_core::primitives::{Address, Amount};
    use unity_crypto::Secp256k1Provider;

    #[test]
    fn load_replays_persisted_blocks_into_a_fresh_ledger() {
        let crypto = Secp256k1Provider::new();
        let db = Database::open_temporary().unwrap();
        let store = LedgerStore::open(&db).unwrap();

        let (_secret, pubkey) = crypto.generate_keypair();
        let owner = crypto.address_from_public_key(&pubkey);
        let genesis = unity_core::block::genesis_block(&crypto, 1_700_000_000, 1, &[(owner, Amount::from_units(100))]);
        store.persist_block(&genesis).unwrap();

        let state = store.load(&crypto).unwrap();
        assert_eq!(state.tip_height(), 0);
        assert_eq!(state.headers.len(), 1);
    }

    #[test]
    fn pts_registrations_persist_across_reopen() {
        let db = Database::open_temporary().unwrap();
        let store = LedgerStore::open(&db).unwrap();
        let pts = PtsAddress::default();
        let owner = Address::default();
        store.register_pts(&pts, &owner).unwrap();

        let store2 = LedgerStore::open(&db).unwrap();
        let crypto = Secp256k1Provider::new();
        let state = store2.load(&crypto).unwrap();
        assert_eq!(state.pts_registry.get(&pts), Some(&owner));
    }
}
