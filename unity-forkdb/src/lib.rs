//! The fork-aware block database (§4.2): tracks every header a node has
//! heard about, including ones on forks that never win, so it can answer
//! "which chain currently has the most work" without re-downloading
//! anything. `unity-core`'s `LedgerState` only ever applies one chain at
//! a time; this crate is what decides *which* chain that is.

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use unity_core::block::BlockHeader;
use unity_core::crypto::CryptoProvider;
use unity_core::params::BITNAME_TIMEKEEPER_WINDOW;
use unity_core::primitives::U160;
use unity_core::TrxBlock;
use unity_storage::{trees, Database, TypedTree};

#[derive(Debug, Error)]
pub enum ForkDbError {
    #[error("header {0:?} is not known")]
    UnknownHeader(U160),
    #[error(transparent)]
    Storage(#[from] unity_storage::StorageError),
}

pub type Result<T> = std::result::Result<T, ForkDbError>;

/// A header's place in the fork graph, once its ancestry back to genesis
/// is known. `height` and `chain_difficulty` are `None` for a header
/// whose parent hasn't arrived yet (§4.2.2's "unknown_parent" state).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaHeader {
    pub header: BlockHeader,
    pub height: Option<u64>,
    pub chain_difficulty: Option<u128>,
    /// Whether this header, and every ancestor back to genesis, is known
    /// good. Invalidity is monotone: once `false`, a header only becomes
    /// `true` again if explicitly re-asserted (`set_valid` never flips a
    /// propagated `false` back on its own).
    pub valid: bool,
    /// The trailing window of ancestor `next_difficulty` values, used to
    /// compute this header's contribution to `chain_difficulty` as a
    /// median rather than the raw per-block value (§4.2.2).
    recent_difficulties: VecDeque<u128>,
}

impl MetaHeader {
    fn connected(&self) -> bool {
        self.height.is_some()
    }
}

fn median(window: &VecDeque<u128>) -> u128 {
    let mut sorted: Vec<u128> = window.iter().copied().collect();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

const GENESIS_PARENT: U160 = [0u8; 20];

/// The fork-aware block database. Every write goes straight to the
/// backing `unity-storage` trees; the only state kept purely in memory
/// is the ordered tip set, which is cheap to rebuild from `headers` on
/// open and needs `BTreeSet` ordering that a KV tree can't give for
/// free.
pub struct ForkDb {
    headers: TypedTree<U160, MetaHeader>,
    blocks: TypedTree<U160, TrxBlock>,
    /// Parent id -> every child header id recorded against it, whether
    /// or not that child is connected yet.
    edges: TypedTree<U160, Vec<U160>>,
    /// Missing-parent id -> child header ids waiting on it (§4.2.1
    /// `fetch_unknown`).
    unknown: TypedTree<U160, Vec<U160>>,
    /// height -> id, a cache of the current best fork's path, rebuilt
    /// whenever the best tip changes so `best_fork_fetch_at` doesn't have
    /// to walk the whole chain on every call.
    nexts: TypedTree<u64, U160>,
    tips: Mutex<BTreeSet<(u128, U160)>>,
}

impl ForkDb {
    /// Opens (or creates) the fork database's trees inside `db` and
    /// rebuilds the in-memory tip set from whatever headers are already
    /// on disk.
    pub fn open(db: &Database) -> Result<Self> {
        let headers: TypedTree<U160, MetaHeader> = db.typed(trees::FORK_HEADERS)?;
        let blocks = db.typed(trees::FORK_BLOCKS)?;
        let edges = db.typed(trees::FORK_EDGES)?;
        let unknown = db.typed(trees::FORK_UNKNOWN)?;
        let nexts = db.typed(trees::FORK_NEXTS)?;

        let mut tips = BTreeSet::new();
        let all: Vec<(U160, MetaHeader)> = headers.iter()?;
        let child_count: HashMap<U160, usize> = {
            let mut counts = HashMap::new();
            for (parent, children) in edges.iter()? {
                counts.insert(parent, children.len());
            }
            counts
        };
        for (id, meta) in &all {
            if meta.connected() && child_count.get(id).copied().unwrap_or(0) == 0 {
                tips.insert((meta.chain_difficulty.unwrap(), *id));
            }
        }
        info!(headers = all.len(), tips = tips.len(), "opened fork database");
        Ok(ForkDb { headers, blocks, edges, unknown, nexts, tips: Mutex::new(tips) })
    }

    /// Records `header`, linking it to its parent and updating
    /// chain-difficulty if the parent (or the whole ancestor chain) is
    /// already known. Idempotent: re-caching a header already on file is
    /// a no-op.
    pub fn cache_header<C: CryptoProvider>(&self, crypto: &C, header: &BlockHeader) -> Result<U160> {
        let id = header.id(crypto);
        if self.headers.get(&id)?.is_some() {
            return Ok(id);
        }

        self.record_edge(&header.prev, &id)?;

        let is_genesis = header.prev == GENESIS_PARENT && header.block_num == 0;
        let parent = if is_genesis { None } else { self.headers.get(&header.prev)? };

        let meta = match (is_genesis, &parent) {
            (true, _) => self.connect(header.clone(), None),
            (false, Some(p)) if p.connected() => self.connect(header.clone(), Some(p)),
            _ => MetaHeader {
                header: header.clone(),
                height: None,
                chain_difficulty: None,
                valid: false,
                recent_difficulties: VecDeque::new(),
            },
        };

        let connected = meta.connected();
        self.headers.put(&id, &meta)?;

        if connected {
            self.tips.lock().insert((meta.chain_difficulty.unwrap(), id));
            self.connect_orphans(id)?;
        } else {
            self.add_unknown(&header.prev, id)?;
            debug!(parent = ?header.prev, child = ?id, "header cached as orphan, parent unknown");
        }

        Ok(id)
    }

    /// `cache_header` plus the transaction payload, for when the full
    /// block body is available (e.g. it was just mined locally, or a
    /// peer sent the whole block rather than just its header).
    pub fn cache_block<C: CryptoProvider>(&self, crypto: &C, block: &TrxBlock) -> Result<U160> {
        let id = self.cache_header(crypto, &block.header)?;
        self.blocks.put(&id, block)?;
        Ok(id)
    }

    pub fn block(&self, id: &U160) -> Result<Option<TrxBlock>> {
        Ok(self.blocks.get(id)?)
    }

    pub fn header(&self, id: &U160) -> Result<Option<MetaHeader>> {
        Ok(self.headers.get(id)?)
    }

    /// Marks `id` valid or invalid. Invalidity propagates to every
    /// descendant (§4.2.1): a chain built on a bad block is bad too.
    /// Marking a header valid again only changes that header itself; it
    /// does not revive descendants that were separately invalidated.
    pub fn set_valid(&self, id: U160, valid: bool) -> Result<()> {
        let mut meta = self.headers.get(&id)?.ok_or(ForkDbError::UnknownHeader(id))?;
        meta.valid = valid;
        self.headers.put(&id, &meta)?;

        if !valid {
            let mut queue: VecDeque<U160> = self.edges.get(&id)?.unwrap_or_default().into();
            while let Some(child_id) = queue.pop_front() {
                if let Some(mut child) = self.headers.get(&child_id)? {
                    if child.valid {
                        child.valid = false;
                        self.headers.put(&child_id, &child)?;
                    }
                    for grandchild in self.edges.get(&child_id)?.unwrap_or_default() {
                        queue.push_back(grandchild);
                    }
                }
            }
            warn!(id = ?id, "header and its descendants marked invalid");
        }
        Ok(())
    }

    /// The tip with the greatest `chain_difficulty` whose chain to
    /// genesis is fully valid, or `None` if no connected header is
    /// known-good yet.
    pub fn best_fork_head_id(&self) -> Option<U160> {
        let tips = self.tips.lock();
        for (_, id) in tips.iter().rev() {
            if let Ok(Some(meta)) = self.headers.get(id) {
                if meta.valid {
                    return Some(*id);
                }
            }
        }
        None
    }

    /// Walks back from the best tip to find the header at `height`.
    /// Consults (and refreshes) the `nexts` fast-path cache first.
    pub fn best_fork_fetch_at(&self, height: u64) -> Result<Option<BlockHeader>> {
        let Some(tip_id) = self.best_fork_head_id() else { return Ok(None) };
        if let Some(cached_id) = self.nexts.get(&height)? {
            if let Some(meta) = self.headers.get(&cached_id)? {
                if meta.valid && self.is_ancestor_or_self(&cached_id, &tip_id)? {
                    return Ok(Some(meta.header));
                }
            }
        }

        let mut current = self.headers.get(&tip_id)?.ok_or(ForkDbError::UnknownHeader(tip_id))?;
        loop {
            match current.height {
                Some(h) if h == height => return Ok(Some(current.header)),
                Some(h) if h < height => return Ok(None),
                _ => {}
            }
            if current.header.prev == GENESIS_PARENT {
                return Ok(None);
            }
            current = self.headers.get(&current.header.prev)?.ok_or(ForkDbError::UnknownHeader(current.header.prev))?;
        }
    }

    /// Rebuilds the `nexts` height->id cache along the current best
    /// fork. The fetch loop calls this after a reorg settles so future
    /// `best_fork_fetch_at` lookups hit the cache instead of walking.
    pub fn rebuild_fast_lookup(&self) -> Result<()> {
        let Some(tip_id) = self.best_fork_head_id() else { return Ok(()) };
        let mut id = tip_id;
        loop {
            let meta = self.headers.get(&id)?.ok_or(ForkDbError::UnknownHeader(id))?;
            self.nexts.put(&meta.height.unwrap(), &id)?;
            if meta.header.prev == GENESIS_PARENT {
                break;
            }
            id = meta.header.prev;
        }
        Ok(())
    }

    /// Header ids whose parent has never arrived (§4.2.1).
    pub fn fetch_unknown(&self) -> Result<Vec<U160>> {
        Ok(self.unknown.iter()?.into_iter().map(|(id, _)| id).collect())
    }

    fn connect(&self, header: BlockHeader, parent: Option<&MetaHeader>) -> MetaHeader {
        let height = parent.map(|p| p.height.unwrap() + 1).unwrap_or(0);
        let mut recent = parent.map(|p| p.recent_difficulties.clone()).unwrap_or_default();
        recent.push_back(header.next_difficulty);
        while recent.len() > BITNAME_TIMEKEEPER_WINDOW {
            recent.pop_front();
        }
        let step = median(&recent);
        let chain_difficulty = parent.and_then(|p| p.chain_difficulty).unwrap_or(0) + step;
        MetaHeader { header, height: Some(height), chain_difficulty: Some(chain_difficulty), valid: true, recent_difficulties: recent }
    }

    /// BFS over whatever subtree was hanging off `parent_id` waiting for
    /// it to connect (§4.2.2: "when the parent later arrives, the
    /// recursive update runs from the just-completed link").
    fn connect_orphans(&self, parent_id: U160) -> Result<()> {
        let mut queue: VecDeque<U160> = VecDeque::new();
        if let Some(waiting) = self.unknown.get(&parent_id)? {
            queue.extend(waiting);
            self.unknown.remove(&parent_id)?;
        }

        while let Some(id) = queue.pop_front() {
            let orphan = self.headers.get(&id)?.ok_or(ForkDbError::UnknownHeader(id))?;
            if orphan.connected() {
                continue;
            }
            let parent = self.headers.get(&orphan.header.prev)?.ok_or(ForkDbError::UnknownHeader(orphan.header.prev))?;
            let meta = self.connect(orphan.header.clone(), Some(&parent));
            self.headers.put(&id, &meta)?;
            self.tips.lock().insert((meta.chain_difficulty.unwrap(), id));
            if let Some(grandchildren) = self.unknown.get(&id)? {
                queue.extend(grandchildren);
                self.unknown.remove(&id)?;
            }
        }
        Ok(())
    }

    fn record_edge(&self, parent_id: &U160, child_id: &U160) -> Result<()> {
        let mut children = self.edges.get(parent_id)?.unwrap_or_default();
        if !children.contains(child_id) {
            children.push(*child_id);
            // A parent that just gained a child is no longer a leaf.
            if let Some(parent_meta) = self.headers.get(parent_id)? {
                if let Some(diff) = parent_meta.chain_difficulty {
                    self.tips.lock().remove(&(diff, *parent_id));
                }
            }
        }
        self.edges.put(parent_id, &children)?;
        Ok(())
    }

    fn add_unknown(&self, parent_id: &U160, child_id: U160) -> Result<()> {
        let mut waiting = self.unknown.get(parent_id)?.unwrap_or_default();
        if !waiting.contains(&child_id) {
            waiting.push(child_id);
        }
        self.unknown.put(parent_id, &waiting)
    }

    fn is_ancestor_or_self(&self, candidate: &U160, descendant: &U160) -> Result<bool> {
        let mut current = *descendant;
        loop {
            if current == *candidate {
                return Ok(true);
            }
            let Some(meta) = self.headers.get(&current)? else { return Ok(false) };
            if meta.header.prev == GENESIS_PARENT {
                return Ok(false);
            }
            current = meta.header.prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unity_core::genesis_block;
    use unity_crypto::Secp256k1Provider;

    fn db() -> Database {
        Database::open_temporary().unwrap()
    }

    fn child_of<C: CryptoProvider>(crypto: &C, parent: &BlockHeader, difficulty: u128) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev: parent.id(crypto),
            block_num: parent.block_num + 1,
            timestamp: parent.timestamp + 300,
            next_difficulty: difficulty,
            total_shares: parent.total_shares,
            avail_coindays: parent.avail_coindays,
            total_cdd: parent.total_cdd,
            next_fee: parent.next_fee,
            trx_merkle_root: [0u8; 20],
            noncea: 0,
            nonceb: 0,
        }
    }

    #[test]
    fn connects_a_simple_chain_and_tracks_the_best_tip() {
        let crypto = Secp256k1Provider::new();
        let forkdb = ForkDb::open(&db()).unwrap();
        let genesis = genesis_block(&crypto, 1_700_000_000, 100, &[]).header;
        let genesis_id = forkdb.cache_header(&crypto, &genesis).unwrap();

        let h1 = child_of(&crypto, &genesis, 100);
        let h1_id = forkdb.cache_header(&crypto, &h1).unwrap();
        let h2 = child_of(&crypto, &h1, 100);
        let h2_id = forkdb.cache_header(&crypto, &h2).unwrap();

        assert_eq!(forkdb.best_fork_head_id(), Some(h2_id));
        let meta = forkdb.header(&h2_id).unwrap().unwrap();
        assert_eq!(meta.height, Some(2));
        assert!(meta.chain_difficulty.unwrap() > forkdb.header(&h1_id).unwrap().unwrap().chain_difficulty.unwrap());
        assert_eq!(forkdb.header(&genesis_id).unwrap().unwrap().height, Some(0));
    }

    #[test]
    fn orphans_connect_once_their_parent_arrives() {
        let crypto = Secp256k1Provider::new();
        let forkdb = ForkDb::open(&db()).unwrap();
        let genesis = genesis_block(&crypto, 1_700_000_000, 100, &[]).header;
        let h1 = child_of(&crypto, &genesis, 100);
        let h2 = child_of(&crypto, &h1, 100);

        // Cache the grandchild before its parent: both should land in
        // `fetch_unknown` until genesis arrives.
        let h2_id = forkdb.cache_header(&crypto, &h2).unwrap();
        assert!(forkdb.header(&h2_id).unwrap().unwrap().height.is_none());
        assert_eq!(forkdb.best_fork_head_id(), None);

        forkdb.cache_header(&crypto, &h1).unwrap();
        assert_eq!(forkdb.fetch_unknown().unwrap(), vec![h1.prev]);

        forkdb.cache_header(&crypto, &genesis).unwrap();
        assert!(forkdb.fetch_unknown().unwrap().is_empty());
        assert_eq!(forkdb.best_fork_head_id(), Some(h2_id));
        assert_eq!(forkdb.header(&h2_id).unwrap().unwrap().height, Some(2));
    }

    #[test]
    fn invalidity_propagates_to_descendants_and_reorgs_the_best_tip() {
        let crypto = Secp256k1Provider::new();
        let forkdb = ForkDb::open(&db()).unwrap();
        let genesis = genesis_block(&crypto, 1_700_000_000, 100, &[]).header;
        forkdb.cache_header(&crypto, &genesis).unwrap();

        let h1 = child_of(&crypto, &genesis, 100);
        let h1_id = forkdb.cache_header(&crypto, &h1).unwrap();
        let h2 = child_of(&crypto, &h1, 100);
        let h2_id = forkdb.cache_header(&crypto, &h2).unwrap();

        // A competing, lower-difficulty fork off genesis.
        let alt = child_of(&crypto, &genesis, 1);
        let alt_id = forkdb.cache_header(&crypto, &alt).unwrap();

        assert_eq!(forkdb.best_fork_head_id(), Some(h2_id));

        forkdb.set_valid(h1_id, false).unwrap();
        assert!(!forkdb.header(&h2_id).unwrap().unwrap().valid);
        assert_eq!(forkdb.best_fork_head_id(), Some(alt_id));
    }

    #[test]
    fn best_fork_fetch_at_walks_back_to_the_requested_height() {
        let crypto = Secp256k1Provider::new();
        let forkdb = ForkDb::open(&db()).unwrap();
        let genesis = genesis_block(&crypto, 1_700_000_000, 100, &[]).header;
        forkdb.cache_header(&crypto, &genesis).unwrap();
        let h1 = child_of(&crypto, &genesis, 100);
        forkdb.cache_header(&crypto, &h1).unwrap();
        let h2 = child_of(&crypto, &h1, 100);
        forkdb.cache_header(&crypto, &h2).unwrap();

        let fetched = forkdb.best_fork_fetch_at(1).unwrap().unwrap();
        assert_eq!(fetched.block_num, h1.block_num);

        forkdb.rebuild_fast_lookup().unwrap();
        let cached = forkdb.best_fork_fetch_at(1).unwrap().unwrap();
        assert_eq!(cached.block_num, h1.block_num);
    }
}
