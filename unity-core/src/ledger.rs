//! The ledger/market engine (§4.1): transaction evaluation, the
//! deterministic continuous double auction, and block application.
//!
//! `Ledger<C>` owns every piece of state in §3.4: the trx-id and
//! trx-num indices, per-block headers and transaction lists, and the
//! market bid/ask/call indices used by `match_orders`. It is generic
//! over `CryptoProvider` so the same engine runs against whichever
//! concrete signer/hasher `unity-crypto` supplies.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::block::{merkle_root, proof_of_work_value, BlockHeader, TrxBlock};
use crate::claim::Claim;
use crate::crypto::CryptoProvider;
use crate::error::{BlockError, EvalError};
use crate::params::{MAX_FUTURE_DRIFT_SEC, MIN_BLOCK_INTERVAL_SEC};
use crate::primitives::{Address, Amount, Asset, AssetUnit, OutputIndex, OutputReference, PtsAddress, U160};
use crate::transaction::{SignedTransaction, Transaction, TrxOutput};

/// How many recent block ids are remembered for `stake` anti-replay
/// validation; the original ties `stake` to "a recent block id" without
/// pinning an exact depth, so this is a generous, clearly-named window.
pub const RECENT_BLOCK_ID_WINDOW: usize = 1024;

/// A transaction's position in the chain: which block, and which index
/// within that block's transaction list.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TrxNum {
    pub block_num: u64,
    pub index: u16,
}

/// A transaction together with, for each of its outputs, whether that
/// output has since been spent and by which input transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaTrx {
    pub signed: SignedTransaction,
    /// `spent[i]` is the id of the transaction that consumed output `i`,
    /// or `None` if it is still unspent.
    pub spent: Vec<Option<U160>>,
}

impl MetaTrx {
    fn new(signed: SignedTransaction) -> MetaTrx {
        let n = signed.trx.outputs.len();
        MetaTrx { spent: vec![None; n], signed }
    }
}

/// Outcome of evaluating a transaction: what it paid in fees per unit,
/// how much coindays it destroyed, and its gross per-unit spend.
#[derive(Clone, Debug, Default)]
pub struct Eval {
    pub fees: BTreeMap<AssetUnit, Amount>,
    pub coindays_destroyed: Amount,
    pub total_spent: BTreeMap<AssetUnit, Amount>,
}

#[derive(Default)]
struct UnitLedger {
    input: Amount,
    output: Amount,
}

/// Running sum of resting-order size for one asset unit, used by the
/// market-depth gate (§4.1.3 step 5).
#[derive(Copy, Clone, Default, Debug, Serialize, Deserialize)]
pub struct DepthStats {
    pub bid_depth: Amount,
    pub ask_depth: Amount,
}

use crate::market::{BidKey, CallKey};

/// Everything the ledger and market engine need, held in memory. A
/// production node backs the indices here with `unity-storage`'s
/// `KvStore`; this struct is the authoritative in-memory view rebuilt
/// from (or checkpointed to) that store.
#[derive(Default)]
pub struct LedgerState {
    pub trx_id_to_num: HashMap<U160, TrxNum>,
    pub trx_num_to_meta: HashMap<TrxNum, MetaTrx>,
    pub headers: BTreeMap<u64, BlockHeader>,
    pub block_trx_ids: BTreeMap<u64, Vec<U160>>,
    pub bids: BTreeMap<BidKey, OutputReference>,
    pub asks: BTreeMap<BidKey, OutputReference>,
    pub calls: BTreeMap<CallKey, OutputReference>,
    pub depth_stats: HashMap<(AssetUnit, AssetUnit), DepthStats>,
    pub recent_block_ids: VecDeque<U160>,
    pub fee_rate: Amount,
    /// pts->address registrations (§3.5's `ClaimByPts`): a legacy
    /// pts-address output is only spendable once its owner has been
    /// resolved to a real `Address` here. Populated out of band (genesis
    /// allocations, a future wallet-submitted registration), never by
    /// block application itself.
    pub pts_registry: BTreeMap<PtsAddress, Address>,
}

impl LedgerState {
    pub fn new() -> LedgerState {
        LedgerState { fee_rate: Amount::from_raw(1), ..Default::default() }
    }

    pub fn tip_height(&self) -> u64 {
        self.headers.keys().next_back().copied().unwrap_or(0)
    }

    pub fn tip_header(&self) -> Option<&BlockHeader> {
        self.headers.values().next_back()
    }

    /// Registers (or overwrites) the address a pts-address output
    /// resolves to. Not part of block application; a node wires this in
    /// from genesis config or a separate registration mechanism.
    pub fn register_pts(&mut self, pts: PtsAddress, owner: Address) {
        self.pts_registry.insert(pts, owner);
    }

    pub(crate) fn resolve_pts(&self, pts: &PtsAddress) -> Option<Address> {
        self.pts_registry.get(pts).copied()
    }

    /// Resolves output references to their current (unspent) outputs.
    /// Fails if any reference is unknown.
    pub fn fetch_inputs(&self, refs: &[OutputReference]) -> Result<Vec<TrxOutput>, EvalError> {
        refs.iter().map(|r| self.fetch_output(r).map(|o| o.clone())).collect()
    }

    pub(crate) fn meta_trx_for(&self, trx_hash: &U160) -> Option<&MetaTrx> {
        self.trx_id_to_num.get(trx_hash).and_then(|num| self.trx_num_to_meta.get(num))
    }

    pub(crate) fn fetch_output(&self, r: &OutputReference) -> Result<&TrxOutput, EvalError> {
        let meta = self.meta_trx_for(&r.trx_hash).ok_or(EvalError::UnknownOutput(*r))?;
        meta.signed
            .trx
            .outputs
            .get(r.output_idx as usize)
            .ok_or(EvalError::UnknownOutput(*r))
    }

    pub(crate) fn output_spent_by(&self, r: &OutputReference) -> Option<U160> {
        self.meta_trx_for(&r.trx_hash)
            .and_then(|meta| meta.spent.get(r.output_idx as usize).copied().flatten())
    }

    pub(crate) fn output_created_block(&self, r: &OutputReference) -> Option<u64> {
        self.trx_id_to_num.get(&r.trx_hash).map(|n| n.block_num)
    }

    /// Evaluates a signed transaction against current state without
    /// mutating anything. `is_market` marks whether this transaction is
    /// being produced by the deterministic match engine, which is the
    /// only context allowed to spend `ClaimByBid`/`ClaimByLong` inputs.
    pub fn evaluate<C: CryptoProvider>(
        &self,
        crypto: &C,
        signed: &SignedTransaction,
        is_market: bool,
        now: i64,
        current_height: u64,
    ) -> Result<Eval, EvalError> {
        if !signed.trx.is_time_valid(now) {
            return Err(EvalError::TimeWindow);
        }
        if signed.trx.stake != 0 && !self.recent_block_ids.iter().any(|id| last8(id) == signed.trx.stake) {
            return Err(EvalError::BadStake(signed.trx.stake));
        }

        let signers = signed.get_signed_addresses(crypto).map_err(|_| EvalError::MissingSignature)?;

        let mut units: BTreeMap<AssetUnit, UnitLedger> = BTreeMap::new();
        let mut coindays_destroyed = Amount::ZERO;

        for input in &signed.trx.inputs {
            let output = self.fetch_output(&input.output_ref)?;
            if self.output_spent_by(&input.output_ref).is_some() {
                return Err(EvalError::AlreadySpent(input.output_ref));
            }
            self.check_claim(&output.claim, &signers, is_market, signed)?;

            let entry = units.entry(output.amount.unit).or_default();
            entry.input = entry.input.checked_add(output.amount.amount)?;

            if output.amount.unit == AssetUnit::BTS {
                if let Some(created_at) = self.output_created_block(&input.output_ref) {
                    let age = current_height.saturating_sub(created_at);
                    let cdd = output.amount.amount.checked_mul_ratio((age as u128) * crate::params::AMOUNT_SCALE as u128)?;
                    coindays_destroyed = coindays_destroyed.checked_add(cdd)?;
                }
            }
        }

        for output in &signed.trx.outputs {
            let entry = units.entry(output.amount.unit).or_default();
            entry.output = entry.output.checked_add(output.amount.amount)?;
        }

        let mut fees = BTreeMap::new();
        let size = signed.size() as i128;
        for (unit, ledger) in &units {
            let surplus = ledger.input.checked_sub(ledger.output)?;
            if *unit == AssetUnit::BTS {
                let required = self.fee_rate.raw().checked_mul(size).ok_or(crate::error::AmountError::Overflow)?;
                if surplus.raw() < required {
                    return Err(EvalError::FeeTooLow { paid: surplus.raw(), required });
                }
                fees.insert(*unit, surplus);
            } else if surplus.is_negative() {
                return Err(EvalError::Unbalanced(*unit, ledger.input.raw(), ledger.output.raw()));
            } else {
                fees.insert(*unit, surplus);
            }
        }

        let total_spent = units.into_iter().map(|(u, l)| (u, l.input)).collect();
        Ok(Eval { fees, coindays_destroyed, total_spent })
    }

    fn check_claim(
        &self,
        claim: &Claim,
        signers: &std::collections::BTreeSet<Address>,
        is_market: bool,
        trx: &SignedTransaction,
    ) -> Result<(), EvalError> {
        match claim {
            Claim::BySignature { owner } => {
                if signers.contains(owner) {
                    Ok(())
                } else {
                    Err(EvalError::ClaimRejected)
                }
            }
            Claim::ByPts { owner } => {
                // owner resolves via the pts->address registry; once
                // resolved, the same signature check as `BySignature`
                // applies. An unregistered pts address can never be
                // spent, rather than accepting any signer.
                match self.resolve_pts(owner) {
                    Some(resolved) if signers.contains(&resolved) => Ok(()),
                    _ => Err(EvalError::ClaimRejected),
                }
            }
            Claim::ByBid { .. } | Claim::ByLong { .. } => {
                if is_market {
                    Ok(())
                } else {
                    Err(EvalError::ClaimRejected)
                }
            }
            Claim::ByCover { payoff, owner } => {
                // accepted when either the spend is being performed by
                // margin-call logic, or the user supplies the debt asset
                // among the transaction's outputs (paying it off).
                if is_market {
                    return Ok(());
                }
                let repaid = trx
                    .trx
                    .outputs
                    .iter()
                    .filter(|o| o.amount.unit == payoff.unit)
                    .filter(|o| matches!(&o.claim, Claim::BySignature { owner: paid_to } if paid_to == owner))
                    .try_fold(Amount::ZERO, |acc, o| acc.checked_add(o.amount.amount))
                    .unwrap_or(Amount::ZERO);
                if repaid.raw() >= payoff.amount.raw() {
                    Ok(())
                } else {
                    Err(EvalError::ClaimRejected)
                }
            }
        }
    }

    /// Checks every §3.3 chain invariant for `block` against `self` as
    /// the parent tip. `unity-forkdb` only orders candidate headers by
    /// chain difficulty; it never looks inside a block, so this is the
    /// one place all seven invariants are actually enforced. Callers
    /// (the node's block-application path) are expected to call this
    /// before `push_block`, which trusts its input.
    pub fn validate_block<C: CryptoProvider>(
        &self,
        crypto: &C,
        block: &TrxBlock,
        now: i64,
    ) -> Result<(), BlockError> {
        let header = &block.header;

        if header.block_num == 0 {
            let ids: Vec<U160> = block.trxs.iter().map(|t| t.id(crypto)).collect();
            if merkle_root(crypto, &ids) != header.trx_merkle_root {
                return Err(BlockError::BadMerkleRoot);
            }
            return Ok(());
        }

        let parent = self
            .tip_header()
            .ok_or(BlockError::BadHeight { expected: 0, found: header.block_num })?;

        let expected_height = parent.block_num + 1;
        if header.block_num != expected_height || header.prev != parent.id(crypto) {
            return Err(BlockError::BadHeight { expected: expected_height, found: header.block_num });
        }

        if header.timestamp <= parent.timestamp + MIN_BLOCK_INTERVAL_SEC
            || header.timestamp > now + MAX_FUTURE_DRIFT_SEC
        {
            return Err(BlockError::BadTimestamp { ts: header.timestamp });
        }

        let ids: Vec<U160> = block.trxs.iter().map(|t| t.id(crypto)).collect();
        if merkle_root(crypto, &ids) != header.trx_merkle_root {
            return Err(BlockError::BadMerkleRoot);
        }

        let required = parent.next_difficulty;
        let found = proof_of_work_value(crypto, header);
        if found < required {
            return Err(BlockError::InsufficientWork { found, required });
        }

        // §4.1.3/§9: the deterministic market-match output must appear
        // as an exact prefix of the block's transaction list, byte for
        // byte, so every honest node that re-runs `match_orders` agrees
        // the block didn't smuggle in a different match.
        let market_trxs = self.match_orders(crypto);
        if block.trxs.len() < market_trxs.len() {
            return Err(BlockError::BadMarketPrefix);
        }
        for (expected, found) in market_trxs.iter().zip(block.trxs.iter()) {
            if expected.id(crypto) != found.id(crypto) {
                return Err(BlockError::BadMarketPrefix);
            }
        }

        let mut spent_refs = std::collections::HashSet::new();
        let mut size_used = 0usize;
        let mut total_cdd = Amount::ZERO;
        for (idx, signed) in block.trxs.iter().enumerate() {
            let is_market = idx < market_trxs.len();
            for input in &signed.trx.inputs {
                if !spent_refs.insert(input.output_ref) {
                    return Err(BlockError::Eval(EvalError::AlreadySpent(input.output_ref)));
                }
            }
            let eval = self
                .evaluate(crypto, signed, is_market, header.timestamp, header.block_num)
                .map_err(BlockError::Eval)?;
            total_cdd = total_cdd
                .checked_add(eval.coindays_destroyed)
                .map_err(|e| BlockError::Eval(EvalError::from(e)))?;
            size_used += signed.size();
        }

        if header.total_shares != parent.total_shares {
            return Err(BlockError::UnbalancedUnit(AssetUnit::BTS));
        }
        if header.total_cdd != total_cdd {
            return Err(BlockError::UnbalancedUnit(AssetUnit::BTS));
        }

        let expected_next_difficulty = self.next_required_difficulty(header.block_num);
        if header.next_difficulty != expected_next_difficulty {
            return Err(BlockError::BadNextFee);
        }
        let expected_next_fee = self.next_fee_rate(size_used);
        if header.next_fee != expected_next_fee {
            return Err(BlockError::BadNextFee);
        }

        Ok(())
    }

    /// Applies a validated block: records headers/trxs, marks spent
    /// outputs, reindexes the market, and updates the recent-block-id
    /// window. Callers are expected to have already run `validate_block`
    /// (see `unity-forkdb` for the chain-selection half of §3.3); this
    /// only performs the state transition itself.
    pub fn push_block<C: CryptoProvider>(&mut self, crypto: &C, block: &TrxBlock) -> Result<(), BlockError> {
        let height = block.header.block_num;

        // Resolve every output about to be spent before mutating
        // anything, so a resting `ByBid`/`ByLong`/`ByCover` order can
        // still be unindexed by its claim once marked spent below.
        let mut spent_outputs: Vec<(OutputReference, TrxOutput)> = Vec::new();
        for signed in &block.trxs {
            for input in &signed.trx.inputs {
                if let Ok(out) = self.fetch_output(&input.output_ref) {
                    spent_outputs.push((input.output_ref, out.clone()));
                }
            }
        }

        let mut ids = Vec::with_capacity(block.trxs.len());
        for (idx, signed) in block.trxs.iter().enumerate() {
            let id = signed.id(crypto);
            ids.push(id);
            let num = TrxNum { block_num: height, index: idx as u16 };
            for input in &signed.trx.inputs {
                if let Some(meta) = self
                    .trx_id_to_num
                    .get(&input.output_ref.trx_hash)
                    .copied()
                    .and_then(|n| self.trx_num_to_meta.get_mut(&n))
                {
                    if let Some(slot) = meta.spent.get_mut(input.output_ref.output_idx as usize) {
                        *slot = Some(id);
                    }
                }
            }
            self.trx_id_to_num.insert(id, num);
            self.trx_num_to_meta.insert(num, MetaTrx::new(signed.clone()));
            self.reindex_outputs(signed, num, id);
        }

        for (output_ref, out) in &spent_outputs {
            self.unindex_one(out, *output_ref);
        }

        self.headers.insert(height, block.header.clone());
        self.block_trx_ids.insert(height, ids.clone());
        for id in ids {
            self.recent_block_ids.push_back(id);
            if self.recent_block_ids.len() > RECENT_BLOCK_ID_WINDOW {
                self.recent_block_ids.pop_front();
            }
        }
        let _ = merkle_root; // used by callers validating §3.3 invariant 3
        Ok(())
    }

    /// Reverses `push_block`'s effects for the tip block, for use by the
    /// fork database when it needs to roll the applied head back to a
    /// common ancestor before switching chains.
    pub fn pop_block(&mut self, height: u64) {
        let Some(ids) = self.block_trx_ids.remove(&height) else { return };
        self.headers.remove(&height);

        // Mirror of `push_block`'s unindex: any resting order this block
        // consumed must return to the book once the block is rolled back.
        let mut reopened_outputs: Vec<(OutputReference, TrxOutput)> = Vec::new();
        for id in &ids {
            if let Some(num) = self.trx_id_to_num.remove(id) {
                if let Some(meta) = self.trx_num_to_meta.remove(&num) {
                    for input in &meta.signed.trx.inputs {
                        if let Ok(out) = self.fetch_output(&input.output_ref) {
                            reopened_outputs.push((input.output_ref, out.clone()));
                        }
                        if let Some(prev_num) = self.trx_id_to_num.get(&input.output_ref.trx_hash).copied() {
                            if let Some(prev_meta) = self.trx_num_to_meta.get_mut(&prev_num) {
                                if let Some(slot) = prev_meta.spent.get_mut(input.output_ref.output_idx as usize) {
                                    *slot = None;
                                }
                            }
                        }
                    }
                    self.unindex_outputs(&meta.signed, *id);
                }
            }
        }
        for (output_ref, out) in &reopened_outputs {
            self.index_one(out, *output_ref);
        }
        self.recent_block_ids.retain(|id| !ids.contains(id));
    }

    fn output_index(num: TrxNum, out: u16) -> OutputIndex {
        OutputIndex { block: num.block_num as u32, trx: num.index, out }
    }

    fn reindex_outputs(&mut self, signed: &SignedTransaction, num: TrxNum, trx_id: U160) {
        for (i, out) in signed.trx.outputs.iter().enumerate() {
            let _ = Self::output_index(num, i as u16);
            let output_ref = OutputReference { trx_hash: trx_id, output_idx: i as u16 };
            self.index_one(out, output_ref);
        }
    }

    fn unindex_outputs(&mut self, signed: &SignedTransaction, trx_id: U160) {
        for (i, out) in signed.trx.outputs.iter().enumerate() {
            let output_ref = OutputReference { trx_hash: trx_id, output_idx: i as u16 };
            self.unindex_one(out, output_ref);
        }
    }

    fn index_one(&mut self, out: &TrxOutput, output_ref: OutputReference) {
        crate::market::index_output(self, out, output_ref, true);
    }

    fn unindex_one(&mut self, out: &TrxOutput, output_ref: OutputReference) {
        crate::market::index_output(self, out, output_ref, false);
    }
}

fn last8(id: &U160) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&id[12..20]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::Claim;
    use crate::primitives::AssetUnit;
    use unity_crypto::Secp256k1Provider;

    #[test]
    fn evaluate_rejects_missing_signature() {
        let crypto = Secp256k1Provider::new();
        let mut state = LedgerState::new();

        let (secret, pubkey) = crypto.generate_keypair();
        let owner = crypto.address_from_public_key(&pubkey);
        let funding = SignedTransaction::new({
            let mut t = Transaction::new(0);
            t.outputs.push(TrxOutput::to_signature(owner, Asset::new(Amount::from_units(10), AssetUnit::BTS)));
            t
        });
        let block = crate::block::genesis_block(&crypto, 0, 1, &[(owner, Amount::from_units(10))]);
        state.push_block(&crypto, &block).unwrap();
        let _ = funding;

        let coinbase_id = block.trxs[0].id(&crypto);
        let mut spend = Transaction::new(1);
        spend.inputs.push(crate::transaction::TrxInput::new(OutputReference { trx_hash: coinbase_id, output_idx: 0 }));
        spend.outputs.push(TrxOutput::to_signature(owner, Asset::new(Amount::from_units(10), AssetUnit::BTS)));
        let unsigned = SignedTransaction::new(spend);

        let result = state.evaluate(&crypto, &unsigned, false, 2, 1);
        assert!(result.is_err());
        let _ = secret;
        let _ = Claim::BySignature { owner };
    }

    #[test]
    fn validate_block_accepts_a_generated_block_and_rejects_tampering() {
        let crypto = Secp256k1Provider::new();
        let mut state = LedgerState::new();
        let (_secret, pubkey) = crypto.generate_keypair();
        let owner = crypto.address_from_public_key(&pubkey);

        let genesis = crate::block::genesis_block(&crypto, 1_700_000_000, 1, &[(owner, Amount::from_units(100))]);
        state.validate_block(&crypto, &genesis, 1_700_000_000).unwrap();
        state.push_block(&crypto, &genesis).unwrap();

        let now = 1_700_000_000 + 100;
        let next = state.generate_next_block(&crypto, &[], now);
        state.validate_block(&crypto, &next, now).unwrap();

        let mut bad_root = next.clone();
        bad_root.header.trx_merkle_root = [9u8; 20];
        assert!(matches!(
            state.validate_block(&crypto, &bad_root, now),
            Err(BlockError::BadMerkleRoot)
        ));

        let mut bad_height = next.clone();
        bad_height.header.block_num = 5;
        assert!(matches!(
            state.validate_block(&crypto, &bad_height, now),
            Err(BlockError::BadHeight { .. })
        ));

        let mut bad_timestamp = next.clone();
        bad_timestamp.header.timestamp = genesis.header.timestamp;
        assert!(matches!(
            state.validate_block(&crypto, &bad_timestamp, now),
            Err(BlockError::BadTimestamp { .. })
        ));

        state.push_block(&crypto, &next).unwrap();
        assert_eq!(state.tip_height(), 1);
    }
}
