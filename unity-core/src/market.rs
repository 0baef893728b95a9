//! The deterministic continuous double auction (§4.1.3) and block
//! generation (§4.1.4).
//!
//! `match_orders` is deliberately free of any randomness or
//! wall-clock read: it is a pure function of `LedgerState`, which is
//! what §5 means by "must be deterministic and atomic from a peer's
//! observable perspective" and what §8 tests as "two honest nodes ...
//! `match_orders()` returns byte-identical transaction lists".
//!
//! Resolution of the open questions in §9:
//! - #2 (margin requirement inconsistency): both the bid-is-short and
//!   bid-is-plain branches below apply `INITIAL_MARGIN_REQUIREMENT`
//!   identically, as collateral-over-notional on the *new* cover
//!   position only; a plain bid/ask fill never posts collateral.
//! - execution price when a crossing bid and ask quote different
//!   prices: the engine fills at the resting (lower-index, i.e. older)
//!   side's price rather than splitting the spread, matching the
//!   "tie-breaks ... via the ordered-map iteration" rule already given
//!   for equal prices.

use std::collections::BTreeMap;

use crate::block::{merkle_root, BlockHeader, TrxBlock};
use crate::claim::Claim;
use crate::crypto::CryptoProvider;
use crate::ledger::{DepthStats, LedgerState};
use crate::params::{
    BLOCK_INTERVAL_SEC, INITIAL_MARGIN_REQUIREMENT, MARKET_DEPTH_GATE_DIVISOR, MAX_BLOCK_TRXS_SIZE,
    RETARGET_WINDOW,
};
use crate::primitives::{Address, Amount, Asset, AssetUnit, OutputReference, Price};
use crate::transaction::{SignedTransaction, Transaction, TrxInput, TrxOutput};

/// Shared key shape for both the `bids` and `asks` indices: the map's
/// own iteration order does the sorting (ascending by price, then by
/// `output_ref` for the tie-break §4.1.3 specifies); `bids` is walked
/// in reverse to read highest-price-first.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub struct BidKey {
    pub quote_unit: AssetUnit,
    pub base_unit: AssetUnit,
    pub price: Price,
    pub output_ref: OutputReference,
}

/// Key for the `calls` index: margin positions ordered by the price at
/// which they become eligible for forced closure.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub struct CallKey {
    pub quote_unit: AssetUnit,
    pub base_unit: AssetUnit,
    pub call_price: Price,
    pub output_ref: OutputReference,
}

/// The liquidation price of a `ClaimByCover` position: how much `quote`
/// debt is owed per unit of `bts` collateral currently securing it.
fn call_price(collateral: Amount, payoff: Asset) -> Option<Price> {
    if collateral.is_zero() || payoff.amount.is_zero() {
        return None;
    }
    let ratio = payoff.amount.checked_div_ratio(collateral.raw().try_into().ok()?).ok()?;
    Price::new(ratio.raw().try_into().ok()?, AssetUnit::BTS, payoff.unit).ok()
}

/// Adds or removes one output from whichever market index its claim
/// belongs to. Called by `LedgerState::push_block`/`pop_block` via
/// `index_one`/`unindex_one` so the indices always mirror the
/// authoritative unspent-output set (§9 redesign note: index rebuilt
/// from, never a substitute for, that authoritative map).
pub(crate) fn index_output(state: &mut LedgerState, out: &TrxOutput, output_ref: OutputReference, insert: bool) {
    match &out.claim {
        Claim::ByBid { ask_price, .. } => {
            let depth = state
                .depth_stats
                .entry((ask_price.quote_unit, ask_price.base_unit))
                .or_insert_with(DepthStats::default);
            if out.amount.unit == ask_price.base_unit {
                let key = BidKey {
                    quote_unit: ask_price.quote_unit,
                    base_unit: ask_price.base_unit,
                    price: *ask_price,
                    output_ref,
                };
                apply_depth(&mut depth.bid_depth, out.amount.amount, insert);
                if insert {
                    state.bids.insert(key, output_ref);
                } else {
                    state.bids.remove(&key);
                }
            } else if out.amount.unit == ask_price.quote_unit {
                let key = BidKey {
                    quote_unit: ask_price.quote_unit,
                    base_unit: ask_price.base_unit,
                    price: *ask_price,
                    output_ref,
                };
                apply_depth(&mut depth.ask_depth, out.amount.amount, insert);
                if insert {
                    state.asks.insert(key, output_ref);
                } else {
                    state.asks.remove(&key);
                }
            }
        }
        Claim::ByLong { ask_price, .. } => {
            let depth = state
                .depth_stats
                .entry((ask_price.quote_unit, ask_price.base_unit))
                .or_insert_with(DepthStats::default);
            let key = BidKey {
                quote_unit: ask_price.quote_unit,
                base_unit: ask_price.base_unit,
                price: *ask_price,
                output_ref,
            };
            apply_depth(&mut depth.bid_depth, out.amount.amount, insert);
            if insert {
                state.bids.insert(key, output_ref);
            } else {
                state.bids.remove(&key);
            }
        }
        Claim::ByCover { payoff, .. } => {
            if let Some(price) = call_price(out.amount.amount, *payoff) {
                let key = CallKey {
                    quote_unit: payoff.unit,
                    base_unit: AssetUnit::BTS,
                    call_price: price,
                    output_ref,
                };
                if insert {
                    state.calls.insert(key, output_ref);
                } else {
                    state.calls.remove(&key);
                }
            }
        }
        Claim::BySignature { .. } | Claim::ByPts { .. } => {}
    }
}

fn apply_depth(depth: &mut Amount, amount: Amount, insert: bool) {
    *depth = if insert {
        depth.checked_add(amount).unwrap_or(*depth)
    } else {
        depth.checked_sub(amount).unwrap_or(Amount::ZERO)
    };
}

/// One resting order pulled off an index, with its resolved output.
struct Resting {
    output_ref: OutputReference,
    price: Price,
    out: TrxOutput,
}

impl LedgerState {
    fn resolve_resting(&self, pairs: &BTreeMap<BidKey, OutputReference>) -> Vec<Resting> {
        pairs
            .keys()
            .filter_map(|k| {
                self.fetch_output(&k.output_ref).ok().map(|out| Resting {
                    output_ref: k.output_ref,
                    price: k.price,
                    out: out.clone(),
                })
            })
            .collect()
    }

    /// Every `(quote, base)` pair with at least one resting order on
    /// either side, discovered by scanning the live indices rather than
    /// a fixed static list (bit-assets are created dynamically).
    fn active_market_pairs(&self) -> Vec<(AssetUnit, AssetUnit)> {
        let mut pairs: Vec<(AssetUnit, AssetUnit)> = self
            .bids
            .keys()
            .map(|k| (k.quote_unit, k.base_unit))
            .chain(self.asks.keys().map(|k| (k.quote_unit, k.base_unit)))
            .chain(self.calls.keys().map(|k| (k.quote_unit, k.base_unit)))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// §4.1.3: the deterministic continuous double auction. Returns at
    /// most one synthesized transaction per active market pair, never
    /// fails, never yields (§5): pure computation over `self`.
    pub fn match_orders<C: CryptoProvider>(&self, crypto: &C) -> Vec<SignedTransaction> {
        let mut out = Vec::new();
        for (quote, base) in self.active_market_pairs() {
            if let Some(trx) = self.match_pair(quote, base) {
                out.push(SignedTransaction::new(trx));
            }
        }
        let _ = crypto;
        out
    }

    fn depth_gate_open(&self, quote: AssetUnit, base: AssetUnit) -> bool {
        if base != AssetUnit::BTS {
            return true;
        }
        let total_shares = self.tip_header().map(|h| h.total_shares).unwrap_or(Amount::ZERO);
        let gate = total_shares.raw() / MARKET_DEPTH_GATE_DIVISOR;
        let depth = self.depth_stats.get(&(quote, base)).copied().unwrap_or_default();
        depth.bid_depth.raw() >= gate
    }

    fn match_pair(&self, quote: AssetUnit, base: AssetUnit) -> Option<Transaction> {
        if !self.depth_gate_open(quote, base) {
            return None;
        }
        let bid_map: BTreeMap<BidKey, OutputReference> = self
            .bids
            .range(
                BidKey { quote_unit: quote, base_unit: base, price: Price { ratio: 0, base_unit: base, quote_unit: quote }, output_ref: OutputReference { trx_hash: [0; 20], output_idx: 0 } }
                    ..BidKey { quote_unit: quote, base_unit: base, price: Price { ratio: u128::MAX, base_unit: base, quote_unit: quote }, output_ref: OutputReference { trx_hash: [0xff; 20], output_idx: u16::MAX } },
            )
            .map(|(k, v)| (*k, *v))
            .collect();
        let ask_map: BTreeMap<BidKey, OutputReference> = self
            .asks
            .range(
                BidKey { quote_unit: quote, base_unit: base, price: Price { ratio: 0, base_unit: base, quote_unit: quote }, output_ref: OutputReference { trx_hash: [0; 20], output_idx: 0 } }
                    ..BidKey { quote_unit: quote, base_unit: base, price: Price { ratio: u128::MAX, base_unit: base, quote_unit: quote }, output_ref: OutputReference { trx_hash: [0xff; 20], output_idx: u16::MAX } },
            )
            .map(|(k, v)| (*k, *v))
            .collect();

        let mut bids: Vec<Resting> = self.resolve_resting(&bid_map);
        bids.sort_by(|a, b| b.price.cmp(&a.price).then(a.output_ref.cmp(&b.output_ref)));
        let mut asks: Vec<Resting> = self.resolve_resting(&ask_map);
        asks.sort_by(|a, b| a.price.cmp(&b.price).then(a.output_ref.cmp(&b.output_ref)));

        let mut bi = 0usize;
        let mut ai = 0usize;
        // remaining un-traded size of the order currently at the front
        // of each queue, consumed down to zero before advancing.
        let mut bid_remaining = bids.first().map(|r| r.out.amount.amount);
        let mut ask_remaining = asks.first().map(|r| r.out.amount.amount);

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut consumed_bid_refs = std::collections::HashSet::new();

        while bi < bids.len() && ai < asks.len() {
            let bid = &bids[bi];
            let ask = &asks[ai];
            if bid.price.ratio < ask.price.ratio {
                break;
            }
            let price = ask.price; // resting ask (lower, conservative) side sets execution price
            let bid_rem = bid_remaining.unwrap_or(bid.out.amount.amount);
            let ask_rem = ask_remaining.unwrap_or(ask.out.amount.amount);

            if !consumed_bid_refs.contains(&bid.output_ref) {
                inputs.push(bid.output_ref);
                consumed_bid_refs.insert(bid.output_ref);
            }
            if !consumed_bid_refs.contains(&ask.output_ref) {
                inputs.push(ask.output_ref);
                consumed_bid_refs.insert(ask.output_ref);
            }

            let ask_rem_in_base = price.convert_quote_to_base(Asset::new(ask_rem, quote)).ok()?;
            let traded_base = if bid_rem.raw() <= ask_rem_in_base.amount.raw() { bid_rem } else { ask_rem_in_base.amount };
            let traded_quote = price.convert_base_to_quote(Asset::new(traded_base, base)).ok()?.amount;

            match &bid.out.claim {
                Claim::ByLong { pay_address, .. } => {
                    let notional_base = price.convert_quote_to_base(Asset::new(traded_quote, quote)).ok()?.amount;
                    let margin = notional_base
                        .checked_mul_ratio(crate::params::AMOUNT_SCALE as u128 * INITIAL_MARGIN_REQUIREMENT as u128)
                        .unwrap_or(Amount::ZERO);
                    let collateral = bid.out.amount.amount.checked_add(margin).unwrap_or(bid.out.amount.amount);
                    outputs.push(TrxOutput::new(
                        Asset::new(collateral, AssetUnit::BTS),
                        Claim::ByCover { payoff: Asset::new(traded_quote, quote), owner: *pay_address },
                    ));
                }
                _ => {
                    let pay_address = match &bid.out.claim {
                        Claim::ByBid { pay_address, .. } => *pay_address,
                        _ => Address::default(),
                    };
                    outputs.push(TrxOutput::to_signature(pay_address, Asset::new(traded_quote, quote)));
                }
            }
            match &ask.out.claim {
                Claim::ByBid { pay_address, .. } => {
                    outputs.push(TrxOutput::to_signature(*pay_address, Asset::new(traded_base, base)));
                }
                _ => {}
            }

            let new_bid_rem = bid_rem.checked_sub(traded_base).unwrap_or(Amount::ZERO);
            let new_ask_rem = ask_rem.checked_sub(traded_quote).unwrap_or(Amount::ZERO);

            if new_bid_rem.is_zero() {
                bi += 1;
                bid_remaining = bids.get(bi).map(|r| r.out.amount.amount);
            } else {
                bid_remaining = Some(new_bid_rem);
                if let Claim::ByBid { pay_address, ask_price } = &bid.out.claim {
                    outputs.push(TrxOutput::new(Asset::new(new_bid_rem, base), Claim::ByBid { pay_address: *pay_address, ask_price: *ask_price }));
                }
            }
            if new_ask_rem.is_zero() {
                ai += 1;
                ask_remaining = asks.get(ai).map(|r| r.out.amount.amount);
            } else {
                ask_remaining = Some(new_ask_rem);
                if let Claim::ByBid { pay_address, ask_price } = &ask.out.claim {
                    outputs.push(TrxOutput::new(Asset::new(new_ask_rem, quote), Claim::ByBid { pay_address: *pay_address, ask_price: *ask_price }));
                }
            }
        }

        // §4.1.3 step 3: margin calls, only for base == bts, matched
        // against whatever bid remains at the front of the queue.
        if base == AssetUnit::BTS {
            if let Some(remaining_bid) = bids.get(bi) {
                let highest_remaining = remaining_bid.price;
                let call_map: Vec<Resting> = self
                    .calls
                    .range(
                        CallKey { quote_unit: quote, base_unit: base, call_price: Price { ratio: 0, base_unit: AssetUnit::BTS, quote_unit: quote }, output_ref: OutputReference { trx_hash: [0; 20], output_idx: 0 } }
                            ..CallKey { quote_unit: quote, base_unit: base, call_price: Price { ratio: u128::MAX, base_unit: AssetUnit::BTS, quote_unit: quote }, output_ref: OutputReference { trx_hash: [0xff; 20], output_idx: u16::MAX } },
                    )
                    .filter(|(k, _)| k.call_price.ratio >= highest_remaining.ratio)
                    .filter_map(|(k, r)| self.fetch_output(r).ok().map(|out| Resting { output_ref: *r, price: k.call_price, out: out.clone() }))
                    .collect();

                let mut bid_rem = bid_remaining.unwrap_or(Amount::ZERO);
                for call in call_map {
                    let Claim::ByCover { payoff, owner } = &call.out.claim else { continue };
                    if bid_rem.is_zero() {
                        break;
                    }
                    inputs.push(call.output_ref);
                    let close_quote = if payoff.amount.raw() <= bid_rem.raw() { payoff.amount } else { bid_rem };
                    let close_base = highest_remaining.convert_quote_to_base(Asset::new(close_quote, quote)).ok()?.amount;
                    let collateral_released = call.out.amount.amount.checked_sub(close_base).unwrap_or(Amount::ZERO);
                    outputs.push(TrxOutput::new(Asset::new(close_base, AssetUnit::BTS), Claim::BySignature { owner: Address::default() }));
                    if !collateral_released.is_zero() {
                        outputs.push(TrxOutput::to_signature(*owner, Asset::new(collateral_released, AssetUnit::BTS)));
                    }
                    bid_rem = bid_rem.checked_sub(close_quote).unwrap_or(Amount::ZERO);
                }
            }
        }

        if inputs.is_empty() {
            return None;
        }

        let mut trx = Transaction::new(self.tip_header().map(|h| h.timestamp).unwrap_or(0));
        for r in inputs {
            trx.inputs.push(TrxInput::new(r));
        }
        trx.outputs = outputs;
        Some(trx)
    }

    /// §4.1.4: assembles a ready-to-mine block from `match_orders`'s
    /// output plus whichever candidates from `pending` still evaluate
    /// cleanly, in fee-descending order, bounded by
    /// `MAX_BLOCK_TRXS_SIZE`. Never fails: bad candidates are dropped.
    pub fn generate_next_block<C: CryptoProvider>(
        &self,
        crypto: &C,
        pending: &[SignedTransaction],
        now: i64,
    ) -> TrxBlock {
        let height = self.tip_height() + 1;
        let mut trxs = Vec::new();
        let mut size_used = 0usize;
        let mut spent_refs = std::collections::HashSet::new();

        for market_trx in self.match_orders(crypto) {
            for input in &market_trx.trx.inputs {
                spent_refs.insert(input.output_ref);
            }
            size_used += market_trx.size();
            trxs.push(market_trx);
        }

        let mut scored: Vec<(Amount, &SignedTransaction)> = Vec::new();
        for candidate in pending {
            match self.evaluate(crypto, candidate, false, now, height) {
                Ok(eval) => {
                    let fee = eval.fees.get(&AssetUnit::BTS).copied().unwrap_or(Amount::ZERO);
                    scored.push((fee, candidate));
                }
                Err(_) => continue,
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut total_cdd = Amount::ZERO;
        for (_, candidate) in scored {
            let conflicts = candidate.trx.inputs.iter().any(|i| spent_refs.contains(&i.output_ref));
            if conflicts {
                continue;
            }
            let size = candidate.size();
            if size_used + size > MAX_BLOCK_TRXS_SIZE {
                continue;
            }
            if let Ok(eval) = self.evaluate(crypto, candidate, false, now, height) {
                total_cdd = total_cdd.checked_add(eval.coindays_destroyed).unwrap_or(total_cdd);
                for i in &candidate.trx.inputs {
                    spent_refs.insert(i.output_ref);
                }
                size_used += size;
                trxs.push(candidate.clone());
            }
        }

        let trx_ids: Vec<_> = trxs.iter().map(|t| t.id(crypto)).collect();
        let root = merkle_root(crypto, &trx_ids);

        let prev_id = self.tip_header().map(|h| h.id(crypto)).unwrap_or([0u8; 20]);
        let next_difficulty = self.next_required_difficulty(height);
        let total_shares = self.tip_header().map(|h| h.total_shares).unwrap_or(Amount::ZERO);
        let avail_coindays = self.next_avail_coindays(now, total_cdd);
        let next_fee = self.next_fee_rate(size_used);

        let header = BlockHeader {
            version: 1,
            prev: prev_id,
            block_num: height,
            timestamp: now,
            next_difficulty,
            total_shares,
            avail_coindays,
            total_cdd,
            next_fee,
            trx_merkle_root: root,
            noncea: 0,
            nonceb: 0,
        };
        TrxBlock { header, trxs }
    }

    /// §4.1.4 step 5, retarget half: every `RETARGET_WINDOW` blocks,
    /// compares the actual time the window took against
    /// `BLOCK_INTERVAL_SEC * RETARGET_WINDOW` and scales the previous
    /// difficulty accordingly, clamped to a 4x band per adjustment to
    /// damp oscillation.
    pub(crate) fn next_required_difficulty(&self, new_height: u64) -> u128 {
        let prev_difficulty = self.tip_header().map(|h| h.next_difficulty).unwrap_or(1);
        if new_height < RETARGET_WINDOW as u64 || new_height % RETARGET_WINDOW as u64 != 0 {
            return prev_difficulty;
        }
        let window_start_height = new_height - RETARGET_WINDOW as u64;
        let (Some(start), Some(end)) = (self.headers.get(&window_start_height), self.tip_header()) else {
            return prev_difficulty;
        };
        let actual = (end.timestamp - start.timestamp).max(1) as i128;
        let target = BLOCK_INTERVAL_SEC as i128 * RETARGET_WINDOW as i128;
        let adjusted = (prev_difficulty as i128).saturating_mul(target) / actual;
        let floor = (prev_difficulty as i128 / 4).max(1);
        let ceil = (prev_difficulty as i128).saturating_mul(4);
        adjusted.clamp(floor, ceil).max(1) as u128
    }

    /// A coin-day reserve: refills with `total_shares` worth of coindays
    /// per elapsed day since the tip, and is drawn down by whatever this
    /// block spent, floored at zero. Used to rate-limit free transactions
    /// (§4.1.2) without requiring an external fee market.
    fn next_avail_coindays(&self, now: i64, spent: Amount) -> Amount {
        let prev = self.tip_header();
        let prev_avail = prev.map(|h| h.avail_coindays).unwrap_or(Amount::ZERO);
        let prev_ts = prev.map(|h| h.timestamp).unwrap_or(now);
        let total_shares = prev.map(|h| h.total_shares).unwrap_or(Amount::ZERO);
        let elapsed_days = ((now - prev_ts).max(0) as i128 * crate::params::AMOUNT_SCALE) / 86_400;
        let refill = total_shares.checked_mul_ratio(elapsed_days.max(0) as u128).unwrap_or(Amount::ZERO);
        prev_avail.checked_add(refill).unwrap_or(prev_avail).checked_sub(spent).unwrap_or(Amount::ZERO)
    }

    /// §3.3 invariant 7's `next_fee`: linear in how full this block was
    /// relative to `MAX_BLOCK_TRXS_SIZE`. A block at or above the
    /// halfway mark raises the rate that the *next* block's candidates
    /// must pay; an emptier block lowers it, floored at the raw minimum
    /// of `1`.
    pub(crate) fn next_fee_rate(&self, size_used: usize) -> Amount {
        let prev = self.fee_rate.raw().max(1);
        let half = (MAX_BLOCK_TRXS_SIZE / 2) as i128;
        let delta = size_used as i128 - half;
        let scaled = prev + (prev * delta) / (MAX_BLOCK_TRXS_SIZE as i128).max(1);
        Amount::from_raw(scaled.max(1))
    }
}
