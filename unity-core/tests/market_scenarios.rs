//! Cross-module market scenarios that exercise `LedgerState::push_block`
//! and `match_orders` together end to end, the way a node actually drives
//! them (push a block of resting orders, then ask the engine to match),
//! rather than unit-testing either in isolation.

use unity_core::block::{genesis_block, merkle_root};
use unity_core::ledger::LedgerState;
use unity_core::primitives::{Address, Amount, Asset, AssetUnit, OutputReference, Price};
use unity_core::{BlockHeader, Claim, SignedTransaction, Transaction, TrxBlock, TrxInput, TrxOutput};
use unity_crypto::Secp256k1Provider;

fn seeded(crypto: &Secp256k1Provider, allocations: &[(Address, Amount)]) -> LedgerState {
    let mut state = LedgerState::new();
    let block = genesis_block(crypto, 1_700_000_000, 1, allocations);
    state.push_block(crypto, &block).unwrap();
    state
}

/// S2 — partial fill and residue: a 10-bts offer only partly crosses a
/// 15-usd taker order; the taker is filled completely, the maker's
/// remainder re-rests in the book as a smaller `ByBid` at the same price.
#[test]
fn s2_partial_fill_leaves_a_residue_order() {
    let crypto = Secp256k1Provider::new();
    let (_sa, pa) = crypto.generate_keypair();
    let (_sb, pb) = crypto.generate_keypair();
    let addr_a = crypto.address_from_public_key(&pa);
    let addr_b = crypto.address_from_public_key(&pb);
    let mut state = seeded(&crypto, &[(addr_a, Amount::from_units(100)), (addr_b, Amount::from_units(100))]);

    let coinbase_id = state.tip_header().unwrap().id(&crypto);
    let price = Price::new(2 * unity_core::params::AMOUNT_SCALE as u128, AssetUnit::BTS, AssetUnit::USD).unwrap();

    let mut bid_trx = Transaction::new(1_700_000_100);
    bid_trx.inputs.push(TrxInput::new(OutputReference { trx_hash: coinbase_id, output_idx: 0 }));
    bid_trx.outputs.push(TrxOutput::new(Asset::new(Amount::from_units(10), AssetUnit::BTS), Claim::ByBid { pay_address: addr_a, ask_price: price }));
    bid_trx.outputs.push(TrxOutput::to_signature(addr_a, Asset::new(Amount::from_units(90), AssetUnit::BTS)));
    let bid_signed = SignedTransaction::new(bid_trx);
    let bid_id = bid_signed.id(&crypto);

    let block1 = TrxBlock {
        header: BlockHeader {
            version: 1, prev: coinbase_id, block_num: 1, timestamp: 1_700_000_100,
            next_difficulty: 1, total_shares: Amount::from_units(200), avail_coindays: Amount::ZERO,
            total_cdd: Amount::ZERO, next_fee: Amount::from_raw(1),
            trx_merkle_root: merkle_root(&crypto, &[bid_id]), noncea: 0, nonceb: 0,
        },
        trxs: vec![bid_signed],
    };
    state.push_block(&crypto, &block1).unwrap();

    // B funds 15 usd (instead of S1's 20) and rests it as a taker order
    // at the same price, so it cannot fully absorb A's 10-bts offer.
    let mut fund_trx = Transaction::new(1_700_000_100);
    fund_trx.outputs.push(TrxOutput::to_signature(addr_b, Asset::new(Amount::from_units(15), AssetUnit::USD)));
    let fund_signed = SignedTransaction::new(fund_trx);
    let fund_id = fund_signed.id(&crypto);

    let mut ask_trx = Transaction::new(1_700_000_200);
    ask_trx.inputs.push(TrxInput::new(OutputReference { trx_hash: fund_id, output_idx: 0 }));
    ask_trx.outputs.push(TrxOutput::new(Asset::new(Amount::from_units(15), AssetUnit::USD), Claim::ByBid { pay_address: addr_b, ask_price: price }));
    let ask_signed = SignedTransaction::new(ask_trx);
    let ask_id = ask_signed.id(&crypto);

    let block2 = TrxBlock {
        header: BlockHeader {
            version: 1, prev: block1.header.id(&crypto), block_num: 2, timestamp: 1_700_000_200,
            next_difficulty: 1, total_shares: Amount::from_units(215), avail_coindays: Amount::ZERO,
            total_cdd: Amount::ZERO, next_fee: Amount::from_raw(1),
            trx_merkle_root: merkle_root(&crypto, &[fund_id, ask_id]), noncea: 0, nonceb: 0,
        },
        trxs: vec![fund_signed, ask_signed],
    };
    state.push_block(&crypto, &block2).unwrap();

    let trades = state.match_orders(&crypto);
    assert_eq!(trades.len(), 1);
    let outputs = &trades[0].trx.outputs;
    assert_eq!(outputs.len(), 3, "taker payout, maker payout, maker residue");

    assert_eq!(outputs[0].amount, Asset::new(Amount::from_units(15), AssetUnit::USD));
    assert!(matches!(&outputs[0].claim, Claim::BySignature { owner } if *owner == addr_a));

    // 15 usd at 2 usd/bts fills 7.5 bts, leaving a 2.5-bts residue.
    assert_eq!(outputs[1].amount, Asset::new(Amount::from_raw(750_000_000), AssetUnit::BTS));
    assert!(matches!(&outputs[1].claim, Claim::BySignature { owner } if *owner == addr_b));

    match &outputs[2].claim {
        Claim::ByBid { pay_address, ask_price } => {
            assert_eq!(*pay_address, addr_a);
            assert_eq!(*ask_price, price);
        }
        other => panic!("expected a residual ByBid order, got {other:?}"),
    }
    assert_eq!(outputs[2].amount, Asset::new(Amount::from_raw(250_000_000), AssetUnit::BTS));
}

/// S3 — short open followed by a margin call: a short position opened
/// via `ByLong`/`ByBid` matching is later closed by a lower-priced
/// resting bid once the market price falls enough to breach its call
/// price, repaying part of the debt and returning the leftover collateral
/// to the shorter.
#[test]
fn s3_short_open_then_margin_call_returns_residual_collateral() {
    let crypto = Secp256k1Provider::new();
    let (_sa, pa) = crypto.generate_keypair();
    let (_sb, pb) = crypto.generate_keypair();
    let addr_a = crypto.address_from_public_key(&pa);
    let addr_b = crypto.address_from_public_key(&pb);
    let mut state = seeded(&crypto, &[(addr_a, Amount::from_units(100)), (addr_b, Amount::from_units(100))]);

    let coinbase_id = state.tip_header().unwrap().id(&crypto);
    let open_price = Price::new(2 * unity_core::params::AMOUNT_SCALE as u128, AssetUnit::BTS, AssetUnit::USD).unwrap();

    // addr_a shorts 3 bts worth at 2 usd/bts.
    let mut short_trx = Transaction::new(1_700_000_100);
    short_trx.inputs.push(TrxInput::new(OutputReference { trx_hash: coinbase_id, output_idx: 0 }));
    short_trx.outputs.push(TrxOutput::new(Asset::new(Amount::from_units(3), AssetUnit::BTS), Claim::ByLong { pay_address: addr_a, ask_price: open_price }));
    short_trx.outputs.push(TrxOutput::to_signature(addr_a, Asset::new(Amount::from_units(97), AssetUnit::BTS)));
    let short_signed = SignedTransaction::new(short_trx);
    let short_id = short_signed.id(&crypto);

    // addr_b funds and rests a matching 6-usd ask at the same price.
    let mut fund_trx = Transaction::new(1_700_000_100);
    fund_trx.outputs.push(TrxOutput::to_signature(addr_b, Asset::new(Amount::from_units(6), AssetUnit::USD)));
    let fund_signed = SignedTransaction::new(fund_trx);
    let fund_id = fund_signed.id(&crypto);

    let mut ask_trx = Transaction::new(1_700_000_100);
    ask_trx.inputs.push(TrxInput::new(OutputReference { trx_hash: fund_id, output_idx: 0 }));
    ask_trx.outputs.push(TrxOutput::new(Asset::new(Amount::from_units(6), AssetUnit::USD), Claim::ByBid { pay_address: addr_b, ask_price: open_price }));
    let ask_signed = SignedTransaction::new(ask_trx);
    let ask_id = ask_signed.id(&crypto);

    let block1 = TrxBlock {
        header: BlockHeader {
            version: 1, prev: coinbase_id, block_num: 1, timestamp: 1_700_000_100,
            next_difficulty: 1, total_shares: Amount::from_units(200), avail_coindays: Amount::ZERO,
            total_cdd: Amount::ZERO, next_fee: Amount::from_raw(1),
            trx_merkle_root: merkle_root(&crypto, &[short_id, fund_id, ask_id]), noncea: 0, nonceb: 0,
        },
        trxs: vec![short_signed, fund_signed, ask_signed],
    };
    state.push_block(&crypto, &block1).unwrap();

    let opening_trades = state.match_orders(&crypto);
    assert_eq!(opening_trades.len(), 1);
    let open_trade = opening_trades.into_iter().next().unwrap();
    let open_trade_id = open_trade.id(&crypto);

    let block2 = TrxBlock {
        header: BlockHeader {
            version: 1, prev: block1.header.id(&crypto), block_num: 2, timestamp: 1_700_000_200,
            next_difficulty: 1, total_shares: Amount::from_units(200), avail_coindays: Amount::ZERO,
            total_cdd: Amount::ZERO, next_fee: Amount::from_raw(1),
            trx_merkle_root: merkle_root(&crypto, &[open_trade_id]), noncea: 0, nonceb: 0,
        },
        trxs: vec![open_trade],
    };
    state.push_block(&crypto, &block2).unwrap();

    // Price falls to 0.5 usd/bts: addr_b rests a 3-bts bid there, well
    // below the short's ~0.667 call price, so it becomes the liquidity
    // the margin-call arm closes against.
    let call_price = Price::new(unity_core::params::AMOUNT_SCALE as u128 / 2, AssetUnit::BTS, AssetUnit::USD).unwrap();
    let mut low_bid_trx = Transaction::new(1_700_000_300);
    low_bid_trx.inputs.push(TrxInput::new(OutputReference { trx_hash: coinbase_id, output_idx: 1 }));
    low_bid_trx.outputs.push(TrxOutput::new(Asset::new(Amount::from_units(3), AssetUnit::BTS), Claim::ByBid { pay_address: addr_b, ask_price: call_price }));
    low_bid_trx.outputs.push(TrxOutput::to_signature(addr_b, Asset::new(Amount::from_units(97), AssetUnit::BTS)));
    let low_bid_signed = SignedTransaction::new(low_bid_trx);
    let low_bid_id = low_bid_signed.id(&crypto);

    let block3 = TrxBlock {
        header: BlockHeader {
            version: 1, prev: block2.header.id(&crypto), block_num: 3, timestamp: 1_700_000_300,
            next_difficulty: 1, total_shares: Amount::from_units(200), avail_coindays: Amount::ZERO,
            total_cdd: Amount::ZERO, next_fee: Amount::from_raw(1),
            trx_merkle_root: merkle_root(&crypto, &[low_bid_id]), noncea: 0, nonceb: 0,
        },
        trxs: vec![low_bid_signed],
    };
    state.push_block(&crypto, &block3).unwrap();

    let closing_trades = state.match_orders(&crypto);
    assert_eq!(closing_trades.len(), 1);
    let close = &closing_trades[0];
    assert_eq!(close.trx.inputs.len(), 1, "only the ByCover position is consumed; the low bid still has size left");
    assert_eq!(close.trx.outputs.len(), 2, "debt settlement output plus residual collateral back to the shorter");

    assert_eq!(close.trx.outputs[0].amount, Asset::new(Amount::from_units(6), AssetUnit::BTS));
    assert!(matches!(&close.trx.outputs[0].claim, Claim::BySignature { .. }));

    assert_eq!(close.trx.outputs[1].amount, Asset::new(Amount::from_units(3), AssetUnit::BTS));
    assert!(matches!(&close.trx.outputs[1].claim, Claim::BySignature { owner } if *owner == addr_a));
}
