//! S4 — reorg: a node applies one chain, then hears about a competing
//! fork with greater total difficulty and must switch to it, rolling
//! back everything the losing chain had applied. `ForkDb` only tracks
//! which chain currently wins; this test drives `LedgerState::pop_block`/
//! `push_block` the same way a node's reorg routine would, to check the
//! two crates actually compose into a correct rollback.

use unity_core::ledger::LedgerState;
use unity_core::primitives::{Amount, Asset, AssetUnit, OutputReference, Price, U160};
use unity_core::{genesis_block, merkle_root, BlockHeader, Claim, SignedTransaction, Transaction, TrxBlock, TrxInput, TrxOutput};
use unity_crypto::Secp256k1Provider;
use unity_forkdb::ForkDb;
use unity_storage::Database;

fn empty_block(prev: U160, block_num: u64, difficulty: u128) -> TrxBlock {
    TrxBlock {
        header: BlockHeader {
            version: 1, prev, block_num, timestamp: 1_700_000_000 + block_num as i64 * 300,
            next_difficulty: difficulty, total_shares: Amount::from_units(100), avail_coindays: Amount::ZERO,
            total_cdd: Amount::ZERO, next_fee: Amount::from_raw(1),
            trx_merkle_root: merkle_root(&Secp256k1Provider::new(), &[]), noncea: 0, nonceb: 0,
        },
        trxs: vec![],
    }
}

/// Walks `ForkDb` from `tip_id` back to genesis, returning `(height, id)`
/// pairs in ascending order — the same ancestor walk a node's reorg
/// routine uses to find the fork point and the replay order.
fn chain_to_genesis(forkdb: &ForkDb, tip_id: U160) -> Vec<(u64, U160)> {
    let mut chain = Vec::new();
    let mut cursor = tip_id;
    loop {
        let meta = forkdb.header(&cursor).unwrap().unwrap();
        let height = meta.height.unwrap();
        chain.push((height, cursor));
        if height == 0 {
            break;
        }
        cursor = meta.header.prev;
    }
    chain.reverse();
    chain
}

#[test]
fn heavier_fork_wins_and_rolls_back_the_losing_chain() {
    let crypto = Secp256k1Provider::new();
    let (_secret, pubkey) = crypto.generate_keypair();
    let addr_a = crypto.address_from_public_key(&pubkey);

    let genesis = genesis_block(&crypto, 1_700_000_000, 1, &[(addr_a, Amount::from_units(100))]);
    let genesis_id = genesis.header.id(&crypto);
    let genesis_trx_id = genesis.trxs[0].id(&crypto);

    let mut ledger = LedgerState::new();
    ledger.push_block(&crypto, &genesis).unwrap();

    let db = Database::open_temporary().unwrap();
    let forkdb = ForkDb::open(&db).unwrap();
    forkdb.cache_block(&crypto, &genesis).unwrap();

    // Chain A: three low-difficulty blocks, the first of which rests a
    // market order against the genesis coinbase output.
    let price = Price::new(2 * unity_core::params::AMOUNT_SCALE as u128, AssetUnit::BTS, AssetUnit::USD).unwrap();
    let mut order_trx = Transaction::new(1_700_000_100);
    order_trx.inputs.push(TrxInput::new(OutputReference { trx_hash: genesis_trx_id, output_idx: 0 }));
    order_trx.outputs.push(TrxOutput::new(Asset::new(Amount::from_units(40), AssetUnit::BTS), Claim::ByBid { pay_address: addr_a, ask_price: price }));
    order_trx.outputs.push(TrxOutput::to_signature(addr_a, Asset::new(Amount::from_units(60), AssetUnit::BTS)));
    let order_signed = SignedTransaction::new(order_trx);
    let order_id = order_signed.id(&crypto);

    let a1 = TrxBlock {
        header: BlockHeader {
            version: 1, prev: genesis_id, block_num: 1, timestamp: 1_700_000_100,
            next_difficulty: 1, total_shares: Amount::from_units(100), avail_coindays: Amount::ZERO,
            total_cdd: Amount::ZERO, next_fee: Amount::from_raw(1),
            trx_merkle_root: merkle_root(&crypto, &[order_id]), noncea: 0, nonceb: 0,
        },
        trxs: vec![order_signed],
    };
    ledger.push_block(&crypto, &a1).unwrap();
    forkdb.cache_block(&crypto, &a1).unwrap();

    let a2 = empty_block(a1.header.id(&crypto), 2, 1);
    ledger.push_block(&crypto, &a2).unwrap();
    forkdb.cache_block(&crypto, &a2).unwrap();

    let a3 = empty_block(a2.header.id(&crypto), 3, 1);
    ledger.push_block(&crypto, &a3).unwrap();
    forkdb.cache_block(&crypto, &a3).unwrap();

    assert_eq!(ledger.tip_height(), 3);
    assert!(!ledger.bids.is_empty(), "chain A's resting order should be indexed before the reorg");
    let spent_before = ledger.trx_num_to_meta[&ledger.trx_id_to_num[&genesis_trx_id]].spent[0];
    assert_eq!(spent_before, Some(order_id));

    // Chain B: two much-higher-difficulty blocks forking directly off
    // genesis, never applied to the ledger yet.
    let b1 = empty_block(genesis_id, 1, 1000);
    forkdb.cache_block(&crypto, &b1).unwrap();
    let b2 = empty_block(b1.header.id(&crypto), 2, 1000);
    let b2_id = forkdb.cache_block(&crypto, &b2).unwrap();

    assert_eq!(forkdb.best_fork_head_id(), Some(b2_id));

    // Reorg: pop chain A back to the fork point (genesis), then replay
    // chain B's blocks in order.
    let new_chain = chain_to_genesis(&forkdb, b2_id);
    let mut height = ledger.tip_height();
    while height > 0 {
        ledger.pop_block(height);
        height -= 1;
    }
    for (h, id) in new_chain.into_iter().filter(|(h, _)| *h > 0) {
        let block = forkdb.block(&id).unwrap().unwrap();
        ledger.push_block(&crypto, &block).unwrap();
        assert_eq!(block.header.block_num, h);
    }

    assert_eq!(ledger.tip_height(), 2);
    assert_eq!(ledger.tip_header().unwrap().id(&crypto), b2_id);
    assert!(ledger.bids.is_empty(), "chain A's resting order must vanish once A1 is rolled back");
    let spent_after = ledger.trx_num_to_meta[&ledger.trx_id_to_num[&genesis_trx_id]].spent[0];
    assert_eq!(spent_after, None, "the genesis output A1 spent must be unspent again after the reorg");
}
