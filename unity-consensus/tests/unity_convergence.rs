//! S5 — unity convergence: four of a five-member UNL agree on the same
//! item set and commit it without waiting on the fifth signer; the
//! fifth signer's late, partially-overlapping proposal is folded into
//! the next round without disturbing what already committed.

use std::collections::BTreeSet;

use unity_core::primitives::Address;
use unity_consensus::{Node, Proposal, SignedProposal};
use unity_crypto::Secp256k1Provider;

fn signer(crypto: &Secp256k1Provider) -> (Address, [u8; 32]) {
    let (secret, pubkey) = crypto.generate_keypair();
    (crypto.address_from_public_key(&pubkey), secret)
}

#[test]
fn four_of_five_converge_before_the_fifth_signer_joins() {
    let crypto = Secp256k1Provider::new();
    let signers: Vec<(Address, [u8; 32])> = (0..5).map(|_| signer(&crypto)).collect();
    let unl: BTreeSet<Address> = signers.iter().map(|(a, _)| *a).collect();
    let genesis_digest = [0u8; 20];
    let genesis_ts = 1_700_000_000;

    let item_x = [1u8; 20];
    let item_y = [2u8; 20];
    let item_z = [3u8; 20];
    let item_w = [4u8; 20];

    // Signers 0-3 are online and agree on {x, y, z}; signer 4 hasn't
    // proposed anything yet this round.
    let mut online: Vec<Node<Secp256k1Provider>> = signers[..4]
        .iter()
        .map(|(addr, secret)| Node::new(Secp256k1Provider::new(), unl.clone(), genesis_digest, genesis_ts).with_local_signer(*addr, *secret))
        .collect();

    for node in online.iter_mut() {
        node.mark_valid_locally(item_x);
        node.mark_valid_locally(item_y);
        node.mark_valid_locally(item_z);
    }

    // All four propose with the exact same timestamp, so their
    // proposals are bit-identical and their next-round votes stack on
    // one digest instead of splitting across four distinct ones.
    let round_ts = 1_700_000_100;
    let mut proposals = Vec::new();
    for (i, node) in online.iter_mut().enumerate() {
        let signed = node.propose(round_ts).unwrap();
        proposals.push((signers[i].0, signed));
    }

    let mut committed = None;
    for node in online.iter_mut() {
        for (addr, signed) in &proposals {
            let outcome = node.ingest(*addr, signed.clone()).unwrap();
            if outcome.committed.is_some() {
                committed = outcome.committed;
            }
        }
    }
    let committed = committed.expect("four of five clears the 60% next-round majority");
    assert_eq!(committed.items, BTreeSet::from([item_x, item_y, item_z]));

    let committed_digest = committed.digest(&crypto);

    // Signer 4 now joins, having observed the commit, and proposes a
    // set that keeps x and y but swaps in a brand new item w instead
    // of z.
    let mut late_items = BTreeSet::new();
    late_items.insert(item_x);
    late_items.insert(item_y);
    late_items.insert(item_w);
    let late_proposal = Proposal { timestamp: round_ts + 100, prev_digest: committed_digest, items: late_items };
    let late_signed = SignedProposal::sign(&crypto, &signers[4].1, late_proposal).unwrap();

    let mut joined_node = online.into_iter().next().unwrap();
    let outcome = joined_node.ingest(signers[4].0, late_signed).unwrap();
    assert!(outcome.committed.is_none(), "one of five signers alone cannot re-commit a new round");
    assert!(joined_node.item_state(&item_w).is_some(), "w must be tracked for the next round");
    assert!(!joined_node.item_state(&item_w).unwrap().valid_locally, "the joining signer's own validity isn't conferred onto others");
}
