//! Unity BFT consensus (§4.3): the fixed-membership agreement protocol
//! that gets every node in the `unique_node_list` to converge on the
//! same ordered set of item ids (almost always pending transaction
//! ids) before the next block is produced.
//!
//! Unlike the ledger/market engine, this module's state genuinely is
//! round-based and mutated in place as proposals arrive, so `Node` is
//! `&mut self` rather than functional; callers own synchronization
//! (typically a single cooperative task per §5, guarded by
//! `parking_lot::RwLock` when shared with an RPC read path).

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use unity_core::canonical::{hash160_of, sha256_of, CanonicalDecode, CanonicalEncode, Decoder, Encoder};
use unity_core::crypto::{CompactSignature, CryptoProvider};
use unity_core::error::CanonicalError;
use unity_core::params::{UNITY_ITEM_THRESHOLD_PCT, UNITY_NEXT_MAJORITY_PCT, UNITY_PREV_MAJORITY_PCT};
use unity_core::primitives::{Address, U160, U256};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("signer {0} is not a member of the unique node list")]
    NotInUnl(Address),
    #[error("proposal timestamp {got} is older than the signer's last proposal at {last}")]
    StaleProposal { got: i64, last: i64 },
    #[error("signature does not recover to the claimed signer")]
    BadSignature,
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// The content every signer votes on: a timestamp, the digest of the
/// previously committed proposal this one builds on, and the set of
/// item ids it proposes for the next block.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub timestamp: i64,
    pub prev_digest: U160,
    pub items: BTreeSet<U160>,
}

impl Proposal {
    pub fn genesis(prev_digest: U160, timestamp: i64) -> Proposal {
        Proposal { timestamp, prev_digest, items: BTreeSet::new() }
    }

    /// This proposal's own digest: what every other signer's
    /// `prev_digest` must equal to build on it, and what other signers'
    /// `next_proposal_votes` tally against to detect Unity (§4.3.3 step
    /// 7).
    pub fn digest<C: CryptoProvider>(&self, crypto: &C) -> U160 {
        hash160_of(self, |data| crypto.hash160(data))
    }

    /// The wider digest signatures actually run over; `CryptoProvider`'s
    /// recoverable-ECDSA operations take a SHA-256 digest, distinct from
    /// the `hash160` identity above used for `prev_digest` chaining.
    fn signing_digest<C: CryptoProvider>(&self, crypto: &C) -> U256 {
        sha256_of(self, |data| crypto.sha256(data))
    }
}

impl CanonicalEncode for Proposal {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_i64(self.timestamp);
        enc.write_raw(&self.prev_digest);
        let items: Vec<U160> = self.items.iter().copied().collect();
        enc.write_sorted_set(&items);
    }
}

impl CanonicalDecode for Proposal {
    fn decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, CanonicalError> {
        let timestamp = dec.read_i64()?;
        let prev_digest = U160::decode(dec)?;
        let count = dec.read_varint()?;
        let mut items = BTreeSet::new();
        for _ in 0..count {
            items.insert(U160::decode(dec)?);
        }
        Ok(Proposal { timestamp, prev_digest, items })
    }
}

/// A `Proposal` plus the signature binding it to its signer (§3.6).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SignedProposal {
    pub proposal: Proposal,
    pub signature: CompactSignature,
}

impl SignedProposal {
    pub fn sign<C: CryptoProvider>(crypto: &C, secret: &[u8; 32], proposal: Proposal) -> Result<SignedProposal> {
        let digest = proposal.signing_digest(crypto);
        let signature = crypto.sign_digest(secret, &digest).map_err(|_| ConsensusError::BadSignature)?;
        Ok(SignedProposal { proposal, signature })
    }

    pub fn digest<C: CryptoProvider>(&self, crypto: &C) -> U160 {
        self.proposal.digest(crypto)
    }

    fn signer<C: CryptoProvider>(&self, crypto: &C) -> Result<Address> {
        let digest = self.proposal.signing_digest(crypto);
        crypto.recover_address(&digest, &self.signature).map_err(|_| ConsensusError::BadSignature)
    }
}

/// Per-item tally state (§3.6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ItemState {
    /// Whether the local node independently considers this item valid
    /// (e.g. a transaction it has itself evaluated against the ledger).
    /// An item lacking this is still weighed (§4.3.4: "still counted
    /// toward that id's weight"); it just never gets offered as a
    /// candidate when the local node rebases onto a new `prev`.
    pub valid_locally: bool,
    pub weight_sum: f64,
    pub count: u32,
}

/// Unity consensus node state for one `unique_node_list` member (or an
/// observer that tracks the protocol without itself proposing).
pub struct Node<C: CryptoProvider> {
    crypto: C,
    unl: BTreeSet<Address>,
    /// This node's own signing key, if it is itself a UNL member.
    local_secret: Option<[u8; 32]>,
    local_address: Option<Address>,
    peer_proposals: HashMap<Address, SignedProposal>,
    item_states: HashMap<U160, ItemState>,
    prev_proposal_votes: HashMap<U160, u64>,
    next_proposal_votes: HashMap<U160, u64>,
    current_proposal: Proposal,
    prev_proposal: Option<Proposal>,
}

/// Outcome of feeding one signed proposal into the round algorithm.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// A new item id referenced by the incoming proposal that the local
    /// node has not seen the payload for yet (§4.3.4's fetch-enqueue
    /// note).
    pub unknown_items: Vec<U160>,
    /// Set when step 3 re-rooted `current_proposal` at a new `prev`.
    pub rebased: bool,
    /// Set when step 7 detected Unity and committed a proposal.
    pub committed: Option<Proposal>,
}

impl<C: CryptoProvider> Node<C> {
    pub fn new(crypto: C, unl: BTreeSet<Address>, genesis_digest: U160, genesis_timestamp: i64) -> Node<C> {
        Node {
            crypto,
            unl,
            local_secret: None,
            local_address: None,
            peer_proposals: HashMap::new(),
            item_states: HashMap::new(),
            prev_proposal_votes: HashMap::new(),
            next_proposal_votes: HashMap::new(),
            current_proposal: Proposal::genesis(genesis_digest, genesis_timestamp),
            prev_proposal: None,
        }
    }

    /// Enables this node to sign and submit proposals of its own. A
    /// node need not be a UNL member to track consensus (an observer
    /// watching for the next block), so this is opt-in.
    pub fn with_local_signer(mut self, address: Address, secret: [u8; 32]) -> Node<C> {
        self.local_address = Some(address);
        self.local_secret = Some(secret);
        self
    }

    pub fn current_proposal(&self) -> &Proposal {
        &self.current_proposal
    }

    pub fn prev_proposal(&self) -> Option<&Proposal> {
        self.prev_proposal.as_ref()
    }

    pub fn item_state(&self, item: &U160) -> Option<&ItemState> {
        self.item_states.get(item)
    }

    /// Marks `item` as independently verified by the local node (e.g. a
    /// transaction that passed ledger evaluation). Items never marked
    /// this way still vote normally; they are just never offered as a
    /// candidate when the local node rebases onto a new `prev` (step 3
    /// only seeds "every locally-valid item").
    pub fn mark_valid_locally(&mut self, item: U160) {
        self.item_states.entry(item).or_default().valid_locally = true;
    }

    /// Builds, signs and records this node's own proposal for the
    /// current round from whatever pending items have passed local
    /// evaluation. Returns `None` if this node has no signing key.
    pub fn propose(&mut self, timestamp: i64) -> Option<SignedProposal> {
        let secret = self.local_secret?;
        let address = self.local_address?;
        let items: BTreeSet<U160> = self
            .item_states
            .iter()
            .filter(|(_, s)| s.valid_locally)
            .map(|(id, _)| *id)
            .collect();
        let proposal = Proposal { timestamp, prev_digest: self.current_proposal.prev_digest, items };
        let signed = SignedProposal::sign(&self.crypto, &secret, proposal).ok()?;
        let _ = self.ingest(address, signed.clone());
        Some(signed)
    }

    /// §4.3.3, steps 1-7: folds one signer's latest proposal into the
    /// round state and runs the full re-evaluation it triggers.
    pub fn ingest(&mut self, claimed_signer: Address, signed: SignedProposal) -> Result<RoundOutcome> {
        let signer = signed.signer(&self.crypto)?;
        if signer != claimed_signer {
            return Err(ConsensusError::BadSignature);
        }
        if !self.unl.contains(&signer) {
            return Err(ConsensusError::NotInUnl(signer));
        }
        if let Some(previous) = self.peer_proposals.get(&signer) {
            if signed.proposal.timestamp < previous.proposal.timestamp {
                return Err(ConsensusError::StaleProposal { got: signed.proposal.timestamp, last: previous.proposal.timestamp });
            }
        }

        let mut outcome = RoundOutcome::default();

        // Step 2: replace peer_proposals[s], adjusting vote tallies.
        if let Some(previous) = self.peer_proposals.remove(&signer) {
            self.retract_votes(&previous);
        }
        self.cast_votes(&signed);
        for item in &signed.proposal.items {
            if !self.item_states.contains_key(item) {
                outcome.unknown_items.push(*item);
            }
            self.item_states.entry(*item).or_default();
        }
        self.peer_proposals.insert(signer, signed);

        // Step 3: agreement on prev.
        if self.maybe_rebase() {
            outcome.rebased = true;
        }

        // Steps 4-6: recompute per-peer weight and the new proposal.
        self.recompute_current_proposal();

        // Step 7: unity detection / commit.
        outcome.committed = self.maybe_commit();

        Ok(outcome)
    }

    /// Removes a disconnected signer's contribution entirely, keeping
    /// `Σ votes(item) ≤ |peer_proposals|` true indefinitely. The
    /// original protocol only ever incremented `prev_proposal_votes`
    /// for a newly seen peer and never decremented it on disconnect, so
    /// long-running nodes would drift; this is a deliberate fix, not a
    /// faithful reproduction of that drift.
    pub fn forget_peer(&mut self, signer: &Address) {
        if let Some(previous) = self.peer_proposals.remove(signer) {
            self.retract_votes(&previous);
            self.recompute_current_proposal();
            debug!(signer = %signer, "forgot disconnected peer, retracted its votes");
        }
    }

    fn cast_votes(&mut self, signed: &SignedProposal) {
        *self.prev_proposal_votes.entry(signed.proposal.prev_digest).or_insert(0) += 1;
        let digest = signed.digest(&self.crypto);
        *self.next_proposal_votes.entry(digest).or_insert(0) += 1;
        for item in &signed.proposal.items {
            self.item_states.entry(*item).or_default().count += 1;
        }
    }

    fn retract_votes(&mut self, signed: &SignedProposal) {
        if let Some(count) = self.prev_proposal_votes.get_mut(&signed.proposal.prev_digest) {
            *count = count.saturating_sub(1);
        }
        let digest = signed.digest(&self.crypto);
        if let Some(count) = self.next_proposal_votes.get_mut(&digest) {
            *count = count.saturating_sub(1);
        }
        for item in &signed.proposal.items {
            if let Some(state) = self.item_states.get_mut(item) {
                state.count = state.count.saturating_sub(1);
            }
        }
    }

    /// Step 3: if a `prev_digest` other than the local one has captured
    /// a strict majority of the UNL, reset `current_proposal` to root
    /// at it, seeded with every item the local node already trusts.
    fn maybe_rebase(&mut self) -> bool {
        let Some((&majority_prev, &votes)) = self.prev_proposal_votes.iter().max_by_key(|(_, v)| *v) else {
            return false;
        };
        if majority_prev == self.current_proposal.prev_digest {
            return false;
        }
        if !clears_percent(votes, self.unl.len() as u64, UNITY_PREV_MAJORITY_PCT) {
            return false;
        }
        let items: BTreeSet<U160> = self
            .item_states
            .iter()
            .filter(|(_, s)| s.valid_locally)
            .map(|(id, _)| *id)
            .collect();
        self.current_proposal = Proposal { timestamp: self.current_proposal.timestamp, prev_digest: majority_prev, items };
        info!(prev = ?majority_prev, votes, "rebased current proposal onto new prev_digest majority");
        true
    }

    /// Steps 4-6: per-peer weight, per-item weighted average, and the
    /// resulting new proposal content/timestamp.
    fn recompute_current_proposal(&mut self) {
        let active_peers = (self.peer_proposals.len() as u64).max(self.unl.len() as u64 / 2).max(1);

        let aligned: Vec<&SignedProposal> = self
            .peer_proposals
            .values()
            .filter(|p| p.proposal.prev_digest == self.current_proposal.prev_digest)
            .collect();
        if aligned.is_empty() {
            return;
        }

        for state in self.item_states.values_mut() {
            state.weight_sum = 0.0;
        }

        for peer in &aligned {
            if peer.proposal.items.is_empty() {
                continue;
            }
            let weight = peer.proposal.items.len() as f64 * active_peers as f64;
            let per_item_vote: f64 = peer
                .proposal
                .items
                .iter()
                .map(|item| self.item_states.get(item).map(|s| s.count as f64).unwrap_or(0.0))
                .sum();
            let peer_weight = per_item_vote / weight;
            for item in &peer.proposal.items {
                self.item_states.entry(*item).or_default().weight_sum += peer_weight;
            }
        }

        let max_weight = self.item_states.values().map(|s| s.weight_sum).fold(0.0_f64, f64::max);
        let threshold = max_weight * (UNITY_ITEM_THRESHOLD_PCT as f64 / 100.0);
        let items: BTreeSet<U160> = self
            .item_states
            .iter()
            .filter(|(_, s)| s.weight_sum > threshold)
            .map(|(id, _)| *id)
            .collect();

        let mut timestamps: Vec<i64> = aligned.iter().map(|p| p.proposal.timestamp).collect();
        timestamps.sort_unstable();
        let timestamp = timestamps[timestamps.len() / 2];

        self.current_proposal = Proposal { timestamp, prev_digest: self.current_proposal.prev_digest, items };
    }

    /// Step 7: commit when a supermajority of the UNL report a
    /// `next_proposal_votes` tally matching our own current proposal's
    /// digest.
    fn maybe_commit(&mut self) -> Option<Proposal> {
        let digest = self.current_proposal.digest(&self.crypto);
        let votes = *self.next_proposal_votes.get(&digest).unwrap_or(&0);
        if !clears_percent(votes, self.unl.len() as u64, UNITY_NEXT_MAJORITY_PCT) {
            return None;
        }
        let committed = self.current_proposal.clone();
        for item in &committed.items {
            self.item_states.remove(item);
        }
        self.prev_proposal = Some(committed.clone());
        self.current_proposal = Proposal::genesis(digest, committed.timestamp);
        info!(digest = ?digest, items = committed.items.len(), "unity reached, proposal committed");
        Some(committed)
    }
}

fn clears_percent(votes: u64, total: u64, pct: u64) -> bool {
    if total == 0 {
        return false;
    }
    votes * 100 > total * pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use unity_crypto::Secp256k1Provider;

    fn signer(crypto: &Secp256k1Provider) -> (Address, [u8; 32]) {
        let (secret, pubkey) = crypto.generate_keypair();
        (crypto.address_from_public_key(&pubkey), secret)
    }

    #[test]
    fn rejects_a_signer_outside_the_unl() {
        let crypto = Secp256k1Provider::new();
        let (outsider_addr, outsider_secret) = signer(&crypto);
        let unl = BTreeSet::new();
        let mut node = Node::new(Secp256k1Provider::new(), unl, [0u8; 20], 1_700_000_000);

        let proposal = Proposal::genesis([0u8; 20], 1_700_000_001);
        let signed = SignedProposal::sign(&crypto, &outsider_secret, proposal).unwrap();
        let err = node.ingest(outsider_addr, signed).unwrap_err();
        assert!(matches!(err, ConsensusError::NotInUnl(_)));
    }

    #[test]
    fn three_of_four_signers_reaching_the_same_proposal_commits_it() {
        let crypto = Secp256k1Provider::new();
        let signers: Vec<(Address, [u8; 32])> = (0..4).map(|_| signer(&crypto)).collect();
        let unl: BTreeSet<Address> = signers.iter().map(|(a, _)| *a).collect();

        let mut nodes: Vec<Node<Secp256k1Provider>> = signers
            .iter()
            .map(|(addr, secret)| Node::new(Secp256k1Provider::new(), unl.clone(), [0u8; 20], 1_700_000_000).with_local_signer(*addr, *secret))
            .collect();

        let item_a = [7u8; 20];
        for node in nodes.iter_mut() {
            node.mark_valid_locally(item_a);
        }

        // Every signer proposes the same single item; broadcast each
        // proposal to every node (including its own).
        let mut proposals = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            let signed = node.propose(1_700_000_010 + i as i64).unwrap();
            proposals.push((signers[i].0, signed));
        }

        let mut committed = None;
        for node in nodes.iter_mut() {
            for (addr, signed) in &proposals {
                let outcome = node.ingest(*addr, signed.clone()).unwrap();
                if outcome.committed.is_some() {
                    committed = outcome.committed;
                }
            }
        }

        let committed = committed.expect("unity should be reached with all four signers agreeing");
        assert_eq!(committed.items, BTreeSet::from([item_a]));
    }

    #[test]
    fn forgetting_a_peer_retracts_its_votes() {
        let crypto = Secp256k1Provider::new();
        let (addr, secret) = signer(&crypto);
        let mut unl = BTreeSet::new();
        unl.insert(addr);
        let mut node = Node::new(Secp256k1Provider::new(), unl, [0u8; 20], 1_700_000_000);

        let item_a = [9u8; 20];
        let mut items = BTreeSet::new();
        items.insert(item_a);
        let proposal = Proposal { timestamp: 1_700_000_010, prev_digest: [0u8; 20], items };
        let signed = SignedProposal::sign(&crypto, &secret, proposal).unwrap();
        node.ingest(addr, signed).unwrap();
        assert_eq!(node.item_state(&item_a).unwrap().count, 1);

        node.forget_peer(&addr);
        assert_eq!(node.item_state(&item_a).unwrap().count, 0);
    }
}
