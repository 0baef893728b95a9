//! Node composition root (§5, §5.1): wires the ledger, fork database,
//! unity-consensus round state, libp2p peer registry and REST API
//! together, and runs them on a tokio current-thread runtime alongside
//! a dedicated OS thread doing proof-of-work search.
//!
//! The event loop is a single `tokio::select!` over three channels
//! (peer activity, mined blocks, shutdown), matching the "single
//! cooperative task owns consensus state" rule `unity-consensus` was
//! written against. Graceful shutdown is a `CancellationToken` rather
//! than dropping tasks, so an in-flight disk write always finishes.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use unity_config::UnityConfig;
use unity_consensus::{Node as ConsensusNode, SignedProposal};
use unity_core::block::{genesis_block, proof_of_work_value};
use unity_core::canonical::sha256_of;
use unity_core::ledger::LedgerState;
use unity_core::primitives::{Address, Amount, U160};
use unity_core::transaction::SignedTransaction;
use unity_core::TrxBlock;
use unity_crypto::Secp256k1Provider;
use unity_forkdb::ForkDb;
use unity_network::{GossipMessage, Libp2pPeerRegistry, NetworkConfig as P2pConfig, PeerEvent, PeerRegistry};
use unity_rpc::RpcState;
use unity_storage::{Database, LedgerStore};

/// How many nonce increments the mining thread tries before checking
/// whether the tip moved out from under it.
const MINING_BATCH: u64 = 200_000;

pub async fn run_node(config_path: PathBuf) -> Result<()> {
    init_logging();
    let cfg = UnityConfig::load(&config_path).with_context(|| format!("loading {config_path:?}"))?;
    info!(?config_path, "starting unity node");

    let db = Database::open(&cfg.storage.data_dir)?;
    let fork_db = Arc::new(ForkDb::open(&db)?);
    let ledger_store = Arc::new(LedgerStore::open(&db)?);
    let crypto = Arc::new(Secp256k1Provider::new());

    let allocations: Vec<(Address, Amount)> = cfg
        .genesis
        .allocations
        .iter()
        .map(|(addr, units)| -> Result<(Address, Amount)> { Ok((addr.parse()?, Amount::from_units(*units as i64))) })
        .collect::<Result<Vec<_>>>()?;

    // Rebuild whatever chain was persisted; seed genesis only on a
    // fresh data directory (§6.3: "rebuilt from, or checkpointed to,
    // that store").
    let mut ledger = ledger_store.load(&*crypto)?;
    let genesis =
        genesis_block(&*crypto, cfg.genesis.timestamp, cfg.genesis.initial_difficulty, &allocations);
    let genesis_id = genesis.id(&*crypto);
    if ledger.tip_header().is_none() {
        if fork_db.header(&genesis_id)?.is_none() {
            fork_db.cache_block(&*crypto, &genesis)?;
            fork_db.set_valid(genesis_id, true)?;
        }
        ledger.push_block(&*crypto, &genesis)?;
        ledger_store.persist_block(&genesis)?;
    }
    let ledger = Arc::new(RwLock::new(ledger));

    let unl = cfg.consensus.unl_addresses()?;
    let consensus_node =
        ConsensusNode::new(Secp256k1Provider::new(), BTreeSet::from_iter(unl), genesis_id, cfg.genesis.timestamp);
    if let Some(signer) = &cfg.consensus.local_signer {
        warn!(%signer, "local_signer configured but unity-node has no key source wired in yet; running as an observer");
    }
    let consensus = Arc::new(RwLock::new(consensus_node));

    let mempool: Arc<RwLock<Vec<SignedTransaction>>> = Arc::new(RwLock::new(Vec::new()));
    let peer_count = Arc::new(RwLock::new(0usize));
    let shutdown = CancellationToken::new();

    let (peer_events_tx, mut peer_events_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(Libp2pPeerRegistry::spawn(
        &P2pConfig { listen_addr: cfg.network.listen_addr.clone(), seed_nodes: cfg.network.seed_nodes.clone() },
        peer_events_tx,
    )?);

    let rpc_state = RpcState {
        ledger: ledger.clone(),
        fork_db: fork_db.clone(),
        mempool: mempool.clone(),
        consensus: consensus.clone(),
        crypto: crypto.clone(),
        peer_count: peer_count.clone(),
    };
    let rpc_cfg = cfg.rpc.clone();
    tokio::spawn(async move {
        if let Err(e) = unity_rpc::serve(&rpc_cfg, rpc_state).await {
            error!("rpc server exited: {e:?}");
        }
    });

    let (mined_tx, mut mined_rx) = mpsc::unbounded_channel();
    spawn_miner(ledger.clone(), crypto.clone(), mempool.clone(), mined_tx, shutdown.clone());

    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        ctrl_c_token.cancel();
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("node shutting down");
                break;
            }
            Some(event) = peer_events_rx.recv() => {
                handle_peer_event(&ledger, &fork_db, &ledger_store, &consensus, &mempool, &registry, crypto.as_ref(), &peer_count, event);
            }
            Some(block) = mined_rx.recv() => {
                match apply_block(&ledger, &fork_db, &ledger_store, crypto.as_ref(), &block) {
                    Ok(()) => {
                        info!(height = block.header.block_num, "mined and applied a new block");
                        let _ = registry.broadcast(GossipMessage::Block { block }).await;
                    }
                    Err(e) => warn!("locally mined block rejected: {e}"),
                }
            }
        }
    }

    Ok(())
}

fn handle_peer_event(
    ledger: &Arc<RwLock<LedgerState>>,
    fork_db: &Arc<ForkDb>,
    ledger_store: &Arc<LedgerStore>,
    consensus: &Arc<RwLock<ConsensusNode<Secp256k1Provider>>>,
    mempool: &Arc<RwLock<Vec<SignedTransaction>>>,
    registry: &Arc<Libp2pPeerRegistry>,
    crypto: &Secp256k1Provider,
    peer_count: &Arc<RwLock<usize>>,
    event: PeerEvent,
) {
    match event {
        PeerEvent::Subscribed { peer, topic } => {
            info!(peer = %peer.peer_id(), topic, "peer subscribed");
            *peer_count.write() += 1;
        }
        PeerEvent::Disconnected { .. } => {
            let mut count = peer_count.write();
            *count = count.saturating_sub(1);
        }
        PeerEvent::Gossip { message: GossipMessage::Block { block }, .. } => {
            if let Err(e) = apply_block(ledger, fork_db, ledger_store, crypto, &block) {
                warn!("rejected gossiped block: {e}");
            }
        }
        PeerEvent::Gossip { message: GossipMessage::Proposal { signed_proposal }, .. } => {
            ingest_proposal(consensus, registry, crypto, signed_proposal);
        }
        PeerEvent::Gossip { message: GossipMessage::GetBlob { items }, .. } => {
            respond_to_blob_request(mempool, registry, crypto, items);
        }
        PeerEvent::Gossip { message: GossipMessage::Blob { bytes }, .. } => {
            ingest_blob(ledger, consensus, mempool, crypto, &bytes);
        }
        PeerEvent::Gossip { .. } => {}
    }
}

/// Validates, caches and applies one block, performing a reorg if it
/// (or a fork it connects to) now outranks the currently applied chain.
/// Both `unity-core`'s `BlockError` and `unity-forkdb`'s `ForkDbError`
/// can surface here; callers only log the result, so `anyhow::Error`
/// erases the distinction rather than adding a third wrapper enum for
/// it.
fn apply_block(
    ledger: &Arc<RwLock<LedgerState>>,
    fork_db: &Arc<ForkDb>,
    ledger_store: &Arc<LedgerStore>,
    crypto: &Secp256k1Provider,
    block: &TrxBlock,
) -> Result<()> {
    let now = current_unix_time();
    let block_id = block.id(crypto);
    let current_tip_id = ledger.read().tip_header().map(|h| h.id(crypto));

    fork_db.cache_block(crypto, block)?;
    fork_db.set_valid(block_id, true)?;

    let best_id = fork_db.best_fork_head_id();
    if best_id == current_tip_id {
        return Ok(());
    }

    // Common case: the new block simply extends the chain already
    // applied and is still the best tip. No need to walk back to
    // genesis to find the fork point.
    if best_id == Some(block_id) && current_tip_id == Some(block.header.prev) {
        ledger.read().validate_block(crypto, block, now)?;
        ledger.write().push_block(crypto, block)?;
        ledger_store.persist_block(block)?;
        return Ok(());
    }

    reorg_to(ledger, fork_db, ledger_store, crypto, best_id, now)
}

/// Rolls the ledger's applied chain to `target`, popping blocks back to
/// the common ancestor with the current tip and re-pushing the new
/// fork's blocks in height order (§4.2.3/§5: "a reorganization pops
/// blocks back to the fork point before pushing the new fork's
/// blocks"). A block that fails re-validation during replay is
/// invalidated in `fork_db` and the best fork is re-selected, so one
/// bad block on a losing fork can't wedge the node.
fn reorg_to(
    ledger: &Arc<RwLock<LedgerState>>,
    fork_db: &Arc<ForkDb>,
    ledger_store: &Arc<LedgerStore>,
    crypto: &Secp256k1Provider,
    target: Option<U160>,
    now: i64,
) -> Result<()> {
    let Some(target_id) = target else { return Ok(()) };

    let mut new_chain = Vec::new();
    let mut cursor = target_id;
    loop {
        let meta = fork_db
            .header(&cursor)?
            .ok_or_else(|| anyhow::anyhow!("fork chain missing header {cursor:?}"))?;
        let height = meta
            .height
            .ok_or_else(|| anyhow::anyhow!("fork chain header at {cursor:?} not yet connected"))?;
        new_chain.push((height, cursor));
        if height == 0 {
            break;
        }
        cursor = meta.header.prev;
    }
    new_chain.reverse();

    let fork_point = {
        let guard = ledger.read();
        let mut point = 0u64;
        for (height, id) in &new_chain {
            match guard.headers.get(height) {
                Some(hdr) if hdr.id(crypto) == *id => point = *height,
                _ => break,
            }
        }
        point
    };

    {
        let mut guard = ledger.write();
        let mut height = guard.tip_height();
        while height > fork_point && guard.tip_header().is_some() {
            guard.pop_block(height);
            ledger_store.remove_block(height)?;
            if height == 0 {
                break;
            }
            height -= 1;
        }
    }

    for (height, id) in new_chain.into_iter().filter(|(h, _)| *h > fork_point) {
        let Some(block) = fork_db.block(&id)? else {
            warn!(height, "missing body for fork block during reorg, stopping replay");
            break;
        };
        let valid = ledger.read().validate_block(crypto, &block, now).is_ok();
        if !valid {
            warn!(height, ?id, "fork block failed validation during reorg, invalidating and re-selecting");
            fork_db.set_valid(id, false)?;
            return reorg_to(ledger, fork_db, ledger_store, crypto, fork_db.best_fork_head_id(), now);
        }
        ledger.write().push_block(crypto, &block)?;
        ledger_store.persist_block(&block)?;
    }
    Ok(())
}

/// Recovers the claimed signer ourselves: `unity-consensus::Node::ingest`
/// takes `claimed_signer` as a defense-in-depth double-check against
/// whatever transport-level identity a peer asserted, but this gossip
/// layer has no peer-identity-to-`Address` mapping, so the recovered
/// signer is passed as its own claim.
fn ingest_proposal(
    consensus: &Arc<RwLock<ConsensusNode<Secp256k1Provider>>>,
    registry: &Arc<Libp2pPeerRegistry>,
    crypto: &Secp256k1Provider,
    signed: SignedProposal,
) {
    let digest = sha256_of(&signed.proposal, |d| crypto.sha256(d));
    let signer = match crypto.recover_address(&digest, &signed.signature) {
        Ok(addr) => addr,
        Err(_) => {
            warn!("dropping proposal with unrecoverable signature");
            return;
        }
    };
    match consensus.write().ingest(signer, signed) {
        Ok(outcome) if !outcome.unknown_items.is_empty() => {
            let items = outcome.unknown_items;
            let registry = registry.clone();
            tokio::spawn(async move {
                let _ = registry.broadcast(GossipMessage::GetBlob { items }).await;
            });
        }
        Ok(_) => {}
        Err(e) => warn!(%signer, "proposal rejected: {e}"),
    }
}

/// Answers a `GetBlob` request with whatever requested items this node
/// has transactions for in its mempool, serialized the same way
/// `ingest_blob` expects to decode them.
fn respond_to_blob_request(
    mempool: &Arc<RwLock<Vec<SignedTransaction>>>,
    registry: &Arc<Libp2pPeerRegistry>,
    crypto: &Secp256k1Provider,
    items: Vec<U160>,
) {
    let wanted: BTreeSet<U160> = items.into_iter().collect();
    let matches: Vec<SignedTransaction> =
        mempool.read().iter().filter(|t| wanted.contains(&t.id(crypto))).cloned().collect();
    if matches.is_empty() {
        return;
    }
    let Ok(bytes) = serde_json::to_vec(&matches) else { return };
    let registry = registry.clone();
    tokio::spawn(async move {
        let _ = registry.broadcast(GossipMessage::Blob { bytes }).await;
    });
}

/// Decodes a `Blob` response, evaluates each transaction against the
/// current ledger tip, and for ones that pass, adds them to the mempool
/// and marks their item valid in the local consensus round (§4.3.4).
fn ingest_blob(
    ledger: &Arc<RwLock<LedgerState>>,
    consensus: &Arc<RwLock<ConsensusNode<Secp256k1Provider>>>,
    mempool: &Arc<RwLock<Vec<SignedTransaction>>>,
    crypto: &Secp256k1Provider,
    bytes: &[u8],
) {
    let Ok(trxs) = serde_json::from_slice::<Vec<SignedTransaction>>(bytes) else {
        warn!("dropping undecodable blob");
        return;
    };
    let now = current_unix_time();
    let guard = ledger.read();
    let height = guard.tip_height();
    for trx in trxs {
        let id = trx.id(crypto);
        if guard.evaluate(crypto, &trx, false, now, height).is_err() {
            continue;
        }
        let mut pool = mempool.write();
        if !pool.iter().any(|t| t.id(crypto) == id) {
            pool.push(trx);
        }
        drop(pool);
        consensus.write().mark_valid_locally(id);
    }
}

fn spawn_miner(
    ledger: Arc<RwLock<LedgerState>>,
    crypto: Arc<Secp256k1Provider>,
    mempool: Arc<RwLock<Vec<SignedTransaction>>>,
    mined_tx: mpsc::UnboundedSender<TrxBlock>,
    shutdown: CancellationToken,
) {
    std::thread::spawn(move || {
        while !shutdown.is_cancelled() {
            let now = current_unix_time();
            let required = { ledger.read().tip_header().map(|h| h.next_difficulty).unwrap_or(1) };
            let pending = mempool.read().clone();
            let mut candidate = { ledger.read().generate_next_block(&*crypto, &pending, now) };

            let mut found = false;
            for nonce in 0..MINING_BATCH {
                if shutdown.is_cancelled() {
                    return;
                }
                candidate.header.noncea = nonce;
                if proof_of_work_value(&*crypto, &candidate.header) >= required {
                    found = true;
                    break;
                }
            }

            if found && mined_tx.send(candidate).is_err() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });
}

fn current_unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn init_logging() {
    let subscriber = tracing_subscriber::fmt().with_max_level(Level::INFO).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
