//! The node's REST surface (§2.1, §4.4.2): chain status, block and
//! balance lookups, market depth, transaction submission and a
//! consensus-round snapshot, all read-only except for `/transactions`.
//!
//! Everything here reads from state `unity-node` owns and hands in as
//! `Arc`/`RwLock` handles; this crate never touches disk or the network
//! directly, matching how the teacher's `dxid-rpc` only ever talked to
//! its node through a shared store handle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use unity_consensus::Node as ConsensusNode;
use unity_core::ledger::LedgerState;
use unity_core::primitives::{Address, Amount, AssetUnit};
use unity_core::transaction::SignedTransaction;
use unity_core::TrxBlock;
use unity_crypto::Secp256k1Provider;
use unity_forkdb::ForkDb;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("bad address: {0}")]
    BadAddress(#[from] unity_core::error::AddressError),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error(transparent)]
    ForkDb(#[from] unity_forkdb::ForkDbError),
    #[error("transaction rejected: {0}")]
    Rejected(#[from] unity_core::error::EvalError),
    #[error(transparent)]
    Listen(#[from] std::io::Error),
}

impl axum::response::IntoResponse for RpcError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            RpcError::BadAddress(_) | RpcError::Rejected(_) => axum::http::StatusCode::BAD_REQUEST,
            RpcError::BlockNotFound(_) => axum::http::StatusCode::NOT_FOUND,
            RpcError::ForkDb(_) | RpcError::Listen(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Everything a handler needs, shared across the whole axum `Router`.
/// The ledger and mempool are locked independently so a balance lookup
/// never blocks on a pending transaction submission and vice versa.
#[derive(Clone)]
pub struct RpcState {
    pub ledger: Arc<RwLock<LedgerState>>,
    pub fork_db: Arc<ForkDb>,
    pub mempool: Arc<RwLock<Vec<SignedTransaction>>>,
    pub consensus: Arc<RwLock<ConsensusNode<Secp256k1Provider>>>,
    pub crypto: Arc<Secp256k1Provider>,
    pub peer_count: Arc<RwLock<usize>>,
}

pub async fn serve(config: &unity_config::RpcConfig, state: RpcState) -> Result<()> {
    let addr: SocketAddr = config.listen_addr.parse()?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST API listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/blocks/:height", get(get_block))
        .route("/balance/:address", get(balance))
        .route("/market/depth/:quote/:base", get(market_depth))
        .route("/transactions", post(submit_transaction))
        .route("/consensus/status", get(consensus_status))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct StatusResponse {
    tip_height: u64,
    tip_id: Option<String>,
    mempool_size: usize,
    peers: usize,
}

async fn status(State(state): State<RpcState>) -> Json<StatusResponse> {
    let ledger = state.ledger.read();
    let tip_id = ledger.tip_header().map(|h| bs58::encode(h.id(&*state.crypto)).into_string());
    Json(StatusResponse {
        tip_height: ledger.tip_height(),
        tip_id,
        mempool_size: state.mempool.read().len(),
        peers: *state.peer_count.read(),
    })
}

#[derive(Serialize)]
struct BlockResponse {
    header: unity_core::BlockHeader,
    trx_ids: Vec<String>,
}

async fn get_block(
    State(state): State<RpcState>,
    Path(height): Path<u64>,
) -> Result<Json<BlockResponse>, RpcError> {
    let header = {
        let ledger = state.ledger.read();
        ledger.headers.get(&height).cloned()
    }
    .ok_or(RpcError::BlockNotFound(height))?;

    let block_id = header.id(&*state.crypto);
    let trx_ids = match state.fork_db.block(&block_id)? {
        Some(TrxBlock { trxs, .. }) => {
            trxs.iter().map(|t| bs58::encode(t.id(&*state.crypto)).into_string()).collect()
        }
        None => Vec::new(),
    };
    Ok(Json(BlockResponse { header, trx_ids }))
}

#[derive(Serialize)]
struct BalanceEntry {
    unit: u16,
    amount: String,
}

#[derive(Serialize)]
struct BalanceResponse {
    address: String,
    balances: Vec<BalanceEntry>,
}

/// `LedgerState` indexes outputs by reference, not by owner, so a
/// balance lookup is a linear scan over every still-unspent output
/// whose claim names this address. Acceptable for a REST convenience
/// endpoint; a wallet doing its own scan would keep an index instead
/// (see `unity-wallet`'s UTXO-scan notes in DESIGN.md).
async fn balance(
    State(state): State<RpcState>,
    Path(addr): Path<String>,
) -> Result<Json<BalanceResponse>, RpcError> {
    let address: Address = addr.parse()?;
    let ledger = state.ledger.read();

    let mut totals: std::collections::BTreeMap<AssetUnit, Amount> = std::collections::BTreeMap::new();
    for meta in ledger.trx_num_to_meta.values() {
        for (idx, output) in meta.signed.trx.outputs.iter().enumerate() {
            if meta.spent[idx].is_some() {
                continue;
            }
            let owner = match &output.claim {
                unity_core::claim::Claim::BySignature { owner } => Some(*owner),
                unity_core::claim::Claim::ByBid { pay_address, .. } => Some(*pay_address),
                unity_core::claim::Claim::ByLong { pay_address, .. } => Some(*pay_address),
                unity_core::claim::Claim::ByCover { owner, .. } => Some(*owner),
                unity_core::claim::Claim::ByPts { .. } => None,
            };
            if owner == Some(address) {
                let entry = totals.entry(output.amount.unit).or_insert(Amount::ZERO);
                *entry = entry.checked_add(output.amount.amount).unwrap_or(*entry);
            }
        }
    }

    let balances = totals
        .into_iter()
        .map(|(unit, amount)| BalanceEntry { unit: unit.0, amount: amount.to_string() })
        .collect();
    Ok(Json(BalanceResponse { address: address.to_string(), balances }))
}

#[derive(Serialize)]
struct DepthResponse {
    bid_depth: String,
    ask_depth: String,
}

async fn market_depth(
    State(state): State<RpcState>,
    Path((quote, base)): Path<(u16, u16)>,
) -> Result<Json<DepthResponse>, RpcError> {
    let ledger = state.ledger.read();
    let stats = ledger
        .depth_stats
        .get(&(AssetUnit(quote), AssetUnit(base)))
        .copied()
        .unwrap_or_default();
    Ok(Json(DepthResponse { bid_depth: stats.bid_depth.to_string(), ask_depth: stats.ask_depth.to_string() }))
}

#[derive(Deserialize)]
struct SubmitTransactionRequest {
    transaction: SignedTransaction,
}

#[derive(Serialize)]
struct SubmitTransactionResponse {
    trx_id: String,
}

/// Evaluates the candidate against the current tip before admitting it,
/// exactly as `generate_next_block` will re-evaluate it later; a
/// transaction that fails here would only be dropped silently at mining
/// time otherwise.
async fn submit_transaction(
    State(state): State<RpcState>,
    Json(req): Json<SubmitTransactionRequest>,
) -> Result<Json<SubmitTransactionResponse>, RpcError> {
    let signed = req.transaction;
    let now = current_unix_time();
    let height = {
        let ledger = state.ledger.read();
        let next_height = ledger.tip_height() + 1;
        ledger.evaluate(&*state.crypto, &signed, false, now, next_height)?;
        next_height
    };
    let trx_id = signed.id(&*state.crypto);
    state.mempool.write().push(signed);
    let _ = height;
    Ok(Json(SubmitTransactionResponse { trx_id: bs58::encode(trx_id).into_string() }))
}

fn current_unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Serialize)]
struct ConsensusStatusResponse {
    current_items: usize,
    prev_committed: bool,
}

async fn consensus_status(State(state): State<RpcState>) -> Json<ConsensusStatusResponse> {
    let node = state.consensus.read();
    Json(ConsensusStatusResponse {
        current_items: node.current_proposal().items.len(),
        prev_committed: node.prev_proposal().is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::BTreeSet;
    use tower::ServiceExt;
    use unity_core::block::genesis_block;

    fn test_state() -> RpcState {
        let crypto = Secp256k1Provider::new();
        let mut ledger = LedgerState::new();
        let genesis = genesis_block(&crypto, 1_700_000_000, 1, &[]);
        ledger.push_block(&crypto, &genesis).unwrap();
        let genesis_id = genesis.id(&crypto);
        let consensus = ConsensusNode::new(Secp256k1Provider::new(), BTreeSet::new(), genesis_id, 1_700_000_000);
        let db = unity_storage::Database::open_temporary().unwrap();
        RpcState {
            ledger: Arc::new(RwLock::new(ledger)),
            fork_db: Arc::new(ForkDb::open(&db).unwrap()),
            mempool: Arc::new(RwLock::new(Vec::new())),
            consensus: Arc::new(RwLock::new(consensus)),
            crypto: Arc::new(crypto),
            peer_count: Arc::new(RwLock::new(0)),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_state());
        let response =
            app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_genesis_tip() {
        let app = router(test_state());
        let response =
            app.oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_block_height_is_404() {
        let app = router(test_state());
        let response =
            app.oneshot(Request::builder().uri("/blocks/99").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
