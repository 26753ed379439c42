//! HTTP read path, transaction submission and the SSE event stream.
//!
//! Responses are JSON projections of the canonical types; scores come out
//! as decimals for tooling, while the chain itself only ever computes in
//! basis points.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use cpc_core::{
    AccountAddress, Amount, ConsensusAddress, EventBus, Hash32, Transaction, BPS_DENOMINATOR,
};
use cpc_mempool::{InsertOutcome, Mempool};
use cpc_snapshot::SnapshotStore;
use cpc_state::{ChainState, Validator};
use cpc_storage::BlockStore;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

/// Live, non-consensus node statistics maintained by the node loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeInfo {
    pub peer_count: usize,
    pub total_transactions: u64,
    pub total_gas_used: u64,
    pub rolling_tps: f64,
}

#[derive(Clone)]
pub struct RpcState {
    pub view: Arc<RwLock<ChainState>>,
    pub store: Arc<dyn BlockStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub mempool: Arc<Mempool>,
    pub events: EventBus,
    /// Accepted transactions are handed to the node for P2P relay.
    pub relay: mpsc::Sender<Transaction>,
    pub info: Arc<RwLock<NodeInfo>>,
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/tx", post(submit_tx))
        .route("/block/height/:height", get(block_by_height))
        .route("/block/hash/:hash", get(block_by_hash))
        .route("/account/:address", get(account))
        .route("/validator/:address", get(validator))
        .route("/validators/leaderboard", get(leaderboard))
        .route("/validators/jailed", get(jailed))
        .route("/delegations/:address", get(delegations))
        .route("/unbonding/:address", get(unbonding))
        .route("/rewards/:address", get(rewards))
        .route("/mempool", get(mempool_size))
        .route("/snapshots", get(snapshots))
        .route("/events", get(events))
        .with_state(state)
}

pub async fn serve(listen_addr: &str, state: RpcState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "rpc listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let (height, tip, epoch, active) = {
        let view = state.view.read();
        (
            view.height,
            view.last_block_hash,
            view.epoch,
            view.active_set.len(),
        )
    };
    let info = state.info.read().clone();
    Json(json!({
        "height": height,
        "tip_hash": tip,
        "epoch": epoch,
        "active_validators": active,
        "mempool_size": state.mempool.len(),
        "peer_count": info.peer_count,
        "total_transactions": info.total_transactions,
        "total_gas_used": info.total_gas_used,
        "rolling_tps": info.rolling_tps,
    }))
}

async fn submit_tx(
    State(state): State<RpcState>,
    Json(tx): Json<Transaction>,
) -> Json<serde_json::Value> {
    let tx_id = tx.id();
    let state_nonce = state.view.read().nonce_of(&tx.sender);
    let now = unix_now();
    match state.mempool.insert(tx.clone(), state_nonce, now) {
        InsertOutcome::Accepted => {
            let _ = state.relay.send(tx).await;
            Json(json!({ "status": "Accepted", "tx_id": tx_id }))
        }
        InsertOutcome::Replaced { old } => {
            let _ = state.relay.send(tx).await;
            Json(json!({ "status": "Accepted", "tx_id": tx_id, "replaced": old }))
        }
        InsertOutcome::Rejected(reason) => Json(json!({
            "status": "Rejected",
            "tx_id": tx_id,
            "reason": reason.to_string(),
        })),
    }
}

async fn block_by_height(
    State(state): State<RpcState>,
    AxumPath(height): AxumPath<u64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let block = state
        .store
        .block_by_height(height)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "block": block })))
}

async fn block_by_hash(
    State(state): State<RpcState>,
    AxumPath(hash): AxumPath<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let hash = Hash32::from_hex(&hash).map_err(|_| StatusCode::BAD_REQUEST)?;
    let block = state
        .store
        .block_by_hash(&hash)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "block": block })))
}

async fn account(
    State(state): State<RpcState>,
    AxumPath(address): AxumPath<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let addr = AccountAddress(address);
    let view = state.view.read();
    let account = view.account(&addr).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "address": addr,
        "balance": account.balance,
        "nonce": account.nonce,
        "delegations_out": account.delegations_out,
        "unbonding_total": account.total_unbonding(),
    })))
}

fn validator_projection(v: &Validator) -> serde_json::Value {
    json!({
        "consensus_addr": v.consensus_addr,
        "operator": v.operator,
        "self_stake": v.self_stake,
        "total_delegated": v.total_delegated,
        "power": v.power,
        "commission_rate": v.commission_rate_bps as f64 / BPS_DENOMINATOR as f64,
        "metadata": v.metadata,
        "blocks_proposed": v.blocks_proposed,
        "blocks_expected": v.blocks_expected,
        "missed_blocks": v.missed_blocks,
        "uptime_score": v.uptime_score_bps as f64 / BPS_DENOMINATOR as f64,
        "performance_score": v.performance_score_bps as f64 / BPS_DENOMINATOR as f64,
        "total_penalties": v.total_penalties,
        "jail_count": v.jail_count,
        "jailed_until_height": v.jailed_until_height,
        "is_active": v.is_active,
        "joined_height": v.joined_height,
    })
}

async fn validator(
    State(state): State<RpcState>,
    AxumPath(address): AxumPath<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let addr = ConsensusAddress(address);
    let view = state.view.read();
    let v = view.validator(&addr).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(validator_projection(v)))
}

async fn leaderboard(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let view = state.view.read();
    let mut validators: Vec<&Validator> = view.validators.values().collect();
    validators.sort_by(|a, b| {
        b.performance_score_bps
            .cmp(&a.performance_score_bps)
            .then(b.power.cmp(&a.power))
            .then(a.consensus_addr.cmp(&b.consensus_addr))
    });
    Json(json!(validators
        .iter()
        .map(|v| validator_projection(v))
        .collect::<Vec<_>>()))
}

async fn jailed(State(state): State<RpcState>) -> Json<serde_json::Value> {
    let view = state.view.read();
    let height = view.height;
    let jailed: Vec<serde_json::Value> = view
        .validators
        .values()
        .filter(|v| v.is_jailed(height) || v.is_ejected(view.params.ejection_threshold_jails))
        .map(validator_projection)
        .collect();
    Json(json!(jailed))
}

async fn delegations(
    State(state): State<RpcState>,
    AxumPath(address): AxumPath<String>,
) -> Json<serde_json::Value> {
    let delegator = AccountAddress(address);
    let view = state.view.read();
    let positions: Vec<serde_json::Value> = view
        .validators
        .values()
        .filter_map(|v| {
            v.delegation_of(&delegator).map(|d| {
                json!({
                    "validator": v.consensus_addr,
                    "amount": d.amount,
                    "created_height": d.created_height,
                })
            })
        })
        .collect();
    Json(json!(positions))
}

async fn unbonding(
    State(state): State<RpcState>,
    AxumPath(address): AxumPath<String>,
) -> Json<serde_json::Value> {
    let addr = AccountAddress(address);
    let view = state.view.read();
    let entries = view
        .account(&addr)
        .map(|a| a.unbonding.clone())
        .unwrap_or_default();
    Json(json!(entries))
}

async fn rewards(
    State(state): State<RpcState>,
    AxumPath(address): AxumPath<String>,
) -> Json<serde_json::Value> {
    let addr = AccountAddress(address);
    let view = state.view.read();
    let history = view
        .account(&addr)
        .map(|a| a.reward_history.clone())
        .unwrap_or_default();
    let total: Amount = history
        .iter()
        .fold(Amount::zero(), |acc, r| acc + r.amount);
    Json(json!({ "history": history, "total": total }))
}

async fn mempool_size(State(state): State<RpcState>) -> Json<serde_json::Value> {
    Json(json!({ "size": state.mempool.len() }))
}

async fn snapshots(State(state): State<RpcState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let list = state
        .snapshots
        .list()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let out: Vec<serde_json::Value> = list
        .iter()
        .map(|s| {
            json!({
                "height": s.height,
                "digest": s.digest,
                "size_bytes": s.size_bytes,
            })
        })
        .collect();
    Ok(Json(json!(out)))
}

/// Live event subscription: `tx_confirmed`, `tx_failed`, `block_created`
/// (plus `tx_accepted`), with keep-alive pings. Delivery is at-least-once
/// to live subscribers only.
async fn events(
    State(state): State<RpcState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| {
        let event = item.ok()?;
        Some(Ok(Event::default().json_data(&event).ok()?))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
