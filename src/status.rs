//! Status Surface (C5): a read-only `axum` router over engine/feed state,
//! plus passthrough order/trade lookups to C1.
//!
//! No teacher counterpart exists (the teacher reports status over Redis
//! pub/sub via `publisher.rs::MmStatusPublisher`, not HTTP). Grounded on the
//! `axum` + `tower-http` trace-layer stack used by sibling services in the
//! example pack (see `DESIGN.md`).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::feed::FeedStatus;

const MAX_ASSET_LEN: usize = 16;
const MAX_TXID_LEN: usize = 64;
const MAX_BATCH_TRADES: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub feed_status: Arc<FeedStatus>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auto-sell/status", get(status))
        .route("/balance/:asset", get(balance))
        .route("/trade/:txid", get(trade))
        .route("/trades/batch", post(trades_batch))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", uptime_seconds: state.started_at.elapsed().as_secs() })
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    initial_pass_complete: bool,
    feed_connected: bool,
    feed_degraded: bool,
    feed_last_heartbeat_unix_ms: u64,
    balances: std::collections::HashMap<String, String>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let balances = state.engine.balances_snapshot().into_iter().map(|(asset, amount)| (asset, amount.to_string())).collect();

    Json(StatusResponse {
        running: true,
        initial_pass_complete: state.engine.initial_pass_complete(),
        feed_connected: state.feed_status.connected(),
        feed_degraded: state.feed_status.degraded(),
        feed_last_heartbeat_unix_ms: state.feed_status.last_heartbeat_unix_ms(),
        balances,
    })
}

#[derive(Serialize)]
struct BalanceResponse {
    asset: String,
    amount: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn validation_error(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message.into() }))
}

fn not_found_error(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message.into() }))
}

fn validate_asset(asset: &str) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if asset.is_empty() || asset.len() > MAX_ASSET_LEN {
        return Err(validation_error(format!("asset must be 1-{MAX_ASSET_LEN} characters")));
    }
    Ok(())
}

fn validate_txid(txid: &str) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if txid.is_empty() || txid.len() > MAX_TXID_LEN {
        return Err(validation_error(format!("txid must be 1-{MAX_TXID_LEN} characters")));
    }
    Ok(())
}

async fn balance(State(state): State<AppState>, Path(asset): Path<String>) -> impl IntoResponse {
    if let Err(e) = validate_asset(&asset) {
        return e.into_response();
    }

    let balances = state.engine.balances_snapshot();
    match balances.get(&asset) {
        Some(amount) => Json(BalanceResponse { asset, amount: amount.to_string() }).into_response(),
        None => not_found_error(format!("unknown asset {asset}")).into_response(),
    }
}

#[derive(Serialize)]
struct OrderResponse {
    order_id: String,
    pair_symbol: String,
    state: String,
    volume_requested: String,
    volume_executed: String,
}

impl From<crate::exchange::Order> for OrderResponse {
    fn from(order: crate::exchange::Order) -> Self {
        Self {
            order_id: order.order_id,
            pair_symbol: order.pair_symbol,
            state: format!("{:?}", order.state).to_ascii_lowercase(),
            volume_requested: order.volume_requested.to_string(),
            volume_executed: order.volume_executed.to_string(),
        }
    }
}

async fn trade(State(state): State<AppState>, Path(txid): Path<String>) -> impl IntoResponse {
    if let Err(e) = validate_txid(&txid) {
        return e.into_response();
    }

    match state.engine.exchange().query_order(&txid).await {
        Ok(order) => Json(OrderResponse::from(order)).into_response(),
        Err(crate::error::ExchangeError::NotFound(msg)) => not_found_error(msg).into_response(),
        Err(e) => {
            log::warn!("order lookup for {txid} failed: {e}");
            (StatusCode::BAD_GATEWAY, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
    }
}

#[derive(Deserialize)]
struct TradesBatchRequest {
    txids: Vec<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum BatchEntry {
    Ok(OrderResponse),
    Err { error: String },
}

async fn trades_batch(State(state): State<AppState>, Json(body): Json<TradesBatchRequest>) -> impl IntoResponse {
    if body.txids.is_empty() {
        return validation_error("txids must not be empty").into_response();
    }
    if body.txids.len() > MAX_BATCH_TRADES {
        return validation_error(format!("txids must not exceed {MAX_BATCH_TRADES} entries")).into_response();
    }

    let mut results = std::collections::HashMap::with_capacity(body.txids.len());
    for txid in body.txids {
        if validate_txid(&txid).is_err() {
            results.insert(txid, BatchEntry::Err { error: "invalid txid".to_string() });
            continue;
        }
        match state.engine.exchange().query_order(&txid).await {
            Ok(order) => {
                results.insert(txid, BatchEntry::Ok(OrderResponse::from(order)));
            }
            Err(e) => {
                results.insert(txid, BatchEntry::Err { error: e.to_string() });
            }
        }
    }
    Json(results).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_validation_rejects_empty_and_overlong() {
        assert!(validate_asset("").is_err());
        assert!(validate_asset(&"X".repeat(MAX_ASSET_LEN + 1)).is_err());
        assert!(validate_asset("XETH").is_ok());
    }

    #[test]
    fn txid_validation_rejects_empty_and_overlong() {
        assert!(validate_txid("").is_err());
        assert!(validate_txid(&"X".repeat(MAX_TXID_LEN + 1)).is_err());
        assert!(validate_txid("OQCLML-BW3P3-BUCMWZ").is_ok());
    }
}
