//! HTTP API for health checks, swap status, and monitoring
//!
//! Read-only. Secrets never leave the process through this API.

use crate::chain::{ChainClient, ChainManager, WatcherState};
use crate::config::ApiConfig;
use crate::coordination::CoordinationEngine;
use crate::error::{ResolverError, ResolverResult};
use crate::ledger::{SwapRecord, SwapSide, SwapStatus};
use crate::store::KvStore;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinationEngine>,
    pub chain_manager: Arc<ChainManager>,
    pub store: Arc<dyn KvStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/swaps/pending", get(pending_swaps))
        .route("/swaps/hashlock/:hashlock", get(swap_by_hashlock))
        .route("/swaps/:order_hash", get(swap_by_order_hash))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server until `shutdown` resolves
pub async fn run_server(
    config: ApiConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ResolverResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            ResolverError::Config(format!("Failed to bind API server to {}: {}", addr, e))
        })?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ResolverError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store reachable and every chain answering
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);
    let watchers = state.chain_manager.watcher_states();

    let ready = store_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth {
                    chain_id,
                    healthy,
                    watcher: watcher_state(&watchers, chain_id),
                })
                .collect(),
        }),
    )
}

/// Connected chains with their watcher state and head block
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let watchers = state.chain_manager.watcher_states();
    let mut chains = Vec::new();

    for chain_id in state.chain_manager.connected_chains() {
        let head_block = match state.chain_manager.client(chain_id) {
            Ok(client) => client.block_number().await.ok(),
            Err(_) => None,
        };
        chains.push(ChainStatus {
            chain_id,
            watcher: watcher_state(&watchers, chain_id),
            head_block,
        });
    }

    Json(ChainsResponse { chains })
}

fn watcher_state(watchers: &[(u64, WatcherState)], chain_id: u64) -> Option<WatcherState> {
    watchers
        .iter()
        .find(|(id, _)| *id == chain_id)
        .map(|(_, state)| *state)
}

/// Swaps that are not terminal yet
async fn pending_swaps(
    State(state): State<AppState>,
) -> Result<Json<Vec<SwapView>>, ApiError> {
    let swaps = state.engine.ledger().list_active().await?;
    Ok(Json(swaps.iter().map(SwapView::from).collect()))
}

async fn swap_by_order_hash(
    State(state): State<AppState>,
    Path(order_hash): Path<String>,
) -> Result<Json<SwapView>, ApiError> {
    let order_hash = parse_h256(&order_hash)?;
    state
        .engine
        .ledger()
        .get(&order_hash)
        .await?
        .map(|swap| Json(SwapView::from(&swap)))
        .ok_or(ApiError::NotFound)
}

async fn swap_by_hashlock(
    State(state): State<AppState>,
    Path(hashlock): Path<String>,
) -> Result<Json<SwapView>, ApiError> {
    let hashlock = parse_h256(&hashlock)?;
    state
        .engine
        .ledger()
        .get_by_hashlock(&hashlock)
        .await?
        .map(|swap| Json(SwapView::from(&swap)))
        .ok_or(ApiError::NotFound)
}

/// Ledger and vault statistics
async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.stats().await?))
}

fn parse_h256(raw: &str) -> Result<H256, ApiError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes =
        hex::decode(digits).map_err(|_| ApiError::BadRequest(format!("not hex: {}", raw)))?;
    if bytes.len() != 32 {
        return Err(ApiError::BadRequest(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound,
    Internal(ResolverError),
}

impl From<ResolverError> for ApiError {
    fn from(e: ResolverError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "swap not found".to_string()),
            ApiError::Internal(e) => {
                error!("API request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
    watcher: Option<WatcherState>,
}

#[derive(Serialize)]
struct ChainStatus {
    chain_id: u64,
    watcher: Option<WatcherState>,
    head_block: Option<u64>,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainStatus>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// A swap record as exposed over HTTP, without its secret
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapView {
    order_hash: H256,
    hashlock: H256,
    status: SwapStatus,
    alice: Address,
    bob: Address,
    src: SwapSide,
    dst: SwapSide,
    has_secret: bool,
    secret_revealed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_count: u32,
    created_at: DateTime<Utc>,
    last_update_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<&SwapRecord> for SwapView {
    fn from(swap: &SwapRecord) -> Self {
        Self {
            order_hash: swap.order_hash,
            hashlock: swap.hashlock,
            status: swap.status,
            alice: swap.alice,
            bob: swap.bob,
            src: swap.src.clone(),
            dst: swap.dst.clone(),
            has_secret: swap.secret.is_some(),
            secret_revealed_at: swap.secret_revealed_at,
            last_error: swap.last_error.clone(),
            retry_count: swap.retry_count,
            created_at: swap.created_at,
            last_update_at: swap.last_update_at,
            completed_at: swap.completed_at,
        }
    }
}
