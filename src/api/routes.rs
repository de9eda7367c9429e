use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::MAX_INGEST_BODY_BYTES;
use crate::error::Result;
use crate::ingest::{IngestStats, Ingestor};
use crate::types::MarketSnapshot;

#[derive(Clone)]
pub struct ApiState {
    pub ingestor: Arc<Ingestor>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ingest", post(post_ingest))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .layer(DefaultBodyLimit::max(MAX_INGEST_BODY_BYTES))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub last_batch_at: Option<u64>,
    pub batches_ingested: u64,
    pub batches_failed: u64,
    pub markets_failed_total: u64,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Runs one ingestion batch. Concurrent requests queue behind the running batch.
/// A body that is not a JSON list of markets is rejected with 400.
async fn post_ingest(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<IngestStats>> {
    let markets = parse_batch(&body)?;
    let started = Instant::now();
    match state.ingestor.ingest(markets).await {
        Ok(stats) => {
            state.latency.record(started.elapsed());
            state.health.record_batch(now_secs(), &stats);
            Ok(Json(stats))
        }
        Err(e) => {
            state.health.record_failure();
            error!("POST /ingest failed: {e}");
            Err(e)
        }
    }
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let last = state.health.last_batch_at_secs();
    Json(HealthResponse {
        status: "ok",
        last_batch_at: (last > 0).then_some(last),
        batches_ingested: state.health.batches_ingested(),
        batches_failed: state.health.batches_failed(),
        markets_failed_total: state.health.markets_failed_total(),
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    let (p50_ms, p95_ms, p99_ms) = state.latency.percentiles();
    Json(LatencyResponse {
        samples: state.latency.len(),
        p50_ms,
        p95_ms,
        p99_ms,
    })
}

fn parse_batch(body: &[u8]) -> Result<Vec<MarketSnapshot>> {
    Ok(serde_json::from_slice(body)?)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
