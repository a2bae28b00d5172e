//! Queue stats HTTP endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::get;
use axum::{Json, Router};

use jobforge_queue::{QueueStatsSnapshot, StatsSource};

/// `GET /stats` returns per-queue counters; `GET /health` returns `ok`.
pub fn router(source: Arc<dyn StatsSource>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(Extension(source))
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(
    Extension(source): Extension<Arc<dyn StatsSource>>,
) -> Json<BTreeMap<String, QueueStatsSnapshot>> {
    Json(source.stats())
}
