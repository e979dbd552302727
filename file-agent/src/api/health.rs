//! Health check endpoints.

use crate::sync::DIGEST_ALGORITHM;
use axum::{response::IntoResponse, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// GET /health - Health check endpoint
pub async fn health() -> impl IntoResponse {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "digest": DIGEST_ALGORITHM,
        "checksum": "md5",
        "archives": ["zip", "tar", "tar.gz", "tar.zst"],
    }))
}
