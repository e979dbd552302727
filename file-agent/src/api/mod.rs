//! HTTP API module for the file agent.

pub mod error;
pub mod files;
pub mod health;

use crate::service::FileMutationService;
use crate::ws::WsState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: FileMutationService,
    pub ws_state: WsState,
}

impl AppState {
    pub fn new(service: FileMutationService, ws_state: WsState) -> Self {
        Self { service, ws_state }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.service.config().files.max_upload_bytes;

    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // File endpoints
        .route("/projects/{id}/files", get(files::list))
        .route("/projects/{id}/files/diff", post(files::diff))
        .route("/projects/{id}/files/upload", post(files::upload))
        .route("/projects/{id}/files/chunks", post(files::put_chunk))
        .route("/projects/{id}/files/merge", post(files::merge))
        .route("/projects/{id}/files/remote", post(files::remote))
        .route("/projects/{id}/files/delete", post(files::delete))
        .route("/projects/{id}/files/batch-delete", post(files::batch_delete))
        .route("/projects/{id}/files/rename", post(files::rename))
        .route("/projects/{id}/files/create", post(files::create))
        .route(
            "/projects/{id}/files/text",
            get(files::read_text).put(files::write_text),
        )
        .route("/projects/{id}/files/download", get(files::download))
        // Backup endpoints
        .route(
            "/projects/{id}/backups/{backup_id}/restore",
            post(files::restore),
        )
        // WebSocket endpoint
        .route("/ws", get(crate::ws::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
