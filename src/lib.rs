//! Real-time note synchronization relay.
//!
//! Clients connect over a WebSocket, join a note room and exchange CRDT
//! updates and presence. Rooms live in memory and are written back to the
//! note store on a debounce. The HTTP side only carries health, readiness
//! and diagnostics endpoints.

pub mod config;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod routes;
pub mod services;
pub mod ws;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::db::NoteBackend;
use crate::services::profile_service::ProfileCache;
use crate::ws::registry::RoomRegistry;

/// Shared state handed to every handler and WebSocket session.
pub struct AppState {
    pub config: Config,
    pub backend: Option<Arc<dyn NoteBackend>>,
    pub registry: Arc<RoomRegistry>,
    pub profiles: ProfileCache,
}

impl AppState {
    pub fn new(config: Config, backend: Option<Arc<dyn NoteBackend>>) -> Arc<Self> {
        let registry = Arc::new(RoomRegistry::new(backend.clone(), config.save_debounce()));
        Arc::new(AppState {
            config,
            backend,
            registry,
            profiles: ProfileCache::new(),
        })
    }
}

/// Assemble the full router: REST API under /api, the WebSocket entry
/// point, and the OpenAPI document.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .nest("/api", routes::create_api_routes(state.clone()))
        .route("/ws/notes", get(ws::gateway::websocket_handler))
        .route("/api-docs/openapi.json", get(docs::serve_openapi))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(config: &Config) -> CorsLayer {
    match config.cors_origins.as_deref() {
        Some(origins) => {
            let parsed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|origin| match origin.trim().parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!("Ignoring invalid CORS origin: {}", origin);
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    }
}
