use std::panic;
use std::sync::Arc;

use mello_sync::config::Config;
use mello_sync::db::{DbNotes, NoteBackend};
use mello_sync::{build_router, AppState};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "mello_sync=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Connect the note store if a URL is provided
    let backend: Option<Arc<dyn NoteBackend>> = if let Some(db_url) = &config.db_url {
        match DbNotes::connect(db_url).await {
            Ok(db) => {
                info!("Database initialized successfully");
                Some(Arc::new(db))
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Notes will not be loaded or persisted");
                None
            }
        }
    } else {
        warn!("No database URL configured - notes will not be loaded or persisted");
        None
    };

    if config.auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - all WebSocket connections will be refused");
    }

    let state = AppState::new(config, backend);
    state
        .registry
        .start_idle_sweeper(state.config.presence_idle(), state.config.presence_sweep());

    let addr = state.config.server_address();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", addr));

    info!("🚀 Server running on http://{}", addr);
    info!("📡 WebSocket available at ws://{}/ws/notes", addr);
    info!("📚 OpenAPI document at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
