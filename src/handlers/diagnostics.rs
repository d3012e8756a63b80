use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::models::DiagnosticsResponse;
use crate::routes::auth_middleware::AuthUser;
use crate::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Room, session and host statistics for operators
pub async fn diagnostics(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> (StatusCode, Json<DiagnosticsResponse>) {
    // Aggregate counters across every live room
    let mut n_sessions: u32 = 0;
    let mut n_rooms: u32 = 0;
    let mut n_dirty_rooms: u32 = 0;
    let mut n_presence: u32 = 0;
    let mut n_revisions: u64 = 0;
    for room in state.registry.rooms_snapshot().await {
        let room_state = room.state.lock().await;
        n_rooms += 1;
        n_sessions += room_state.members.len() as u32;
        n_presence += room_state.presence.len() as u32;
        n_revisions += room_state.revision;
        if room_state.dirty {
            n_dirty_rooms += 1;
        }
    }

    let n_cached_profiles = state.profiles.entry_count() as u32;

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics for user {}: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Sessions: {}, Rooms: {}",
        user_id,
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_sessions,
        n_rooms
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_sessions,
            n_rooms,
            n_dirty_rooms,
            n_presence,
            n_revisions,
            n_cached_profiles,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    )
}
