use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::db::{NoteBackend, UserProfile};

/// Color palette cycled through by user id, same order the web client
/// assigns collaborator colors.
pub const USER_COLORS: [&str; 8] = [
    "#1890ff", "#52c41a", "#faad14", "#f5222d", "#722ed1", "#13c2c2", "#eb2f96", "#fa8c16",
];

/// Deterministic display color for a participant.
pub fn user_color(user_id: i64) -> &'static str {
    USER_COLORS[user_id.rem_euclid(USER_COLORS.len() as i64) as usize]
}

/// Read-through cache in front of the backend's user table. Profiles
/// change rarely, so a short idle expiry keeps room joins from hitting
/// the database for every returning participant.
pub struct ProfileCache {
    cache: Cache<i64, UserProfile>,
}

impl ProfileCache {
    pub fn new() -> Self {
        ProfileCache {
            cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(Duration::from_secs(5 * 60))
                .build(),
        }
    }

    /// Look up a profile, falling back to a generated placeholder when
    /// the backend has no row for the user or no backend is configured.
    /// Placeholders are not cached so a later backend row wins.
    pub async fn get_or_fetch(
        &self,
        backend: Option<&Arc<dyn NoteBackend>>,
        user_id: i64,
    ) -> UserProfile {
        if let Some(profile) = self.cache.get(&user_id) {
            return profile;
        }

        if let Some(backend) = backend {
            match backend.get_profile(user_id).await {
                Ok(Some(profile)) => {
                    self.cache.insert(user_id, profile.clone());
                    return profile;
                }
                Ok(None) => {
                    debug!("No profile row for user {}", user_id);
                }
                Err(e) => {
                    error!("Failed to fetch profile for user {}: {}", user_id, e);
                }
            }
        }

        UserProfile {
            id: user_id,
            user_name: format!("User{}", user_id),
            avatar: None,
        }
    }

    pub fn entry_count(&self) -> u64 {
        // Entry counts lag behind inserts until housekeeping runs.
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new()
    }
}
