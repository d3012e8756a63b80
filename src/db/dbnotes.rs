use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Error as SqlxError, Row};
use std::time::Duration;
use tracing::{error, info};

use crate::db::{BackendError, NoteBackend, NoteRecord, UserProfile};

/// Postgres-backed note storage shared with the main application.
pub struct DbNotes {
    pool: PgPool,
}

impl DbNotes {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    ///
    /// # Returns
    /// * `Result<Self, SqlxError>` - Database connection pool or error
    pub async fn connect(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn log_pool_state(&self, what: &str) {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "{}. Pool connections: {} idle, {} in use",
            what,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );
    }
}

#[async_trait]
impl NoteBackend for DbNotes {
    /// A user may open a note they own or one shared with them through
    /// a permission row.
    async fn has_note_access(&self, user_id: i64, note_id: i64) -> Result<bool, BackendError> {
        self.log_pool_state(&format!(
            "Checking access for user {} on note {}",
            user_id, note_id
        ));

        let query_sql = r#"
            SELECT (
                EXISTS(SELECT 1 FROM notes WHERE id = $1 AND user_id = $2)
                OR EXISTS(
                    SELECT 1 FROM permissions
                    WHERE resource_type = 'NOTE'
                        AND resource_id = $1
                        AND subject_id = $2
                )
            ) AS allowed
        "#;

        let row = sqlx::query(query_sql)
            .bind(note_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("allowed")?)
    }

    async fn get_profile(&self, user_id: i64) -> Result<Option<UserProfile>, BackendError> {
        let query_sql = r#"
            SELECT id, user_name, avatar
            FROM users
            WHERE id = $1
        "#;

        let row = sqlx::query(query_sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(UserProfile {
                id: row.try_get("id")?,
                user_name: row.try_get("user_name")?,
                avatar: row.try_get("avatar")?,
            })),
            None => Ok(None),
        }
    }

    async fn load_note(&self, note_id: i64) -> Result<Option<NoteRecord>, BackendError> {
        self.log_pool_state(&format!("Loading note {}", note_id));

        let query_sql = r#"
            SELECT id, user_id, content, updated_at
            FROM notes
            WHERE id = $1
        "#;

        let row = sqlx::query(query_sql)
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let record = NoteRecord {
                    id: row.try_get("id")?,
                    owner_id: row.try_get("user_id")?,
                    content: row.try_get("content")?,
                    updated_at: row.try_get("updated_at")?,
                };
                info!("Note {} loaded successfully", note_id);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save_note_content(&self, note_id: i64, content: &str) -> Result<(), BackendError> {
        self.log_pool_state(&format!(
            "Saving note {} ({} bytes)",
            note_id,
            content.len()
        ));

        let query_sql = r#"
            UPDATE notes
            SET content = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id
        "#;

        let row = sqlx::query(query_sql)
            .bind(note_id)
            .bind(content)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(_) => {
                info!("Note {} content saved", note_id);
                Ok(())
            }
            None => {
                error!("Note {} vanished before save", note_id);
                Err(BackendError::Other(format!(
                    "note {} no longer exists",
                    note_id
                )))
            }
        }
    }
}
