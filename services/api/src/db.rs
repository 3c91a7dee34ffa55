//! Data Access Layer
//!
//! PostgreSQL storage of finalized turns behind the core
//! [`PersistenceGateway`] contract. Rows are read back in insertion order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;
use vaani_core::{
    persistence::{PersistenceError, PersistenceGateway},
    turn::{Speaker, Turn, TurnStatus},
};

/// A wrapper around the `PgPool` that stores turns per session.
#[derive(Clone)]
pub struct PgGateway {
    pool: PgPool,
}

#[derive(FromRow)]
struct TurnRow {
    id: Uuid,
    speaker: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TurnRow> for Turn {
    type Error = PersistenceError;

    fn try_from(row: TurnRow) -> Result<Self, Self::Error> {
        let speaker = row
            .speaker
            .parse::<Speaker>()
            .map_err(|e| PersistenceError::Corrupt(format!("turn {}: {}", row.id, e)))?;
        Ok(Turn {
            id: row.id,
            speaker,
            content: row.content,
            timestamp: row.created_at,
            status: TurnStatus::Final,
        })
    }
}

fn unavailable(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Unavailable(e.to_string())
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO turns (id, session_id, speaker, content, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(turn.id)
        .bind(session_id)
        .bind(turn.speaker.to_string())
        .bind(&turn.content)
        .bind(turn.timestamp)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        debug!(session_id, turn_id = %turn.id, inserted = result.rows_affected(), "Stored turn");
        Ok(())
    }

    async fn read_all(&self, session_id: &str) -> Result<Vec<Turn>, PersistenceError> {
        let rows = sqlx::query_as::<_, TurnRow>(
            r#"
            SELECT id, speaker, content, created_at
            FROM turns
            WHERE session_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.into_iter().map(Turn::try_from).collect()
    }

    async fn clear(&self, session_id: &str) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM turns WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}
