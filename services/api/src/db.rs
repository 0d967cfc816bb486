//! Data Access Layer
//!
//! PostgreSQL storage for lesson histories. `Db` implements the engine's
//! [`HistoryStore`] contract on top of a `sqlx` connection pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, types::Json};
use std::sync::Arc;
use tracing::info;
use tutor_core::history::{
    Checkpoint, HistoryId, HistoryRecord, HistoryStore, HistorySummary, InMemoryHistoryStore,
    LessonStatus, Turn,
};
use uuid::Uuid;

/// Connects PostgreSQL when a URL is given, otherwise keeps histories in memory.
pub async fn connect_history_store(database_url: Option<&str>) -> Result<Arc<dyn HistoryStore>> {
    match database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let db = Db::new(pool);
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Ok(Arc::new(db))
        }
        None => {
            info!("DATABASE_URL not set, keeping lesson histories in memory.");
            Ok(Arc::new(InMemoryHistoryStore::new()))
        }
    }
}

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

#[derive(FromRow, Debug)]
struct HistoryRow {
    id: Uuid,
    topic: String,
    plan: Json<Vec<String>>,
    history: Json<Vec<Turn>>,
    status: String,
    last_completed_part: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow, Debug)]
struct SummaryRow {
    id: Uuid,
    topic: String,
    status: String,
    last_completed_part: Option<String>,
    parts: i32,
    updated_at: DateTime<Utc>,
}

fn parse_status(raw: &str) -> Result<LessonStatus> {
    LessonStatus::parse(raw).with_context(|| format!("Unknown lesson status '{}' in database", raw))
}

impl TryFrom<HistoryRow> for HistoryRecord {
    type Error = anyhow::Error;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(Self {
            id: HistoryId(row.id.to_string()),
            topic: row.topic,
            plan: row.plan.0,
            history: row.history.0,
            status: parse_status(&row.status)?,
            last_completed_part: row.last_completed_part,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<SummaryRow> for HistorySummary {
    type Error = anyhow::Error;

    fn try_from(row: SummaryRow) -> Result<Self> {
        Ok(Self {
            id: HistoryId(row.id.to_string()),
            topic: row.topic,
            status: parse_status(&row.status)?,
            last_completed_part: row.last_completed_part,
            parts: usize::try_from(row.parts).unwrap_or_default(),
            updated_at: row.updated_at,
        })
    }
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for Db {
    async fn create(&self, checkpoint: &Checkpoint) -> Result<HistoryId> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO lesson_histories (id, topic, plan, history, status, last_completed_part)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&checkpoint.topic)
        .bind(Json(&checkpoint.plan))
        .bind(Json(&checkpoint.history))
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.last_completed_part)
        .fetch_one(&self.pool)
        .await?;
        Ok(HistoryId(id.to_string()))
    }

    async fn update(&self, id: &HistoryId, checkpoint: &Checkpoint) -> Result<bool> {
        let Ok(id) = Uuid::parse_str(&id.0) else {
            return Ok(false);
        };
        let result = sqlx::query(
            r#"
            UPDATE lesson_histories
            SET plan = $2, history = $3, status = $4, last_completed_part = $5, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(&checkpoint.plan))
        .bind(Json(&checkpoint.history))
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.last_completed_part)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistorySummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT id, topic, status, last_completed_part,
                   jsonb_array_length(plan) AS parts, updated_at
            FROM lesson_histories
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistorySummary::try_from).collect()
    }

    async fn get(&self, id: &HistoryId) -> Result<Option<HistoryRecord>> {
        let Ok(id) = Uuid::parse_str(&id.0) else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, topic, plan, history, status, last_completed_part, created_at, updated_at
            FROM lesson_histories
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(HistoryRecord::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> HistoryRow {
        let now = Utc::now();
        HistoryRow {
            id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            topic: "Tides".to_string(),
            plan: Json(vec!["Moon".to_string(), "Sun".to_string()]),
            history: Json(vec![Turn::assistant("The moon pulls the sea.")]),
            status: status.to_string(),
            last_completed_part: Some("Moon".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_converts_to_record() {
        let record = HistoryRecord::try_from(row("in_progress")).unwrap();
        assert_eq!(record.id.0, "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(record.status, LessonStatus::InProgress);
        assert_eq!(record.plan.len(), 2);
        assert_eq!(record.history[0], Turn::assistant("The moon pulls the sea."));
    }

    #[test]
    fn test_unknown_status_is_an_error() {
        assert!(HistoryRecord::try_from(row("Moon")).is_err());
    }

    #[test]
    fn test_summary_row_conversion() {
        let summary = HistorySummary::try_from(SummaryRow {
            id: Uuid::new_v4(),
            topic: "Tides".to_string(),
            status: "completed".to_string(),
            last_completed_part: Some("Sun".to_string()),
            parts: 2,
            updated_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(summary.status, LessonStatus::Completed);
        assert_eq!(summary.parts, 2);
    }
}
