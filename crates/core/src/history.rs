//! Lesson History
//!
//! The durable record of a tutoring session lives behind the [`HistoryStore`]
//! contract. The [`Checkpointer`] is what an orchestrating caller uses after
//! each session step: it creates the record on the first write, updates the
//! same record afterwards, and never lets a storage failure reach the learner.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One append-only entry of a session's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub message: String,
}

impl Turn {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            message: message.into(),
        }
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            message: message.into(),
        }
    }
}

/// Lifecycle status of a lesson record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    InProgress,
    Completed,
    Stopped,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::InProgress => "in_progress",
            LessonStatus::Completed => "completed",
            LessonStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(LessonStatus::InProgress),
            "completed" => Some(LessonStatus::Completed),
            "stopped" => Some(LessonStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identifier assigned by the store on first write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryId(pub String);

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What gets written at a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub topic: String,
    pub plan: Vec<String>,
    pub history: Vec<Turn>,
    pub status: LessonStatus,
    /// Title of the last part the learner moved past, if any.
    pub last_completed_part: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: HistoryId,
    pub topic: String,
    pub plan: Vec<String>,
    pub history: Vec<Turn>,
    pub status: LessonStatus,
    pub last_completed_part: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub id: HistoryId,
    pub topic: String,
    pub status: LessonStatus,
    pub last_completed_part: Option<String>,
    pub parts: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&HistoryRecord> for HistorySummary {
    fn from(record: &HistoryRecord) -> Self {
        Self {
            id: record.id.clone(),
            topic: record.topic.clone(),
            status: record.status,
            last_completed_part: record.last_completed_part.clone(),
            parts: record.plan.len(),
            updated_at: record.updated_at,
        }
    }
}

/// Durable storage for lesson records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Stores a new record and returns its id.
    async fn create(&self, checkpoint: &Checkpoint) -> Result<HistoryId>;

    /// Overwrites plan, history and status of an existing record.
    ///
    /// Returns `false` when no record has that id.
    async fn update(&self, id: &HistoryId, checkpoint: &Checkpoint) -> Result<bool>;

    /// Most recently updated records first.
    async fn list(&self, limit: usize) -> Result<Vec<HistorySummary>>;

    async fn get(&self, id: &HistoryId) -> Result<Option<HistoryRecord>>;
}

/// Writes checkpoints for one session, reusing the id from the first write.
pub struct Checkpointer {
    store: Arc<dyn HistoryStore>,
    id: Option<HistoryId>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store, id: None }
    }

    pub fn id(&self) -> Option<&HistoryId> {
        self.id.as_ref()
    }

    /// Creates or updates the record. Failures are logged and reported as `false`.
    pub async fn checkpoint(&mut self, checkpoint: &Checkpoint) -> bool {
        match &self.id {
            None => match self.store.create(checkpoint).await {
                Ok(id) => {
                    info!(history_id = %id, status = %checkpoint.status, "History created");
                    self.id = Some(id);
                    true
                }
                Err(e) => {
                    warn!(error = ?e, status = %checkpoint.status, "History checkpoint failed");
                    false
                }
            },
            Some(id) => match self.store.update(id, checkpoint).await {
                Ok(true) => {
                    info!(history_id = %id, status = %checkpoint.status, "History updated");
                    true
                }
                Ok(false) => {
                    warn!(history_id = %id, "History record vanished; update skipped");
                    false
                }
                Err(e) => {
                    warn!(history_id = %id, error = ?e, "History checkpoint failed");
                    false
                }
            },
        }
    }
}

/// Process-local history store used when no database is configured.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    // Kept in update order; the most recent record is last.
    records: RwLock<Vec<HistoryRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create(&self, checkpoint: &Checkpoint) -> Result<HistoryId> {
        let now = Utc::now();
        let id = HistoryId(Uuid::new_v4().to_string());
        self.records.write().await.push(HistoryRecord {
            id: id.clone(),
            topic: checkpoint.topic.clone(),
            plan: checkpoint.plan.clone(),
            history: checkpoint.history.clone(),
            status: checkpoint.status,
            last_completed_part: checkpoint.last_completed_part.clone(),
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn update(&self, id: &HistoryId, checkpoint: &Checkpoint) -> Result<bool> {
        let mut records = self.records.write().await;
        let Some(pos) = records.iter().position(|r| &r.id == id) else {
            return Ok(false);
        };
        let mut record = records.remove(pos);
        record.plan = checkpoint.plan.clone();
        record.history = checkpoint.history.clone();
        record.status = checkpoint.status;
        record.last_completed_part = checkpoint.last_completed_part.clone();
        record.updated_at = Utc::now();
        records.push(record);
        Ok(true)
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistorySummary>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .map(HistorySummary::from)
            .collect())
    }

    async fn get(&self, id: &HistoryId) -> Result<Option<HistoryRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| &r.id == id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn checkpoint(topic: &str, status: LessonStatus) -> Checkpoint {
        Checkpoint {
            topic: topic.to_string(),
            plan: vec!["Intro".to_string(), "Details".to_string()],
            history: vec![Turn::assistant("Welcome")],
            status,
            last_completed_part: None,
        }
    }

    #[test]
    fn test_status_strings() {
        for status in [
            LessonStatus::InProgress,
            LessonStatus::Completed,
            LessonStatus::Stopped,
        ] {
            assert_eq!(LessonStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status)
            );
        }
        assert_eq!(LessonStatus::parse("Photosynthesis basics"), None);
    }

    #[test]
    fn test_turn_json_shape() {
        let json = serde_json::to_value(Turn::user("why?")).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "user", "message": "why?" }));
    }

    #[tokio::test]
    async fn test_checkpointer_creates_once_then_updates() {
        let mut store = MockHistoryStore::new();
        store
            .expect_create()
            .times(1)
            .returning(|_| Ok(HistoryId("h-1".to_string())));
        store
            .expect_update()
            .withf(|id, cp| id.0 == "h-1" && cp.status == LessonStatus::Completed)
            .times(2)
            .returning(|_, _| Ok(true));

        let mut checkpointer = Checkpointer::new(Arc::new(store));
        assert!(checkpointer.checkpoint(&checkpoint("Cells", LessonStatus::InProgress)).await);
        assert!(checkpointer.checkpoint(&checkpoint("Cells", LessonStatus::Completed)).await);
        assert!(checkpointer.checkpoint(&checkpoint("Cells", LessonStatus::Completed)).await);
        assert_eq!(checkpointer.id(), Some(&HistoryId("h-1".to_string())));
    }

    #[tokio::test]
    async fn test_checkpointer_swallows_store_failures() {
        let mut store = MockHistoryStore::new();
        store
            .expect_create()
            .times(2)
            .returning(|_| Err(anyhow!("connection refused")));

        let mut checkpointer = Checkpointer::new(Arc::new(store));
        assert!(!checkpointer.checkpoint(&checkpoint("Cells", LessonStatus::InProgress)).await);
        assert!(checkpointer.id().is_none());
        assert!(!checkpointer.checkpoint(&checkpoint("Cells", LessonStatus::InProgress)).await);
    }

    #[tokio::test]
    async fn test_in_memory_store_lists_by_recency() {
        let store = InMemoryHistoryStore::new();
        let first = store.create(&checkpoint("Cells", LessonStatus::InProgress)).await.unwrap();
        let second = store.create(&checkpoint("Stars", LessonStatus::InProgress)).await.unwrap();

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed[0].id, second);

        let mut done = checkpoint("Cells", LessonStatus::Stopped);
        done.last_completed_part = Some("Intro".to_string());
        assert!(store.update(&first, &done).await.unwrap());

        let listed = store.list(1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, first);
        assert_eq!(listed[0].status, LessonStatus::Stopped);
        assert_eq!(listed[0].parts, 2);

        let record = store.get(&first).await.unwrap().unwrap();
        assert_eq!(record.last_completed_part.as_deref(), Some("Intro"));
        assert!(record.updated_at >= record.created_at);
    }

    #[tokio::test]
    async fn test_in_memory_store_unknown_ids() {
        let store = InMemoryHistoryStore::new();
        let missing = HistoryId("nope".to_string());
        assert!(!store.update(&missing, &checkpoint("X", LessonStatus::Completed)).await.unwrap());
        assert!(store.get(&missing).await.unwrap().is_none());
    }
}
