//! Hosted Session Store
//!
//! Sessions served over HTTP outlive a single request, so they are kept in a
//! [`SessionStore`] keyed by a generated id. Each entry carries its own lock:
//! one session is driven strictly sequentially while different sessions run
//! concurrently. Entries expire after a period without use.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, info};
use tutor_core::{
    history::{Checkpointer, HistoryStore, LessonStatus},
    session::{Reply, SessionState, TutorSession},
};
use uuid::Uuid;

/// A session together with the checkpointer that persists it.
pub struct HostedSession {
    pub session: TutorSession,
    pub checkpointer: Checkpointer,
}

impl HostedSession {
    pub fn new(session: TutorSession, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            session,
            checkpointer: Checkpointer::new(history),
        }
    }

    /// Writes the checkpoint a reply asks for, if any.
    pub async fn record(&mut self, reply: &Reply) {
        if let Some(status) = reply.checkpoint {
            let checkpoint = self.session.checkpoint(status);
            self.checkpointer.checkpoint(&checkpoint).await;
        }
    }

    /// Persists what a failed step left behind: an advanced part cursor or an
    /// unanswered question. Does nothing before teaching has begun.
    pub async fn record_progress(&mut self) {
        if matches!(
            self.session.state(),
            SessionState::Teaching | SessionState::QAndA
        ) {
            let checkpoint = self.session.checkpoint(LessonStatus::InProgress);
            self.checkpointer.checkpoint(&checkpoint).await;
        }
    }

    pub fn history_id(&self) -> Option<String> {
        self.checkpointer.id().map(|id| id.0.clone())
    }
}

pub type SharedSession = Arc<Mutex<HostedSession>>;

/// Create/get/remove by id, with expiry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: HostedSession) -> (Uuid, SharedSession);

    /// Looks up a live session and refreshes its expiry.
    async fn get(&self, id: &Uuid) -> Option<SharedSession>;

    async fn remove(&self, id: &Uuid) -> bool;

    /// Drops every expired session, returning how many were dropped.
    async fn purge_expired(&self) -> usize;
}

struct Entry {
    session: SharedSession,
    last_used: Instant,
}

pub struct InMemorySessionStore {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: HostedSession) -> (Uuid, SharedSession) {
        let id = Uuid::new_v4();
        let shared = Arc::new(Mutex::new(session));
        self.entries.lock().await.insert(
            id,
            Entry {
                session: shared.clone(),
                last_used: Instant::now(),
            },
        );
        debug!(session_id = %id, "Hosted session created");
        (id, shared)
    }

    async fn get(&self, id: &Uuid) -> Option<SharedSession> {
        let mut entries = self.entries.lock().await;
        let expired = entries.get(id)?.last_used.elapsed() > self.ttl;
        if expired {
            entries.remove(id);
            info!(session_id = %id, "Hosted session expired");
            return None;
        }
        let entry = entries.get_mut(id)?;
        entry.last_used = Instant::now();
        Some(entry.session.clone())
    }

    async fn remove(&self, id: &Uuid) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_used.elapsed() <= self.ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use tutor_core::{
        embedding::HashingEmbedding,
        generation::{Dialogue, GenerationService, MockGenerationService},
        history::{HistoryId, HistoryStore, InMemoryHistoryStore},
        index::{InMemoryBackend, IndexSettings, VectorIndex},
        prompts::Prompts,
        session::SessionError,
        stack::{StackSettings, TutorStack},
    };

    /// Plans like the mock service, but its dialogue only answers once.
    struct AnswersOnce;

    struct AnswersOnceDialogue {
        answered: bool,
    }

    #[async_trait]
    impl Dialogue for AnswersOnceDialogue {
        async fn send(&mut self, _prompt: &str) -> Result<String> {
            if self.answered {
                return Err(anyhow!("no response within 60000ms"));
            }
            self.answered = true;
            Ok("Volcanoes form where magma reaches the surface.".to_string())
        }
    }

    #[async_trait]
    impl GenerationService for AnswersOnce {
        async fn generate_plan(&self, topic: &str) -> Result<String> {
            MockGenerationService.generate_plan(topic).await
        }

        async fn complete(&self, prompt: &str) -> Result<String> {
            MockGenerationService.complete(prompt).await
        }

        fn open_dialogue(&self) -> Box<dyn Dialogue> {
            Box::new(AnswersOnceDialogue { answered: false })
        }
    }

    async fn hosted(history: Arc<dyn HistoryStore>) -> HostedSession {
        let stack = TutorStack::build(&StackSettings::offline("/nonexistent/images.json"))
            .await
            .unwrap();
        HostedSession::new(stack.new_session(), history)
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let (id, _) = store
            .create(hosted(Arc::new(InMemoryHistoryStore::new())).await)
            .await;

        assert!(store.get(&id).await.is_some());
        assert!(store.get(&Uuid::new_v4()).await.is_none());
        assert!(store.remove(&id).await);
        assert!(!store.remove(&id).await);
        assert!(store.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_dropped() {
        let store = InMemorySessionStore::new(Duration::from_millis(20));
        let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        let (first, _) = store.create(hosted(history.clone()).await).await;
        store.create(hosted(history).await).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&first).await.is_none());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_step_still_persists_advanced_cursor() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let index = VectorIndex::new(Arc::new(InMemoryBackend::new()), IndexSettings::new("images", 8));
        let stack = TutorStack::from_parts(
            Arc::new(AnswersOnce),
            Arc::new(HashingEmbedding::new(8)),
            Arc::new(index),
            Prompts::default(),
        );
        let mut session = HostedSession::new(stack.new_session(), history.clone());

        let reply = session.session.start("Volcanoes").await.unwrap();
        session.record(&reply).await;
        let id = HistoryId(session.history_id().unwrap());

        let failed = session.session.handle_input("next").await;
        assert!(matches!(failed, Err(SessionError::Generation(_))));
        session.record_progress().await;

        let record = history.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, LessonStatus::InProgress);
        assert_eq!(
            record.last_completed_part.as_deref(),
            Some("Introduction to Volcanoes")
        );
    }

    #[tokio::test]
    async fn test_progress_is_not_recorded_before_teaching() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut session = hosted(history.clone()).await;
        session.record_progress().await;
        assert!(session.history_id().is_none());
        assert!(history.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_checkpoints_only_when_asked() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut session = hosted(history.clone()).await;

        let reply = session.session.start("Volcanoes").await.unwrap();
        session.record(&reply).await;
        let id = session.history_id().unwrap();

        let reprompt = session.session.handle_input("  ").await.unwrap();
        assert_eq!(reprompt.checkpoint, None);
        session.record(&reprompt).await;

        let stopped = session.session.handle_input("exit").await.unwrap();
        session.record(&stopped).await;

        let listed = history.list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id.0, id);
        assert_eq!(listed[0].status.as_str(), "stopped");
    }
}
