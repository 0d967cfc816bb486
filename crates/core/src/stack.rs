//! Process-Lifetime Collaborators
//!
//! `TutorStack` wires the generation service, embedding provider, vector index
//! and image resolver together once at startup. Sessions borrow them through
//! `Arc`s; nothing here is global.

use anyhow::{Context, Result};
use async_openai::config::OpenAIConfig;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    augment::ExplanationAugmenter,
    embedding::{EmbeddingProvider, HashingEmbedding, OpenAIEmbedding},
    generation::{GenerationService, MockGenerationService, OpenAICompatibleClient},
    images::{ImageCatalog, ImageResolver, populate_index},
    index::{InMemoryBackend, IndexSettings, QdrantApi, QdrantBackend, VectorBackend, VectorIndex},
    prompts::Prompts,
    session::TutorSession,
};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1/";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Which generation and embedding backend to talk to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
    /// Deterministic offline collaborators.
    Mock,
}

/// Where image vectors are stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VectorStore {
    Qdrant {
        url: String,
        api_key: Option<String>,
        /// Fixed API flavour; read from the server version when `None`.
        api: Option<QdrantApi>,
    },
    InMemory,
}

#[derive(Clone, Debug)]
pub struct StackSettings {
    pub provider: Provider,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub vector_store: VectorStore,
    pub collection: String,
    pub catalog_path: PathBuf,
    pub prompts_path: Option<PathBuf>,
    /// Upper bound for each chat or embedding call.
    pub llm_timeout: Duration,
    /// Upper bound for each vector store request.
    pub vector_timeout: Duration,
}

impl StackSettings {
    /// Fully offline settings for the given catalog.
    pub fn offline(catalog_path: impl Into<PathBuf>) -> Self {
        Self {
            provider: Provider::Mock,
            api_key: None,
            chat_model: "mock".to_string(),
            embedding_model: "hashing".to_string(),
            embedding_dimensions: 768,
            vector_store: VectorStore::InMemory,
            collection: "edu_images".to_string(),
            catalog_path: catalog_path.into(),
            prompts_path: None,
            llm_timeout: Duration::from_secs(60),
            vector_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TutorStack {
    pub generator: Arc<dyn GenerationService>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub index: Arc<VectorIndex>,
    pub resolver: Arc<ImageResolver>,
    pub augmenter: Arc<ExplanationAugmenter>,
    pub prompts: Prompts,
}

impl TutorStack {
    /// Assembles the stack from already constructed collaborators.
    ///
    /// The index is left unpopulated; see [`TutorStack::populate`].
    pub fn from_parts(
        generator: Arc<dyn GenerationService>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<VectorIndex>,
        prompts: Prompts,
    ) -> Self {
        let resolver = Arc::new(ImageResolver::new(embedder.clone(), index.clone()));
        let augmenter = Arc::new(ExplanationAugmenter::new(
            generator.clone(),
            resolver.clone(),
            prompts.clone(),
        ));
        Self {
            generator,
            embedder,
            index,
            resolver,
            augmenter,
            prompts,
        }
    }

    /// Builds every collaborator from settings and loads the image catalog.
    ///
    /// Vector store problems never fail the build; they leave image search off.
    pub async fn build(settings: &StackSettings) -> Result<Self> {
        let prompts = match &settings.prompts_path {
            Some(dir) => Prompts::from_dir(dir)?,
            None => Prompts::default(),
        };

        let (generator, embedder): (Arc<dyn GenerationService>, Arc<dyn EmbeddingProvider>) =
            match settings.provider {
                Provider::OpenAI | Provider::Gemini => {
                    let api_base = if settings.provider == Provider::Gemini {
                        GEMINI_API_BASE
                    } else {
                        OPENAI_API_BASE
                    };
                    let api_key = settings
                        .api_key
                        .as_ref()
                        .with_context(|| format!("{:?} provider requires an API key", settings.provider))?;
                    let config = OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(api_base);
                    info!(provider = ?settings.provider, model = %settings.chat_model, "Using hosted generation service");
                    (
                        Arc::new(OpenAICompatibleClient::new(
                            config.clone(),
                            settings.chat_model.clone(),
                            prompts.clone(),
                            settings.llm_timeout,
                        )),
                        Arc::new(OpenAIEmbedding::new(
                            config,
                            settings.embedding_model.clone(),
                            settings.embedding_dimensions,
                            settings.llm_timeout,
                        )),
                    )
                }
                Provider::Mock => {
                    info!("Using mock generation service and hashing embeddings");
                    (
                        Arc::new(MockGenerationService),
                        Arc::new(HashingEmbedding::new(settings.embedding_dimensions)),
                    )
                }
            };

        let index_settings = IndexSettings::new(&settings.collection, embedder.dimensions());
        let index = Arc::new(
            connect_index(&settings.vector_store, index_settings, settings.vector_timeout).await,
        );
        let stack = Self::from_parts(generator, embedder, index, prompts);

        let catalog = match ImageCatalog::load(&settings.catalog_path) {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = ?e, "Image catalog unavailable; lessons will have no images");
                ImageCatalog::default()
            }
        };
        stack.populate(&catalog).await;
        Ok(stack)
    }

    /// Runs the one-shot bulk load of `catalog` into the index.
    pub async fn populate(&self, catalog: &ImageCatalog) -> usize {
        let written = populate_index(&self.index, self.embedder.as_ref(), catalog).await;
        info!(
            backend = %self.index.describe_backend(),
            embedder = self.embedder.name(),
            written,
            ready = self.index.is_ready(),
            "Image index initialised"
        );
        written
    }

    pub fn new_session(&self) -> TutorSession {
        TutorSession::new(
            self.generator.clone(),
            self.augmenter.clone(),
            self.prompts.clone(),
        )
    }
}

/// Picks the backend once. An unreachable store yields an unavailable index
/// that never issues a request.
async fn connect_index(
    store: &VectorStore,
    settings: IndexSettings,
    timeout: Duration,
) -> VectorIndex {
    match store {
        VectorStore::InMemory => VectorIndex::new(Arc::new(InMemoryBackend::new()), settings),
        VectorStore::Qdrant { url, api_key, api } => {
            match QdrantBackend::connect(url, api_key.clone(), *api, timeout).await {
                Ok(backend) => {
                    let backend: Arc<dyn VectorBackend> = Arc::new(backend);
                    VectorIndex::new(backend, settings)
                }
                Err(e) => {
                    let index = VectorIndex::new(Arc::new(InMemoryBackend::new()), settings);
                    index.mark_unavailable(&format!("could not reach {url}: {e}"));
                    index
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{augment::Segment, session::SessionState};

    fn write_catalog() -> PathBuf {
        let path = std::env::temp_dir().join(format!("stack-catalog-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[
                {"path": "images/intro.png", "description": "Introduction overview diagram"},
                {"path": "images/cell.png", "description": "Plant cell with chloroplasts"}
            ]"#,
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_offline_stack_populates_and_teaches() {
        let catalog = write_catalog();
        let stack = TutorStack::build(&StackSettings::offline(&catalog)).await.unwrap();
        std::fs::remove_file(&catalog).unwrap();

        assert!(stack.index.is_ready());
        assert_eq!(stack.index.count().await.unwrap(), 2);

        let mut session = stack.new_session();
        let reply = session.start("Plant cells").await.unwrap();
        assert_eq!(reply.state, SessionState::QAndA);
        assert!(matches!(&reply.segments[0], Segment::Text { content } if !content.is_empty()));
    }

    #[tokio::test]
    async fn test_missing_catalog_leaves_images_off() {
        let stack = TutorStack::build(&StackSettings::offline("/nonexistent/images.json"))
            .await
            .unwrap();
        assert!(!stack.index.is_ready());
        assert_eq!(stack.resolver.resolve("anything").await, None);
    }

    #[tokio::test]
    async fn test_unreachable_qdrant_degrades_without_failing() {
        let catalog = write_catalog();
        let mut settings = StackSettings::offline(&catalog);
        settings.vector_store = VectorStore::Qdrant {
            url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            api: None,
        };
        let stack = TutorStack::build(&settings).await.unwrap();
        std::fs::remove_file(&catalog).unwrap();

        assert!(!stack.index.is_available());
        let mut session = stack.new_session();
        assert!(session.start("Stars").await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_qdrant_does_not_hang_startup() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let catalog = write_catalog();
        let mut settings = StackSettings::offline(&catalog);
        settings.vector_timeout = Duration::from_millis(200);
        settings.vector_store = VectorStore::Qdrant {
            url: format!("http://{addr}"),
            api_key: None,
            api: None,
        };

        let built = tokio::time::timeout(Duration::from_secs(5), TutorStack::build(&settings)).await;
        std::fs::remove_file(&catalog).unwrap();
        let stack = built.expect("startup must not hang").unwrap();
        assert!(!stack.index.is_available());
    }

    #[tokio::test]
    async fn test_hosted_provider_requires_key() {
        let mut settings = StackSettings::offline("/nonexistent/images.json");
        settings.provider = Provider::OpenAI;
        assert!(TutorStack::build(&settings).await.is_err());
    }
}
