//! Embedding Providers
//!
//! Maps text to fixed-dimension vectors. Callers treat every failure here as
//! non-fatal: a query that cannot be embedded simply gets no image.

use anyhow::{Context, Result, bail};
use async_openai::{Client, config::OpenAIConfig, types::CreateEmbeddingRequestArgs};
use async_trait::async_trait;
use std::time::Duration;

use crate::generation::bounded;

/// Trait for embedding providers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name, used in logs.
    fn name(&self) -> &'static str;

    /// Dimension of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// Embeds a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAIEmbedding {
    client: Client<OpenAIConfig>,
    model: String,
    dims: usize,
    timeout: Duration,
}

impl OpenAIEmbedding {
    pub fn new(config: OpenAIConfig, model: String, dims: usize, timeout: Duration) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            dims,
            timeout,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedding {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            bail!("Cannot embed empty text");
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(text)
            .dimensions(self.dims as u32)
            .build()?;

        let response = bounded(self.timeout, async {
            Ok(self.client.embeddings().create(request).await?)
        })
        .await
        .context("Embedding request failed")?;
        let vector = response
            .data
            .into_iter()
            .next()
            .context("Empty embedding result")?
            .embedding;

        if vector.len() != self.dims {
            bail!(
                "Embedding has {} dimensions, expected {}",
                vector.len(),
                self.dims
            );
        }
        Ok(vector)
    }
}

/// Deterministic feature-hashing embedding for offline runs.
///
/// Lower-cased alphanumeric tokens are hashed (FNV-1a) into buckets and the
/// result is L2-normalised, so texts sharing words score high under cosine.
pub struct HashingEmbedding {
    dims: usize,
}

impl HashingEmbedding {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    fn name(&self) -> &'static str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dims];
        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        let mut seen = false;
        for token in tokens {
            seen = true;
            let hash = fnv1a(&token);
            let bucket = (hash % self.dims as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        if !seen {
            bail!("Cannot embed text without any words");
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}
