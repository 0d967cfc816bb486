//! Generation Service Collaborators
//!
//! This module defines the contract the tutor relies on for language generation:
//! one-shot completions (lesson plans, image annotation) and stateful dialogues
//! that keep every prior prompt and reply in scope for the next call.

use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::prompts::Prompts;

/// A stateful conversation with the generation service.
///
/// Every `send` sees the prompts and replies of all earlier sends on the same
/// dialogue.
#[async_trait]
pub trait Dialogue: Send {
    /// Sends a prompt and returns the raw text reply.
    async fn send(&mut self, prompt: &str) -> Result<String>;
}

/// Defines the contract for any service that can generate tutoring content.
///
/// This abstraction allows the tutor to swap between an OpenAI-compatible
/// backend and a deterministic offline implementation.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Generates a raw lesson plan for a topic, one candidate part per line.
    async fn generate_plan(&self, topic: &str) -> Result<String>;

    /// Runs a single stateless completion.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Opens a fresh dialogue context.
    fn open_dialogue(&self) -> Box<dyn Dialogue>;
}

/// Awaits a remote call for at most `limit`, turning a stall into an error.
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .with_context(|| format!("No response within {}ms", limit.as_millis()))?
}

/// An implementation of `GenerationService` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
    prompts: Prompts,
    timeout: Duration,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o").
    /// * `prompts` - Templates used to phrase the plan request.
    /// * `timeout` - Upper bound for every chat call, retries included.
    pub fn new(config: OpenAIConfig, model: String, prompts: Prompts, timeout: Duration) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            prompts,
            timeout,
        }
    }
}

/// Sends a message list to the chat endpoint and extracts the first choice's text.
async fn chat(
    client: &Client<OpenAIConfig>,
    model: &str,
    timeout: Duration,
    messages: Vec<ChatCompletionRequestMessage>,
) -> Result<String> {
    let request = CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(messages)
        .build()?;

    let response = bounded(timeout, async {
        Ok(client.chat().create(request).await?)
    })
    .await
    .context("Chat completion failed")?;

    let answer = response
        .choices
        .first()
        .context("No response choice from LLM")?
        .message
        .content
        .as_ref()
        .context("No content in LLM response")?;

    Ok(answer.clone())
}

#[async_trait]
impl GenerationService for OpenAICompatibleClient {
    async fn generate_plan(&self, topic: &str) -> Result<String> {
        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content("You are a helpful assistant that generates curriculum.")
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(self.prompts.generate_plan(topic))
                .build()?
                .into(),
        ];
        chat(&self.client, &self.model, self.timeout, messages).await
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let messages = vec![
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()?
                .into(),
        ];
        chat(&self.client, &self.model, self.timeout, messages).await
    }

    fn open_dialogue(&self) -> Box<dyn Dialogue> {
        Box::new(OpenAIDialogue {
            client: self.client.clone(),
            model: self.model.clone(),
            timeout: self.timeout,
            messages: Vec::new(),
        })
    }
}

/// A dialogue that replays the accumulated message list on every call.
pub struct OpenAIDialogue {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    messages: Vec<ChatCompletionRequestMessage>,
}

#[async_trait]
impl Dialogue for OpenAIDialogue {
    async fn send(&mut self, prompt: &str) -> Result<String> {
        self.messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()?
                .into(),
        );

        let reply = match chat(&self.client, &self.model, self.timeout, self.messages.clone()).await {
            Ok(reply) => reply,
            Err(e) => {
                // Keep the context free of prompts that never got an answer.
                self.messages.pop();
                return Err(e);
            }
        };

        self.messages.push(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(reply.clone())
                .build()?
                .into(),
        );
        debug!(turns = self.messages.len(), "Dialogue advanced");
        Ok(reply)
    }
}

/// A mock `GenerationService` for development and integration testing.
///
/// This implementation provides predictable, deterministic output, which is
/// useful for running the tutor without external dependencies or API costs.
pub struct MockGenerationService;

#[async_trait]
impl GenerationService for MockGenerationService {
    /// Generates a standard 4-part plan for any given topic.
    async fn generate_plan(&self, topic: &str) -> Result<String> {
        Ok(format!(
            "1. Introduction to {topic}\n2. Core Concepts\n3. Practical Applications\n4. Next Steps"
        ))
    }

    /// Echoes the explanation embedded in the prompt back unchanged.
    async fn complete(&self, prompt: &str) -> Result<String> {
        Ok(prompt
            .split_once("\"\"\"")
            .and_then(|(_, rest)| rest.rsplit_once("\"\"\""))
            .map(|(body, _)| body.to_string())
            .unwrap_or_default())
    }

    fn open_dialogue(&self) -> Box<dyn Dialogue> {
        Box::new(MockDialogue { sent: 0 })
    }
}

/// Dialogue half of [`MockGenerationService`].
pub struct MockDialogue {
    sent: usize,
}

#[async_trait]
impl Dialogue for MockDialogue {
    async fn send(&mut self, prompt: &str) -> Result<String> {
        self.sent += 1;
        let first_line = prompt.lines().next().unwrap_or_default();
        Ok(format!(
            "(reply {}) Let's work through this together. {first_line}",
            self.sent
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_plan_has_four_numbered_parts() {
        let plan = MockGenerationService.generate_plan("Rust").await.unwrap();
        let lines: Vec<&str> = plan.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "1. Introduction to Rust");
    }

    #[tokio::test]
    async fn test_mock_complete_echoes_quoted_explanation() {
        let prompt = Prompts::default().annotate_images("Cells divide.\nThen they grow.");
        let echoed = MockGenerationService.complete(&prompt).await.unwrap();
        assert_eq!(echoed, "Cells divide.\nThen they grow.");
    }

    /// Accepts connections and never answers.
    async fn silent_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}/v1")
    }

    #[tokio::test]
    async fn test_stalled_service_fails_within_timeout() {
        let config = OpenAIConfig::new()
            .with_api_key("test-key")
            .with_api_base(silent_endpoint().await);
        let client = OpenAICompatibleClient::new(
            config,
            "gpt-4o".to_string(),
            Prompts::default(),
            Duration::from_millis(200),
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), client.complete("hello")).await;
        assert!(matches!(outcome, Ok(Err(_))));

        let mut dialogue = client.open_dialogue();
        let outcome = tokio::time::timeout(Duration::from_secs(5), dialogue.send("hello")).await;
        assert!(matches!(outcome, Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_mock_dialogue_counts_turns() {
        let mut dialogue = MockGenerationService.open_dialogue();
        let first = dialogue.send("Explain cells").await.unwrap();
        let second = dialogue.send("What is a nucleus?").await.unwrap();
        assert!(first.starts_with("(reply 1)"));
        assert!(second.starts_with("(reply 2)"));
    }
}
