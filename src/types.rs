//! Core types for the WebUI chat SDK

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Options for configuring a [`Client`](crate::Client)
#[derive(Clone)]
pub struct ClientOptions {
    /// Server root URL (e.g., "http://localhost:3000")
    pub base_url: String,

    /// Bearer token used for every request
    pub token: String,

    /// Model used when a call does not name one
    pub default_model: String,

    /// Per-request timeout in seconds
    pub timeout: u64,

    /// Retry behavior for every request
    pub retry: RetryPolicy,

    /// Skip fetching the available model list before chatting
    pub skip_model_refresh: bool,

    /// Persist streamed content after this many fragments
    pub stream_flush_every: usize,

    /// Persist streamed content at least this often
    pub stream_flush_interval: Duration,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .field("default_model", &self.default_model)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("skip_model_refresh", &self.skip_model_refresh)
            .field("stream_flush_every", &self.stream_flush_every)
            .field("stream_flush_interval", &self.stream_flush_interval)
            .finish()
    }
}

impl ClientOptions {
    /// Create a new builder for ClientOptions
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn skip_model_refresh(&self) -> bool {
        self.skip_model_refresh
    }
}

/// Builder for ClientOptions
#[derive(Default)]
pub struct ClientOptionsBuilder {
    base_url: Option<String>,
    token: Option<String>,
    default_model: Option<String>,
    timeout: Option<u64>,
    max_retries: Option<u32>,
    retry: Option<RetryPolicy>,
    skip_model_refresh: Option<bool>,
    stream_flush_every: Option<usize>,
    stream_flush_interval: Option<Duration>,
}

impl std::fmt::Debug for ClientOptionsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptionsBuilder")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ClientOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override only the retry count of the default policy.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Replace the whole retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn skip_model_refresh(mut self, skip: bool) -> Self {
        self.skip_model_refresh = Some(skip);
        self
    }

    pub fn stream_flush_every(mut self, fragments: usize) -> Self {
        self.stream_flush_every = Some(fragments);
        self
    }

    pub fn stream_flush_interval(mut self, interval: Duration) -> Self {
        self.stream_flush_interval = Some(interval);
        self
    }

    pub fn build(self) -> crate::Result<ClientOptions> {
        let base_url = self
            .base_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| crate::Error::config("base_url is required"))?;

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(crate::Error::config(format!(
                "base_url must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let token = self
            .token
            .ok_or_else(|| crate::Error::config("token is required"))?;

        let default_model = self
            .default_model
            .filter(|model| !model.trim().is_empty())
            .ok_or_else(|| crate::Error::config("default_model is required"))?;

        let mut retry = self.retry.unwrap_or_default();
        if let Some(retries) = self.max_retries {
            retry.max_retries = retries;
        }

        Ok(ClientOptions {
            base_url,
            token,
            default_model,
            timeout: self.timeout.unwrap_or(60),
            retry,
            skip_model_refresh: self.skip_model_refresh.unwrap_or(false),
            stream_flush_every: self.stream_flush_every.unwrap_or(20).max(1),
            stream_flush_interval: self
                .stream_flush_interval
                .unwrap_or(Duration::from_secs(2)),
        })
    }
}

/// Which model(s) answer a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelector {
    /// One model answers each turn
    Single(String),
    /// Every listed model answers each turn as a sibling message
    Parallel(Vec<String>),
}

impl ModelSelector {
    /// Model ids in selection order.
    pub fn models(&self) -> Vec<String> {
        match self {
            ModelSelector::Single(model) => vec![model.clone()],
            ModelSelector::Parallel(models) => models.clone(),
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, ModelSelector::Parallel(_))
    }

    /// A selector is usable when it names at least one non-empty model id.
    pub fn is_valid(&self) -> bool {
        match self {
            ModelSelector::Single(model) => !model.trim().is_empty(),
            ModelSelector::Parallel(models) => {
                !models.is_empty() && models.iter().all(|m| !m.trim().is_empty())
            }
        }
    }
}

impl From<&str> for ModelSelector {
    fn from(model: &str) -> Self {
        ModelSelector::Single(model.to_string())
    }
}

impl From<String> for ModelSelector {
    fn from(model: String) -> Self {
        ModelSelector::Single(model)
    }
}

impl From<Vec<String>> for ModelSelector {
    fn from(models: Vec<String>) -> Self {
        ModelSelector::Parallel(models)
    }
}

impl From<&[&str]> for ModelSelector {
    fn from(models: &[&str]) -> Self {
        ModelSelector::Parallel(models.iter().map(|m| m.to_string()).collect())
    }
}

/// Per-call options for [`Client::chat`](crate::Client::chat) and
/// [`Client::stream_chat`](crate::Client::stream_chat).
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Model for this turn; the client's default model when `None`
    pub model: Option<String>,
    /// Local files uploaded and attached to the user message
    pub rag_files: Vec<PathBuf>,
    /// Knowledge base names attached to the user message
    pub knowledge_bases: Vec<String>,
    /// Server-side tool ids enabled for the completion
    pub tool_ids: Vec<String>,
}

impl ChatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn rag_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rag_files.push(path.into());
        self
    }

    pub fn knowledge_base(mut self, name: impl Into<String>) -> Self {
        self.knowledge_bases.push(name.into());
        self
    }

    pub fn tool_id(mut self, id: impl Into<String>) -> Self {
        self.tool_ids.push(id.into());
        self
    }
}

/// Result of a single-model chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant reply text
    pub response: String,
    /// Server id of the chat the turn was recorded in
    pub chat_id: String,
    /// Id of the assistant message holding the reply
    pub message_id: String,
}

/// Result of a parallel multi-model chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelChatResponse {
    /// Reply text per model; models whose completion failed are absent
    pub responses: HashMap<String, String>,
    pub chat_id: String,
}

/// Reference to an uploaded file or knowledge base attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// "file" or "collection"
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl FileRef {
    pub fn file(id: impl Into<String>) -> Self {
        Self {
            kind: "file".to_string(),
            id: id.into(),
        }
    }

    pub fn collection(id: impl Into<String>) -> Self {
        Self {
            kind: "collection".to_string(),
            id: id.into(),
        }
    }
}

/// A model advertised by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// An uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    #[serde(default)]
    pub filename: Option<String>,
}

/// A knowledge base (RAG collection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    /// Note body as stored by the server (`{"content": {"md": ...}}`)
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl Note {
    /// Markdown body of the note, if present.
    pub fn markdown(&self) -> Option<&str> {
        self.data
            .get("content")
            .and_then(|c| c.get("md"))
            .and_then(|md| md.as_str())
    }
}

/// Completion API message format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CompletionMessage {
    pub role: String,
    pub content: String,
}

impl CompletionMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Request body for `/api/chat/completions`
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CompletionRequest {
    pub model: String,
    pub messages: Vec<CompletionMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Id of the assistant message the completion fills
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_ids: Vec<String>,
}

/// Non-streaming completion response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CompletionChoice {
    pub message: CompletionMessage,
}

impl CompletionResponse {
    /// Content of the first choice.
    pub fn into_text(self) -> Option<String> {
        self.choices.into_iter().next().map(|c| c.message.content)
    }
}

/// Streaming completion chunk
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}
