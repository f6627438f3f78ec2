//! Client for the chat application's REST and streaming API.
//!
//! [`Client`] is the entry point of the SDK. It owns a [`RequestExecutor`]
//! (HTTP with retry) and a [`ChatSynchronizer`] (server-side chat state), and
//! combines them into the high-level operations:
//!
//! - [`Client::chat`] - one question, one model, buffered reply
//! - [`Client::stream_chat`] - same turn, reply streamed as text fragments
//! - [`Client::parallel_chat`] - one question answered by several models
//! - [`Client::switch_chat_model`] - change a chat's active model list
//! - [`Client::process_task`] / [`Client::stream_process_task`] - multi-step tasks
//!
//! # How a chat turn is recorded
//!
//! Chats are addressed by title. The first turn for a title finds (or
//! creates) the server-side chat; later turns reuse it. Each turn then:
//!
//! 1. appends the user message under the current leaf
//! 2. reserves an empty assistant placeholder per answering model
//! 3. requests the completion with the active branch as history
//! 4. writes the reply into the placeholder, or removes the placeholder if the
//!    completion failed
//!
//! Every write is confirmed by the server before the local copy changes, so a
//! failure at any step leaves the chat consistent.
//!
//! # Examples
//!
//! ```rust,no_run
//! use webui_chat::{ChatOptions, Client, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(
//!         ClientOptions::builder()
//!             .base_url("http://localhost:3000")
//!             .token("sk-...")
//!             .default_model("llama3")
//!             .build()?,
//!     )?;
//!
//!     let reply = client
//!         .chat("What is the capital of France?", "Geography", ChatOptions::new())
//!         .await?;
//!     println!("{}", reply.response);
//!     Ok(())
//! }
//! ```

use crate::executor::RequestExecutor;
use crate::session::{ChatMessage, ChatSession};
use crate::sync::ChatSynchronizer;
use crate::task::{TaskEventStream, TaskOptions, TaskOrchestrator, TaskResult};
use crate::types::{
    ChatOptions, ChatResponse, ClientOptions, CompletionMessage, CompletionRequest,
    CompletionResponse, FileRef, ModelInfo, ModelSelector, ParallelChatResponse,
};
use crate::utils::{DeltaCoalescer, TextStream, parse_sse_stream};
use crate::{Error, Result};
use futures::StreamExt;
use futures::future::join_all;
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const COMPLETIONS_ENDPOINT: &str = "/api/chat/completions";

/// Chat API client.
///
/// Cheap to clone; clones share the HTTP connection pool, the chat title
/// index and the model cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    sync: ChatSynchronizer,
    /// Model ids from the last successful refresh
    available_models: Mutex<Option<Vec<String>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.inner.options)
            .finish()
    }
}

/// What a completion request sees as conversation history.
#[derive(Debug, Clone)]
pub(crate) enum History {
    /// The chat's active branch as stored on the server
    Branch,
    /// Caller-supplied messages; the server-side branch is ignored
    Detached(Vec<CompletionMessage>),
}

/// A recorded user turn whose assistant reply is pending.
struct PreparedTurn {
    message_id: String,
    request: CompletionRequest,
}

impl Client {
    /// Creates a client. No request is sent until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let executor = RequestExecutor::new(&options)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                sync: ChatSynchronizer::new(executor),
                options,
                available_models: Mutex::new(None),
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Low-level access to chat state synchronization.
    pub fn synchronizer(&self) -> &ChatSynchronizer {
        &self.inner.sync
    }

    pub(crate) fn executor(&self) -> &RequestExecutor {
        self.inner.sync.executor()
    }

    /// Asks one model one question inside the chat titled `chat_title`.
    ///
    /// # Errors
    ///
    /// - [`Error::State`] if the chat cannot be found, created or updated
    /// - any error from uploading `rag_files` or from the completion request;
    ///   the reserved placeholder is removed before returning
    pub async fn chat(
        &self,
        question: &str,
        chat_title: &str,
        options: ChatOptions,
    ) -> Result<ChatResponse> {
        let model = self.model_for(&options);
        let files = self.resolve_attachments(&options).await?;
        let mut session = self
            .open_session(chat_title, &ModelSelector::Single(model.clone()))
            .await?;

        self.run_turn(
            &mut session,
            question,
            &model,
            History::Branch,
            &files,
            &options.tool_ids,
        )
        .await
    }

    /// Like [`chat`](Self::chat), but yields the reply as it is generated.
    ///
    /// The returned stream is finite and single-pass. The reply is written to
    /// the chat in batches while streaming (see
    /// [`ClientOptions::stream_flush_every`]) and finalized when the stream
    /// ends. A stream that fails midway keeps the text received so far; a
    /// stream that produced nothing has its placeholder removed. A stream
    /// dropped before its end leaves the reply unfinished until the next turn
    /// on that chat closes it.
    ///
    /// Setup failures (chat lookup, upload, rejected request) are returned
    /// before any fragment is produced.
    pub async fn stream_chat(
        &self,
        question: &str,
        chat_title: &str,
        options: ChatOptions,
    ) -> Result<TextStream> {
        let model = self.model_for(&options);
        let files = self.resolve_attachments(&options).await?;
        let mut session = self
            .open_session(chat_title, &ModelSelector::Single(model.clone()))
            .await?;

        let (mut writer, mut fragments) = self
            .start_stream_turn(
                &mut session,
                question,
                &model,
                History::Branch,
                &files,
                &options.tool_ids,
            )
            .await?;

        let client = self.clone();
        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = fragments.next().await {
                match item {
                    Ok(fragment) => {
                        writer.push(client.synchronizer(), &mut session, &fragment).await;
                        yield Ok(fragment);
                    }
                    Err(e) => {
                        log::warn!("Stream for chat {} failed: {}", session.id, e);
                        writer.finish(client.synchronizer(), &mut session).await;
                        yield Err(e);
                        return;
                    }
                }
            }
            writer.finish(client.synchronizer(), &mut session).await;
        }))
    }

    /// Asks several models the same question in one turn.
    ///
    /// Each model answers into its own sibling placeholder; completions run
    /// concurrently. Models whose completion fails are absent from
    /// [`ParallelChatResponse::responses`] and their placeholders are removed.
    /// Unknown model ids are skipped unless `skip_model_refresh` is set.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if no usable model remains
    /// - [`Error::State`] if the chat cannot be prepared
    /// - the last completion error if every model failed
    pub async fn parallel_chat<I, S>(
        &self,
        question: &str,
        chat_title: &str,
        model_ids: I,
    ) -> Result<ParallelChatResponse>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested: Vec<String> = model_ids.into_iter().map(Into::into).collect();
        let models = self.resolve_models(requested).await;
        if models.is_empty() {
            return Err(Error::invalid_input("parallel_chat needs at least one available model"));
        }

        let mut session = self
            .open_session(chat_title, &ModelSelector::Parallel(models.clone()))
            .await?;

        let user = ChatMessage::user(question, session.current_id().map(str::to_string))
            .with_models(models.clone());
        let user_id = self
            .inner
            .sync
            .append(&mut session, user)
            .await
            .ok_or_else(|| Error::state(format!("failed to record question in chat {}", session.id)))?;

        let slots = self
            .inner
            .sync
            .ensure_placeholder_messages(&mut session, &models)
            .await
            .ok_or_else(|| {
                Error::state(format!("failed to reserve replies in chat {}", session.id))
            })?;

        let history = session.completion_messages();
        let jobs: Vec<(String, String, CompletionRequest)> = models
            .iter()
            .filter_map(|model| {
                let message_id = slots.get(model)?.clone();
                let request = CompletionRequest {
                    model: model.clone(),
                    messages: history.clone(),
                    stream: false,
                    chat_id: Some(session.id.clone()),
                    id: Some(message_id.clone()),
                    parent_id: Some(user_id.clone()),
                    files: Vec::new(),
                    tool_ids: Vec::new(),
                };
                Some((model.clone(), message_id, request))
            })
            .collect();

        log::debug!(
            "Running {} parallel completions in chat {}",
            jobs.len(),
            session.id
        );
        let outcomes = join_all(jobs.iter().map(|(model, message_id, request)| async move {
            (model, message_id, self.complete(request).await)
        }))
        .await;

        let mut responses = HashMap::new();
        let mut filled = Vec::new();
        let mut last_error = None;
        for (model, message_id, outcome) in outcomes {
            match outcome {
                Ok(text) => {
                    filled.push((message_id.clone(), text.clone()));
                    responses.insert(model.clone(), text);
                }
                Err(e) => {
                    log::warn!("Model {} failed in chat {}: {}", model, session.id, e);
                    last_error = Some(e);
                }
            }
        }

        if !self.inner.sync.fill_placeholders(&mut session, &filled).await {
            log::warn!("Parallel replies were not persisted to chat {}", session.id);
        }

        match last_error {
            Some(e) if responses.is_empty() => Err(e),
            _ => Ok(ParallelChatResponse {
                responses,
                chat_id: session.id,
            }),
        }
    }

    /// Sets the active model(s) of an existing chat.
    ///
    /// Returns false if the chat cannot be loaded or the update is rejected.
    pub async fn switch_chat_model(&self, chat_id: &str, selector: impl Into<ModelSelector>) -> bool {
        let selector = selector.into();
        let Some(mut session) = self.inner.sync.load_chat(chat_id).await else {
            return false;
        };
        self.inner.sync.switch_model(&mut session, &selector).await
    }

    /// Fetches a chat with its full message tree.
    pub async fn get_chat(&self, chat_id: &str) -> Result<ChatSession> {
        self.inner.sync.fetch_chat(chat_id).await
    }

    /// Deletes a chat. Returns false if the server rejected the request.
    pub async fn delete_chat(&self, chat_id: &str) -> bool {
        self.inner.sync.delete_chat(chat_id).await
    }

    /// Runs a multi-step task to completion. See [`TaskOrchestrator`].
    pub async fn process_task(&self, options: TaskOptions) -> Result<TaskResult> {
        TaskOrchestrator::new(self.clone(), options).run().await
    }

    /// Runs a multi-step task, reporting progress as [`TaskEvent`](crate::TaskEvent)s.
    pub fn stream_process_task(&self, options: TaskOptions) -> TaskEventStream {
        TaskOrchestrator::new(self.clone(), options).stream()
    }

    /// Lists the models the server offers.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let value = self.executor().execute(Method::GET, "/api/models", None).await?;
        let list = match value {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        if list.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(list)?)
    }

    /// Refreshes the cached list of available model ids.
    pub async fn refresh_available_models(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = self.list_models().await?.into_iter().map(|m| m.id).collect();
        log::debug!("Server offers {} models", ids.len());
        if let Ok(mut cache) = self.inner.available_models.lock() {
            *cache = Some(ids.clone());
        }
        Ok(ids)
    }

    /// Model ids from the last refresh, if any.
    pub fn available_models(&self) -> Option<Vec<String>> {
        self.inner
            .available_models
            .lock()
            .ok()
            .and_then(|cache| cache.clone())
    }

    fn model_for(&self, options: &ChatOptions) -> String {
        options
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.inner.options.default_model().to_string())
    }

    /// Drops duplicate and unknown model ids, keeping request order.
    async fn resolve_models(&self, requested: Vec<String>) -> Vec<String> {
        let mut models: Vec<String> = Vec::new();
        for model in requested {
            if !model.trim().is_empty() && !models.contains(&model) {
                models.push(model);
            }
        }
        if self.inner.options.skip_model_refresh() {
            return models;
        }

        let known = match self.available_models() {
            Some(known) => known,
            None => match self.refresh_available_models().await {
                Ok(known) => known,
                Err(e) => {
                    log::warn!("Could not refresh model list, using models as given: {}", e);
                    return models;
                }
            },
        };
        if known.is_empty() {
            return models;
        }

        models
            .into_iter()
            .filter(|model| {
                let ok = known.contains(model);
                if !ok {
                    log::warn!("Model {} is not available on the server; skipping", model);
                }
                ok
            })
            .collect()
    }

    /// Uploads RAG files and resolves knowledge base names into attachments.
    pub(crate) async fn resolve_attachments(&self, options: &ChatOptions) -> Result<Vec<FileRef>> {
        let mut files = Vec::new();
        for path in &options.rag_files {
            let info = self.upload_file(path).await?;
            files.push(FileRef::file(info.id));
        }
        files.extend(self.knowledge_base_refs(&options.knowledge_bases).await?);
        Ok(files)
    }

    pub(crate) async fn knowledge_base_refs(&self, names: &[String]) -> Result<Vec<FileRef>> {
        let mut refs = Vec::new();
        for name in names {
            match self.get_knowledge_base_by_name(name).await? {
                Some(kb) => refs.push(FileRef::collection(kb.id)),
                None => log::warn!("Knowledge base '{}' not found; not attaching it", name),
            }
        }
        Ok(refs)
    }

    /// Finds or creates the chat, clears stale placeholders and applies the
    /// requested models.
    pub(crate) async fn open_session(
        &self,
        chat_title: &str,
        selector: &ModelSelector,
    ) -> Result<ChatSession> {
        let models = selector.models();
        let default_model = models
            .first()
            .map(String::as_str)
            .unwrap_or(self.inner.options.default_model());

        let sync = &self.inner.sync;
        let mut session = sync
            .find_or_create_chat(chat_title, default_model)
            .await
            .ok_or_else(|| Error::state(format!("could not find or create chat '{}'", chat_title)))?;

        if !sync.cleanup_unused_placeholder_messages(&mut session).await {
            log::warn!("Stale placeholders remain in chat {}", session.id);
        }
        if session.models != models && !sync.switch_model(&mut session, selector).await {
            log::warn!("Chat {} keeps models {:?}", session.id, session.models);
        }
        Ok(session)
    }

    /// Records the user message and one placeholder, and builds the request
    /// that fills the placeholder.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_turn(
        &self,
        session: &mut ChatSession,
        prompt: &str,
        model: &str,
        history: History,
        files: &[FileRef],
        tool_ids: &[String],
        stream: bool,
    ) -> Result<PreparedTurn> {
        let sync = &self.inner.sync;
        let user = ChatMessage::user(prompt, session.current_id().map(str::to_string))
            .with_models(vec![model.to_string()])
            .with_files(files.to_vec());
        let user_id = sync
            .append(session, user)
            .await
            .ok_or_else(|| Error::state(format!("failed to record question in chat {}", session.id)))?;

        let message_id = sync
            .ensure_placeholder_messages(session, &[model.to_string()])
            .await
            .and_then(|mut slots| slots.remove(model))
            .ok_or_else(|| Error::state(format!("failed to reserve a reply in chat {}", session.id)))?;

        let messages = match history {
            History::Branch => session.completion_messages(),
            History::Detached(mut messages) => {
                messages.push(CompletionMessage::new("user", prompt));
                messages
            }
        };

        Ok(PreparedTurn {
            request: CompletionRequest {
                model: model.to_string(),
                messages,
                stream,
                chat_id: Some(session.id.clone()),
                id: Some(message_id.clone()),
                parent_id: Some(user_id),
                files: files.to_vec(),
                tool_ids: tool_ids.to_vec(),
            },
            message_id,
        })
    }

    /// One buffered turn: record, complete, then write the whole reply at once.
    pub(crate) async fn run_turn(
        &self,
        session: &mut ChatSession,
        prompt: &str,
        model: &str,
        history: History,
        files: &[FileRef],
        tool_ids: &[String],
    ) -> Result<ChatResponse> {
        let turn = self
            .prepare_turn(session, prompt, model, history, files, tool_ids, false)
            .await?;
        let sync = &self.inner.sync;

        match self.complete(&turn.request).await {
            Ok(text) => {
                if !sync.apply_delta(session, &turn.message_id, &text, true).await {
                    log::warn!(
                        "Reply {} was not persisted to chat {}",
                        turn.message_id,
                        session.id
                    );
                }
                Ok(ChatResponse {
                    response: text,
                    chat_id: session.id.clone(),
                    message_id: turn.message_id,
                })
            }
            Err(e) => {
                sync.cleanup_unused_placeholder_messages(session).await;
                Err(e)
            }
        }
    }

    /// Records a turn and opens the streaming completion for it.
    pub(crate) async fn start_stream_turn(
        &self,
        session: &mut ChatSession,
        prompt: &str,
        model: &str,
        history: History,
        files: &[FileRef],
        tool_ids: &[String],
    ) -> Result<(ReplyWriter, TextStream)> {
        let turn = self
            .prepare_turn(session, prompt, model, history, files, tool_ids, true)
            .await?;

        let opened = match serde_json::to_value(&turn.request) {
            Ok(payload) => self.executor().execute_stream(COMPLETIONS_ENDPOINT, &payload).await,
            Err(e) => Err(e.into()),
        };

        match opened {
            Ok(response) => Ok((
                ReplyWriter::new(turn.message_id, &self.inner.options),
                parse_sse_stream(response),
            )),
            Err(e) => {
                self.inner
                    .sync
                    .cleanup_unused_placeholder_messages(session)
                    .await;
                Err(e)
            }
        }
    }

    /// Sends a non-streaming completion request and returns the reply text.
    pub(crate) async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let payload = serde_json::to_value(request)?;
        let value = self
            .executor()
            .execute(Method::POST, COMPLETIONS_ENDPOINT, Some(&payload))
            .await?;
        let response: CompletionResponse = serde_json::from_value(value)?;
        response
            .into_text()
            .ok_or_else(|| Error::other(format!("model {} returned no choices", request.model)))
    }

    /// A completion that is not recorded in any chat.
    pub(crate) async fn complete_detached(
        &self,
        model: &str,
        messages: Vec<CompletionMessage>,
    ) -> Result<String> {
        self.complete(&CompletionRequest {
            model: model.to_string(),
            messages,
            stream: false,
            chat_id: None,
            id: None,
            parent_id: None,
            files: Vec::new(),
            tool_ids: Vec::new(),
        })
        .await
    }
}

/// Writes a streamed reply into its placeholder in coalesced batches.
pub(crate) struct ReplyWriter {
    message_id: String,
    coalescer: DeltaCoalescer,
    text: String,
}

impl ReplyWriter {
    fn new(message_id: String, options: &ClientOptions) -> Self {
        Self {
            message_id,
            coalescer: DeltaCoalescer::new(options.stream_flush_every, options.stream_flush_interval),
            text: String::new(),
        }
    }

    /// Buffers a fragment, persisting when a batch is due.
    pub(crate) async fn push(
        &mut self,
        sync: &ChatSynchronizer,
        session: &mut ChatSession,
        fragment: &str,
    ) {
        self.text.push_str(fragment);
        if self.coalescer.push(fragment) {
            self.flush(sync, session, false).await;
        }
    }

    async fn flush(&mut self, sync: &ChatSynchronizer, session: &mut ChatSession, finished: bool) -> bool {
        let pending = self.coalescer.take();
        if pending.is_empty() && !finished {
            return true;
        }
        if sync
            .apply_delta(session, &self.message_id, &pending, finished)
            .await
        {
            true
        } else {
            self.coalescer.put_back(&pending);
            false
        }
    }

    /// Persists the remaining text and marks the reply done, or removes the
    /// placeholder when nothing arrived. Returns the full reply text.
    pub(crate) async fn finish(&mut self, sync: &ChatSynchronizer, session: &mut ChatSession) -> String {
        if self.text.is_empty() {
            sync.cleanup_unused_placeholder_messages(session).await;
        } else if !self.flush(sync, session, true).await {
            log::warn!(
                "Reply {} was not fully persisted to chat {}",
                self.message_id,
                session.id
            );
        }
        std::mem::take(&mut self.text)
    }
}
