//! Keeps local [`ChatSession`] values in step with the server's chat store.
//!
//! The server is the source of truth. Every mutation here follows the same
//! sequence:
//!
//! 1. clone the caller's session
//! 2. apply the change to the clone (tree invariants are checked here)
//! 3. send the clone to the server
//! 4. replace the caller's session with the clone only if the server accepted it
//!
//! So a rejected or failed write leaves the local session exactly as the
//! server last saw it. Failures are logged and reported as `None` / `false`;
//! nothing in this module panics or propagates transport errors, leaving the
//! caller free to pick a fallback.

use crate::executor::RequestExecutor;
use crate::session::{ChatMessage, ChatRecord, ChatSession, MessageRole, MessageTree};
use crate::types::ModelSelector;
use crate::{Error, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

/// Search result entry
#[derive(Debug, Deserialize)]
struct ChatSummary {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    updated_at: Option<i64>,
}

/// Finds, loads and mutates server-side chats.
#[derive(Debug)]
pub struct ChatSynchronizer {
    executor: RequestExecutor,
    /// Title → chat id, filled by lookups made in this process
    title_index: Mutex<HashMap<String, String>>,
}

impl ChatSynchronizer {
    pub fn new(executor: RequestExecutor) -> Self {
        Self {
            executor,
            title_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Chat id cached for `title`, if this process has seen it.
    pub fn cached_chat_id(&self, title: &str) -> Option<String> {
        self.title_index
            .lock()
            .ok()
            .and_then(|index| index.get(title).cloned())
    }

    fn remember(&self, title: &str, chat_id: &str) {
        if let Ok(mut index) = self.title_index.lock() {
            index.insert(title.to_string(), chat_id.to_string());
        }
    }

    fn forget(&self, chat_id: &str) {
        if let Ok(mut index) = self.title_index.lock() {
            index.retain(|_, id| id != chat_id);
        }
    }

    /// Returns the chat titled `title`, creating it when none exists.
    ///
    /// Lookup order: titles resolved earlier in this process, then an exact
    /// title match from the server search (the most recently updated chat
    /// wins), then a new chat with `default_model` and an empty history.
    /// Repeated calls with the same title never create a second chat.
    pub async fn find_or_create_chat(
        &self,
        title: &str,
        default_model: &str,
    ) -> Option<ChatSession> {
        if title.trim().is_empty() {
            log::warn!("Refusing to look up a chat with an empty title");
            return None;
        }

        if let Some(chat_id) = self.cached_chat_id(title) {
            match self.fetch_chat(&chat_id).await {
                Ok(session) => return Some(session),
                Err(e) => {
                    log::warn!("Cached chat {} for '{}' is unavailable: {}", chat_id, title, e);
                    self.forget(&chat_id);
                }
            }
        }

        let found = match self.search_by_title(title).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Chat search for '{}' failed: {}", title, e);
                return None;
            }
        };

        let chat_id = match found {
            Some(chat_id) => {
                log::debug!("Found existing chat {} for '{}'", chat_id, title);
                chat_id
            }
            None => match self.create_chat(title, default_model).await {
                Ok(chat_id) => {
                    log::info!("Created chat {} for '{}'", chat_id, title);
                    chat_id
                }
                Err(e) => {
                    log::warn!("Failed to create chat '{}': {}", title, e);
                    return None;
                }
            },
        };

        self.remember(title, &chat_id);
        self.load_chat(&chat_id).await
    }

    /// Fetches the full chat detail.
    pub async fn load_chat(&self, chat_id: &str) -> Option<ChatSession> {
        match self.fetch_chat(chat_id).await {
            Ok(session) => Some(session),
            Err(e) => {
                log::warn!("Failed to load chat {}: {}", chat_id, e);
                None
            }
        }
    }

    pub(crate) async fn fetch_chat(&self, chat_id: &str) -> Result<ChatSession> {
        let value = self
            .executor
            .execute(Method::GET, &format!("/api/v1/chats/{}", chat_id), None)
            .await?;
        if value.is_null() {
            return Err(Error::state(format!("chat {} not found", chat_id)));
        }
        let record: ChatRecord = serde_json::from_value(value)?;
        Ok(ChatSession::from_record(record))
    }

    async fn search_by_title(&self, title: &str) -> Result<Option<String>> {
        let value = self
            .executor
            .execute_query("/api/v1/chats/search", &[("text", title)])
            .await?;

        let summaries: Vec<ChatSummary> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            Vec::new()
        };

        Ok(summaries
            .into_iter()
            .filter(|chat| chat.title == title)
            .max_by_key(|chat| chat.updated_at.unwrap_or_default())
            .map(|chat| chat.id))
    }

    async fn create_chat(&self, title: &str, default_model: &str) -> Result<String> {
        let payload = json!({
            "chat": {
                "title": title,
                "models": [default_model],
                "history": MessageTree::new(),
                "messages": [],
            }
        });
        let value = self
            .executor
            .execute(Method::POST, "/api/v1/chats/new", Some(&payload))
            .await?;

        value
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::other("chat create response has no id"))
    }

    async fn persist(&self, session: &ChatSession) -> Result<()> {
        let payload = session.to_payload()?;
        self.executor
            .execute(
                Method::POST,
                &format!("/api/v1/chats/{}", session.id),
                Some(&payload),
            )
            .await?;
        Ok(())
    }

    /// Stages `mutate` on a copy of `session`, persists it and commits locally
    /// only after the server accepted the write.
    async fn commit<T, F>(&self, session: &mut ChatSession, what: &str, mutate: F) -> Option<T>
    where
        F: FnOnce(&mut ChatSession) -> Result<T>,
    {
        let mut staged = session.clone();
        let output = match mutate(&mut staged) {
            Ok(output) => output,
            Err(e) => {
                log::warn!("Cannot {} in chat {}: {}", what, session.id, e);
                return None;
            }
        };

        match self.persist(&staged).await {
            Ok(()) => {
                *session = staged;
                Some(output)
            }
            Err(e) => {
                log::warn!("Failed to {} in chat {}: {}", what, session.id, e);
                None
            }
        }
    }

    /// Adds `message` to the tree, makes it the current leaf and persists.
    pub async fn append(&self, session: &mut ChatSession, message: ChatMessage) -> Option<String> {
        self.commit(session, "append message", move |staged| {
            let id = message.id.clone();
            staged.tree.insert(message)?;
            staged.tree.set_current(&id)?;
            Ok(id)
        })
        .await
    }

    /// Appends a message under `parent_id` (the current leaf by default).
    pub async fn append_message(
        &self,
        session: &mut ChatSession,
        role: MessageRole,
        content: &str,
        parent_id: Option<&str>,
    ) -> Option<String> {
        let parent = parent_id
            .map(str::to_string)
            .or_else(|| session.current_id().map(str::to_string));
        self.append(session, ChatMessage::new(role, content, parent))
            .await
    }

    /// Reserves one assistant slot per model as siblings under the current leaf.
    ///
    /// All placeholders are written in a single update before any completion
    /// starts. The first model's placeholder becomes the current leaf.
    pub async fn ensure_placeholder_messages(
        &self,
        session: &mut ChatSession,
        model_ids: &[String],
    ) -> Option<HashMap<String, String>> {
        if model_ids.is_empty() {
            log::warn!("No models given for placeholders in chat {}", session.id);
            return None;
        }

        self.commit(session, "add placeholders", |staged| {
            let parent = staged.current_id().map(str::to_string);
            let mut slots = HashMap::new();
            let mut first = None;

            for model in model_ids {
                if slots.contains_key(model) {
                    continue;
                }
                let placeholder = ChatMessage::placeholder(parent.clone(), model.clone());
                let id = placeholder.id.clone();
                staged.tree.insert(placeholder)?;
                first.get_or_insert_with(|| id.clone());
                slots.insert(model.clone(), id);
            }

            if let Some(first) = first {
                staged.tree.set_current(&first)?;
            }
            Ok(slots)
        })
        .await
    }

    /// Writes final content into placeholders and drops every other
    /// placeholder leaf, in one update.
    ///
    /// `filled` maps placeholder ids to their completed text. The first filled
    /// message becomes the current leaf.
    pub async fn fill_placeholders(
        &self,
        session: &mut ChatSession,
        filled: &[(String, String)],
    ) -> bool {
        let stale: Vec<String> = session
            .tree
            .placeholder_ids()
            .into_iter()
            .filter(|id| !filled.iter().any(|(filled_id, _)| filled_id == id))
            .collect();
        if filled.is_empty() && stale.is_empty() {
            return true;
        }

        self.commit(session, "finalize placeholders", |staged| {
            for (id, content) in filled {
                staged.tree.append_content(id, content)?;
                staged.tree.mark_done(id)?;
            }
            for id in &stale {
                staged.tree.remove_leaf(id)?;
            }
            if let Some((first, _)) = filled.first() {
                staged.tree.set_current(first)?;
            }
            Ok(())
        })
        .await
        .is_some()
    }

    /// Reconciles assistant replies left unfinished by failed or cancelled
    /// completions, in one write.
    ///
    /// Placeholders that never received content are removed. Replies holding
    /// part of their text keep it and are marked done. Returns true when
    /// nothing needed reconciling or the write was accepted.
    pub async fn cleanup_unused_placeholder_messages(&self, session: &mut ChatSession) -> bool {
        let stale = session.tree.placeholder_ids();
        let interrupted = session.tree.interrupted_reply_ids();
        if stale.is_empty() && interrupted.is_empty() {
            return true;
        }
        log::debug!(
            "Removing {} unused placeholder(s) and closing {} interrupted reply(s) in chat {}",
            stale.len(),
            interrupted.len(),
            session.id
        );

        self.commit(session, "clean up placeholders", |staged| {
            for id in &interrupted {
                staged.tree.mark_done(id)?;
            }
            for id in &stale {
                staged.tree.remove_leaf(id)?;
            }
            Ok(())
        })
        .await
        .is_some()
    }

    /// Replaces the chat's active model list. History is left untouched.
    pub async fn switch_model(&self, session: &mut ChatSession, selector: &ModelSelector) -> bool {
        if !selector.is_valid() {
            log::warn!("Invalid model selection {:?} for chat {}", selector, session.id);
            return false;
        }

        let models = selector.models();
        self.commit(session, "switch model", move |staged| {
            staged.models = models;
            Ok(())
        })
        .await
        .is_some()
    }

    /// Appends a fragment to an assistant message and persists it.
    ///
    /// `finished` marks the message done, which also stops it from counting
    /// as a placeholder.
    pub async fn apply_delta(
        &self,
        session: &mut ChatSession,
        message_id: &str,
        fragment: &str,
        finished: bool,
    ) -> bool {
        self.commit(session, "apply delta", |staged| {
            match staged.tree.get(message_id) {
                Some(message) if message.role == MessageRole::Assistant => {}
                Some(_) => {
                    return Err(Error::state(format!(
                        "message {} is not an assistant message",
                        message_id
                    )));
                }
                None => {
                    return Err(Error::state(format!("message {} is missing", message_id)));
                }
            }
            staged.tree.append_content(message_id, fragment)?;
            if finished {
                staged.tree.mark_done(message_id)?;
            }
            Ok(())
        })
        .await
        .is_some()
    }

    /// Deletes a chat on the server and forgets its title.
    pub async fn delete_chat(&self, chat_id: &str) -> bool {
        match self
            .executor
            .execute(Method::DELETE, &format!("/api/v1/chats/{}", chat_id), None)
            .await
        {
            Ok(_) => {
                self.forget(chat_id);
                true
            }
            Err(e) => {
                log::warn!("Failed to delete chat {}: {}", chat_id, e);
                false
            }
        }
    }
}
