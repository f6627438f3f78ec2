//! Local view of a server-side chat.
//!
//! A chat's history is a tree: regenerating a reply or answering one turn with
//! several models creates sibling messages under the same parent. The tree is
//! stored as an arena keyed by message id plus a separate `current_id` that
//! names the active leaf. The active *branch* (root → current leaf) is what a
//! completion request sees as conversation history.
//!
//! All mutations check the tree invariants before touching anything:
//!
//! - every non-root message points at a parent that exists
//! - message ids are unique
//! - `current_id` is `None` only for an empty tree, otherwise it resolves
//! - only leaves can be removed
//!
//! Because a new node can only hang off an existing node and ids never repeat,
//! the tree cannot become cyclic through this API.

use crate::context::ConversationTurn;
use crate::types::{CompletionMessage, FileRef};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};

/// Role of a chat message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One node of the chat tree, in the server's storage format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    #[serde(rename = "childrenIds", default)]
    pub children_ids: Vec<String>,
    pub role: MessageRole,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
    /// Model that produced an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Models a user message was addressed to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
    /// False while an assistant reply is still being written
    #[serde(default = "default_done")]
    pub done: bool,
    /// Server-side fields this client does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_done() -> bool {
    true
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatMessage {
    /// A finished message with a fresh id and the current timestamp.
    pub fn new(role: MessageRole, content: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            children_ids: Vec::new(),
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp(),
            model: None,
            models: Vec::new(),
            files: Vec::new(),
            done: true,
            extra: Map::new(),
        }
    }

    /// A finished user message.
    pub fn user(content: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::new(MessageRole::User, content, parent_id)
    }

    /// A finished assistant message.
    pub fn assistant(
        content: impl Into<String>,
        parent_id: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(MessageRole::Assistant, content, parent_id);
        message.model = Some(model.into());
        message
    }

    /// An empty assistant slot reserved for a completion that has not arrived.
    pub fn placeholder(parent_id: Option<String>, model: impl Into<String>) -> Self {
        let mut message = Self::assistant("", parent_id, model);
        message.done = false;
        message
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.files = files;
        self
    }

    /// An assistant reply that never received content.
    pub fn is_placeholder(&self) -> bool {
        self.role == MessageRole::Assistant && !self.done && self.content.is_empty()
    }
}

/// Arena of chat messages with an active-leaf pointer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTree {
    #[serde(default)]
    messages: HashMap<String, ChatMessage>,
    #[serde(rename = "currentId", default)]
    current_id: Option<String>,
}

impl MessageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.values()
    }

    /// Children of `id`, in insertion order.
    pub fn children(&self, id: &str) -> Vec<&ChatMessage> {
        self.messages
            .get(id)
            .map(|m| {
                m.children_ids
                    .iter()
                    .filter_map(|child| self.messages.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Adds `message` under its `parent_id`. Does not move `current_id`,
    /// except on an empty tree where the first message becomes current.
    pub fn insert(&mut self, message: ChatMessage) -> Result<()> {
        if self.messages.contains_key(&message.id) {
            return Err(Error::state(format!("duplicate message id {}", message.id)));
        }
        if message.id == message.parent_id.as_deref().unwrap_or_default() {
            return Err(Error::state(format!("message {} is its own parent", message.id)));
        }

        match &message.parent_id {
            Some(parent_id) => {
                let parent = self.messages.get_mut(parent_id).ok_or_else(|| {
                    Error::state(format!(
                        "parent {} of message {} does not exist",
                        parent_id, message.id
                    ))
                })?;
                parent.children_ids.push(message.id.clone());
            }
            None if !self.messages.is_empty() => {
                log::debug!("Adding second root message {} to chat tree", message.id);
            }
            None => {}
        }

        if self.current_id.is_none() {
            self.current_id = Some(message.id.clone());
        }
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    /// Points the active leaf at an existing message.
    pub fn set_current(&mut self, id: &str) -> Result<()> {
        if !self.messages.contains_key(id) {
            return Err(Error::state(format!("message {} does not exist", id)));
        }
        self.current_id = Some(id.to_string());
        Ok(())
    }

    /// Removes a leaf message. When the leaf was current, the pointer moves to
    /// the last surviving sibling, else to the parent.
    pub fn remove_leaf(&mut self, id: &str) -> Result<ChatMessage> {
        let message = self
            .messages
            .get(id)
            .ok_or_else(|| Error::state(format!("message {} does not exist", id)))?;
        if !message.children_ids.is_empty() {
            return Err(Error::state(format!(
                "message {} has {} children and cannot be removed",
                id,
                message.children_ids.len()
            )));
        }

        let message = self
            .messages
            .remove(id)
            .ok_or_else(|| Error::state(format!("message {} does not exist", id)))?;

        let mut fallback = None;
        if let Some(parent_id) = &message.parent_id {
            if let Some(parent) = self.messages.get_mut(parent_id) {
                parent.children_ids.retain(|child| child != id);
                fallback = parent
                    .children_ids
                    .last()
                    .cloned()
                    .or_else(|| Some(parent_id.clone()));
            }
        }

        if self.current_id.as_deref() == Some(id) {
            self.current_id = fallback.or_else(|| self.latest_leaf());
        }
        Ok(message)
    }

    /// Appends text to a message's content.
    pub fn append_content(&mut self, id: &str, fragment: &str) -> Result<()> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| Error::state(format!("message {} does not exist", id)))?;
        message.content.push_str(fragment);
        Ok(())
    }

    /// Marks an assistant message as complete.
    pub fn mark_done(&mut self, id: &str) -> Result<()> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| Error::state(format!("message {} does not exist", id)))?;
        message.done = true;
        Ok(())
    }

    /// Messages on the active branch, root first.
    pub fn branch(&self) -> Vec<&ChatMessage> {
        let mut branch = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.current_id.as_deref();

        while let Some(id) = cursor {
            if !seen.insert(id) {
                log::warn!("Cycle detected in chat tree at message {}", id);
                break;
            }
            match self.messages.get(id) {
                Some(message) => {
                    branch.push(message);
                    cursor = message.parent_id.as_deref();
                }
                None => break,
            }
        }

        branch.reverse();
        branch
    }

    /// Ids of leaf placeholders (empty, unfinished assistant replies).
    pub fn placeholder_ids(&self) -> Vec<String> {
        let mut ids: Vec<&ChatMessage> = self
            .messages
            .values()
            .filter(|m| m.is_placeholder() && m.children_ids.is_empty())
            .collect();
        ids.sort_by_key(|m| m.timestamp);
        ids.into_iter().map(|m| m.id.clone()).collect()
    }

    /// Ids of assistant replies that received part of their text but were
    /// never marked done (a stream that was dropped or cut off).
    pub fn interrupted_reply_ids(&self) -> Vec<String> {
        let mut replies: Vec<&ChatMessage> = self
            .messages
            .values()
            .filter(|m| m.role == MessageRole::Assistant && !m.done && !m.content.is_empty())
            .collect();
        replies.sort_by_key(|m| m.timestamp);
        replies.into_iter().map(|m| m.id.clone()).collect()
    }

    /// Checks the invariants on a tree received from the server.
    pub fn validate(&self) -> Result<()> {
        for message in self.messages.values() {
            if let Some(parent_id) = &message.parent_id {
                if !self.messages.contains_key(parent_id) {
                    return Err(Error::state(format!(
                        "message {} points at missing parent {}",
                        message.id, parent_id
                    )));
                }
            }
        }

        match &self.current_id {
            Some(id) if !self.messages.contains_key(id) => Err(Error::state(format!(
                "current message {} does not exist",
                id
            ))),
            None if !self.messages.is_empty() => {
                Err(Error::state("non-empty chat has no current message"))
            }
            _ => Ok(()),
        }
    }

    /// Re-points a dangling or missing `current_id` at the newest leaf.
    pub(crate) fn repair_current(&mut self) {
        let dangling = match &self.current_id {
            Some(id) => !self.messages.contains_key(id),
            None => !self.messages.is_empty(),
        };
        if dangling {
            self.current_id = self.latest_leaf();
        }
    }

    fn latest_leaf(&self) -> Option<String> {
        self.messages
            .values()
            .filter(|m| m.children_ids.is_empty())
            .max_by_key(|m| m.timestamp)
            .map(|m| m.id.clone())
    }
}

/// Chat record as returned by the chat detail endpoint
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chat: ChatBody,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// The `chat` object stored by the server
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChatBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub history: MessageTree,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Local copy of a server-side chat.
///
/// A session is a snapshot: the synchronizer stages every mutation on a clone,
/// sends it to the server, and only replaces the caller's session after the
/// server accepts it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    /// Active model list; more than one entry means parallel mode
    pub models: Vec<String>,
    pub tree: MessageTree,
    pub updated_at: Option<i64>,
    extra: Map<String, Value>,
}

impl ChatSession {
    /// A session that exists only locally (used before the first sync and in tests).
    pub fn new(id: impl Into<String>, title: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            models,
            tree: MessageTree::new(),
            updated_at: None,
            extra: Map::new(),
        }
    }

    pub(crate) fn from_record(record: ChatRecord) -> Self {
        let ChatRecord {
            id,
            title,
            chat,
            updated_at,
        } = record;

        let mut extra = chat.extra;
        // Rebuilt from the tree on every write
        extra.remove("messages");

        let mut tree = chat.history;
        if let Err(e) = tree.validate() {
            log::warn!("Chat {} has an inconsistent history: {}", id, e);
            tree.repair_current();
        }

        Self {
            title: if title.is_empty() {
                chat.title.unwrap_or_default()
            } else {
                title
            },
            id,
            models: chat.models,
            tree,
            updated_at,
            extra,
        }
    }

    /// Body for the chat update endpoint.
    pub(crate) fn to_payload(&self) -> Result<Value> {
        let mut chat = self.extra.clone();
        chat.insert("title".to_string(), json!(self.title));
        chat.insert("models".to_string(), json!(self.models));
        chat.insert("history".to_string(), serde_json::to_value(&self.tree)?);
        chat.insert(
            "messages".to_string(),
            serde_json::to_value(self.tree.branch())?,
        );
        Ok(json!({ "chat": chat }))
    }

    /// Active branch as completion messages, skipping unfinished placeholders.
    pub(crate) fn completion_messages(&self) -> Vec<CompletionMessage> {
        self.tree
            .branch()
            .into_iter()
            .filter(|m| !m.is_placeholder())
            .map(|m| CompletionMessage::new(m.role.as_str(), m.content.clone()))
            .collect()
    }

    /// Active branch as transcript turns, skipping unfinished placeholders.
    pub(crate) fn branch_turns(&self) -> Vec<ConversationTurn> {
        self.tree
            .branch()
            .into_iter()
            .filter(|m| !m.is_placeholder())
            .map(|m| ConversationTurn::new(m.role, m.content.clone()))
            .collect()
    }

    /// Id of the active leaf, if any.
    pub fn current_id(&self) -> Option<&str> {
        self.tree.current_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_turn() -> (MessageTree, String, String) {
        let mut tree = MessageTree::new();
        let user = ChatMessage::user("Hello", None);
        let user_id = user.id.clone();
        tree.insert(user).unwrap();
        let reply = ChatMessage::assistant("Hi!", Some(user_id.clone()), "llama3");
        let reply_id = reply.id.clone();
        tree.insert(reply).unwrap();
        tree.set_current(&reply_id).unwrap();
        (tree, user_id, reply_id)
    }

    #[test]
    fn test_first_insert_becomes_current() {
        let mut tree = MessageTree::new();
        assert_eq!(tree.current_id(), None);
        let msg = ChatMessage::user("Hello", None);
        let id = msg.id.clone();
        tree.insert(msg).unwrap();
        assert_eq!(tree.current_id(), Some(id.as_str()));
    }

    #[test]
    fn test_insert_links_parent() {
        let (tree, user_id, reply_id) = tree_with_turn();
        assert_eq!(tree.get(&user_id).unwrap().children_ids, vec![reply_id.clone()]);
        assert_eq!(tree.current_id(), Some(reply_id.as_str()));
    }

    #[test]
    fn test_insert_rejects_missing_parent() {
        let mut tree = MessageTree::new();
        let orphan = ChatMessage::user("lost", Some("nope".to_string()));
        let err = tree.insert(orphan).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let (mut tree, user_id, _) = tree_with_turn();
        let mut dup = ChatMessage::user("again", None);
        dup.id = user_id;
        assert!(tree.insert(dup).is_err());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_branch_follows_current_leaf() {
        let (mut tree, user_id, first_reply) = tree_with_turn();
        let regen = ChatMessage::assistant("Hello there!", Some(user_id.clone()), "mistral");
        let regen_id = regen.id.clone();
        tree.insert(regen).unwrap();
        tree.set_current(&regen_id).unwrap();

        let ids: Vec<&str> = tree.branch().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![user_id.as_str(), regen_id.as_str()]);

        tree.set_current(&first_reply).unwrap();
        let branch = tree.branch();
        assert_eq!(branch.last().unwrap().content, "Hi!");
    }

    #[test]
    fn test_remove_leaf_moves_current_to_sibling() {
        let (mut tree, user_id, reply_id) = tree_with_turn();
        let placeholder = ChatMessage::placeholder(Some(user_id.clone()), "mistral");
        let placeholder_id = placeholder.id.clone();
        tree.insert(placeholder).unwrap();
        tree.set_current(&placeholder_id).unwrap();

        tree.remove_leaf(&placeholder_id).unwrap();
        assert_eq!(tree.current_id(), Some(reply_id.as_str()));
        assert_eq!(tree.get(&user_id).unwrap().children_ids, vec![reply_id]);
    }

    #[test]
    fn test_remove_leaf_falls_back_to_parent() {
        let (mut tree, user_id, reply_id) = tree_with_turn();
        tree.remove_leaf(&reply_id).unwrap();
        assert_eq!(tree.current_id(), Some(user_id.as_str()));
    }

    #[test]
    fn test_remove_rejects_inner_node() {
        let (mut tree, user_id, _) = tree_with_turn();
        assert!(tree.remove_leaf(&user_id).is_err());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_placeholder_ids() {
        let (mut tree, user_id, _) = tree_with_turn();
        let placeholder = ChatMessage::placeholder(Some(user_id), "mistral");
        let placeholder_id = placeholder.id.clone();
        tree.insert(placeholder).unwrap();
        assert_eq!(tree.placeholder_ids(), vec![placeholder_id.clone()]);

        assert!(tree.interrupted_reply_ids().is_empty());

        tree.append_content(&placeholder_id, "partial").unwrap();
        assert!(tree.placeholder_ids().is_empty());
        assert_eq!(tree.interrupted_reply_ids(), vec![placeholder_id.clone()]);

        tree.mark_done(&placeholder_id).unwrap();
        assert!(tree.interrupted_reply_ids().is_empty());
    }

    #[test]
    fn test_validate_detects_dangling_current() {
        let value = json!({
            "messages": {
                "a": {"id": "a", "parentId": null, "childrenIds": [], "role": "user", "content": "hi", "timestamp": 1}
            },
            "currentId": "missing"
        });
        let mut tree: MessageTree = serde_json::from_value(value).unwrap();
        assert!(tree.validate().is_err());
        tree.repair_current();
        assert_eq!(tree.current_id(), Some("a"));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_server_message_roundtrip_keeps_unknown_fields() {
        let value = json!({
            "id": "m1",
            "parentId": null,
            "childrenIds": [],
            "role": "assistant",
            "content": null,
            "timestamp": 10,
            "modelName": "Llama 3",
            "usage": {"total_tokens": 12}
        });
        let message: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(message.content, "");
        assert!(message.done);
        let back = serde_json::to_value(&message).unwrap();
        assert_eq!(back["modelName"], "Llama 3");
        assert_eq!(back["usage"]["total_tokens"], 12);
    }

    #[test]
    fn test_session_payload_contains_linear_branch() {
        let (tree, _, reply_id) = tree_with_turn();
        let mut session = ChatSession::new("c1", "Greetings", vec!["llama3".to_string()]);
        session.tree = tree;

        let payload = session.to_payload().unwrap();
        let chat = &payload["chat"];
        assert_eq!(chat["title"], "Greetings");
        assert_eq!(chat["models"], json!(["llama3"]));
        assert_eq!(chat["history"]["currentId"], json!(reply_id));
        assert_eq!(chat["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_completion_messages_skip_placeholders() {
        let (mut tree, _, reply_id) = tree_with_turn();
        let placeholder = ChatMessage::placeholder(Some(reply_id.clone()), "llama3");
        let placeholder_id = placeholder.id.clone();
        tree.insert(placeholder).unwrap();
        tree.set_current(&placeholder_id).unwrap();

        let mut session = ChatSession::new("c1", "t", vec![]);
        session.tree = tree;
        let messages = session.completion_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "Hi!");
    }

    #[test]
    fn test_session_from_record_preserves_extra_fields() {
        let record: ChatRecord = serde_json::from_value(json!({
            "id": "c1",
            "title": "Trip",
            "chat": {
                "title": "Trip",
                "models": ["llama3"],
                "history": {"messages": {}, "currentId": null},
                "messages": [],
                "tags": ["travel"],
                "params": {"temperature": 0.2}
            },
            "updated_at": 1700000000
        }))
        .unwrap();

        let session = ChatSession::from_record(record);
        assert_eq!(session.title, "Trip");
        assert_eq!(session.models, vec!["llama3"]);
        let payload = session.to_payload().unwrap();
        assert_eq!(payload["chat"]["tags"], json!(["travel"]));
        assert_eq!(payload["chat"]["params"]["temperature"], json!(0.2));
    }
}
