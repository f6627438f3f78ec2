//! Conversation size helpers for long-running tasks
//!
//! A multi-step task can run long enough that its transcript no longer fits a
//! model's context window. These helpers measure a transcript and cut it down;
//! the task loop uses them to decide when to replace older turns with a
//! running summary.
//!
//! # Examples
//!
//! ```rust
//! use webui_chat::{ConversationTurn, estimate_tokens, is_approaching_limit};
//!
//! let turns = vec![
//!     ConversationTurn::user("What is the capital of France?"),
//!     ConversationTurn::assistant("Final Answer: Paris"),
//! ];
//!
//! let tokens = estimate_tokens(&turns);
//! assert!(tokens > 0);
//! assert!(!is_approaching_limit(&turns, 4000, 0.9));
//! ```

use crate::session::MessageRole;
use serde::{Deserialize, Serialize};

/// One entry of a task transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

/// Estimate token count for a transcript
///
/// Uses character-based approximation (1 token ≈ 4 characters).
///
/// # Note
///
/// This is an APPROXIMATION. Actual token counts vary by model family
/// (roughly 70-85% accurate for GPT, Llama, Qwen and Mistral tokenizers),
/// so leave a safety margin when comparing against a hard limit.
pub fn estimate_tokens(turns: &[ConversationTurn]) -> usize {
    if turns.is_empty() {
        return 0;
    }

    let mut total_chars = 0;

    for turn in turns {
        // ~2 tokens for role formatting
        total_chars += 8;
        total_chars += turn.content.chars().count();
    }

    // Conversation-level overhead
    total_chars += 16;

    total_chars.div_ceil(4)
}

/// Keep the most recent `keep` turns
///
/// Always preserves a leading system turn when `preserve_system` is set.
/// Returns a new Vec; the input is unchanged.
pub fn truncate_turns(
    turns: &[ConversationTurn],
    keep: usize,
    preserve_system: bool,
) -> Vec<ConversationTurn> {
    if turns.len() <= keep {
        return turns.to_vec();
    }

    let has_system = preserve_system
        && turns
            .first()
            .is_some_and(|turn| turn.role == MessageRole::System);

    let start = turns.len().saturating_sub(keep);
    if has_system {
        let mut result = vec![turns[0].clone()];
        result.extend_from_slice(&turns[start.max(1)..]);
        result
    } else {
        turns[start..].to_vec()
    }
}

/// Check if a transcript is approaching a token limit
///
/// `true` if estimated tokens exceed `limit * margin`.
pub fn is_approaching_limit(turns: &[ConversationTurn], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(turns);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

/// Plain-text rendering of a transcript, one `role: content` block per turn.
pub fn render_transcript(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
