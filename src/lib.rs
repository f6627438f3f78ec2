//! # WebUI Chat SDK
//!
//! A client library for Open WebUI style chat servers: chat, streaming chat,
//! parallel multi-model chat, file and knowledge base (RAG) attachments,
//! notes, model switching and autonomous multi-step task processing.
//!
//! ## Key Features
//!
//! - **Server-backed chats**: chats are found or created by title and every
//!   turn is recorded in the server's message tree
//! - **Streaming Responses**: token-by-token replies, persisted in batches
//! - **Parallel Models**: one question answered side by side by several models
//! - **Multi-step Tasks**: plan/execute/evaluate loop with key findings,
//!   optional decision model and history summarization
//! - **Retry Logic**: exponential backoff with jitter on transient failures
//! - **Blocking API**: [`blocking::BlockingClient`] for code without a runtime
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webui_chat::{ChatOptions, Client, ClientOptions};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ClientOptions::builder()
//!         .base_url("http://localhost:3000")
//!         .token("sk-...")
//!         .default_model("llama3")
//!         .build()?;
//!     let client = Client::new(options)?;
//!
//!     // Buffered turn
//!     let reply = client.chat("What's 2+2?", "Math", ChatOptions::new()).await?;
//!     println!("{}", reply.response);
//!
//!     // Streamed turn in the same chat
//!     let mut stream = client
//!         .stream_chat("And multiplied by 3?", "Math", ChatOptions::new())
//!         .await?;
//!     while let Some(fragment) = stream.next().await {
//!         print!("{}", fragment?);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **executor** / **retry**: HTTP calls with bounded retry
//! - **session**: local chat model (message tree arena, active branch)
//! - **sync**: find-or-create chats and server-confirmed tree mutations
//! - **client**: chat operations built on the two layers above
//! - **task**: the multi-step task loop and its event stream
//! - **resources**: files, knowledge bases, notes
//! - **context**: transcript size estimation for summarization
//! - **config**: environment-based configuration
//! - **utils**: SSE parsing and streamed-write coalescing

mod client;
mod config;
mod context;
mod error;
mod executor;
mod resources;
mod session;
mod sync;
mod task;
mod types;
mod utils;

/// Synchronous wrapper for use without an async runtime.
pub mod blocking;

/// Retry utilities with exponential backoff and jitter.
/// Public so callers can configure [`retry::RetryPolicy`] and reuse
/// [`retry::retry_with_backoff`] for their own operations.
pub mod retry;

// --- Client ---

pub use client::Client;
pub use executor::RequestExecutor;
pub use sync::ChatSynchronizer;

// --- Configuration ---

pub use config::{
    DEFAULT_BASE_URL, ENV_BASE_URL, ENV_DEFAULT_MODEL, ENV_TOKEN, get_base_url, get_model,
    get_token,
};

// --- Context Management ---

pub use context::{
    ConversationTurn, estimate_tokens, is_approaching_limit, render_transcript, truncate_turns,
};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Chat State ---

pub use session::{ChatMessage, ChatSession, MessageRole, MessageTree};

// --- Tasks ---

pub use task::{
    MAX_ITERATIONS_SOLUTION, TERMINAL_MARKER, TaskEvent, TaskEventStream, TaskOptions,
    TaskOrchestrator, TaskPhase, TaskResult, TaskState, TodoItem, TodoStatus,
    extract_final_answer, parse_key_findings, parse_options, parse_todo_list,
};

// --- Core Types ---

pub use types::{
    ChatOptions, ChatResponse, ClientOptions, ClientOptionsBuilder, FileInfo, FileRef,
    KnowledgeBase, ModelInfo, ModelSelector, Note, ParallelChatResponse,
};

// --- Streaming ---

pub use utils::{DeltaCoalescer, TextStream, parse_sse_stream};

/// Convenience module containing the most commonly used types.
/// Import with `use webui_chat::prelude::*;`.
pub mod prelude {
    pub use crate::{
        ChatOptions, ChatResponse, Client, ClientOptions, Error, ModelSelector,
        ParallelChatResponse, Result, TaskEvent, TaskOptions, TaskResult,
    };
}
