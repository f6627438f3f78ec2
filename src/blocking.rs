//! Blocking wrapper around [`Client`].
//!
//! For scripts and programs without an async runtime. Each call blocks the
//! current thread until the request sequence it starts has finished. Streams
//! become iterators that block on every item.
//!
//! Do not use this from inside an async context; calling into a runtime from
//! a runtime thread panics.
//!
//! ```rust,no_run
//! use webui_chat::blocking::BlockingClient;
//! use webui_chat::{ChatOptions, ClientOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = BlockingClient::new(ClientOptions::from_env().build()?)?;
//! let reply = client.chat("Hello!", "Scratchpad", ChatOptions::new())?;
//! println!("{}", reply.response);
//!
//! for fragment in client.stream_chat("Tell me a story", "Scratchpad", ChatOptions::new())? {
//!     print!("{}", fragment?);
//! }
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::session::ChatSession;
use crate::task::{TaskEvent, TaskEventStream, TaskOptions, TaskResult};
use crate::types::{
    ChatOptions, ChatResponse, ClientOptions, FileInfo, KnowledgeBase, ModelInfo, ModelSelector,
    Note, ParallelChatResponse,
};
use crate::utils::TextStream;
use crate::{Error, Result};
use futures::StreamExt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Synchronous chat client owning a single-threaded runtime.
pub struct BlockingClient {
    client: Client,
    runtime: Arc<Runtime>,
}

impl BlockingClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::config(format!("Failed to start runtime: {}", e)))?;
        Ok(Self {
            client: Client::new(options)?,
            runtime: Arc::new(runtime),
        })
    }

    /// The async client this wrapper drives.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Runs any future on this client's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn chat(&self, question: &str, chat_title: &str, options: ChatOptions) -> Result<ChatResponse> {
        self.block_on(self.client.chat(question, chat_title, options))
    }

    pub fn stream_chat(
        &self,
        question: &str,
        chat_title: &str,
        options: ChatOptions,
    ) -> Result<BlockingIter<Result<String>>> {
        let stream: TextStream = self.block_on(self.client.stream_chat(question, chat_title, options))?;
        Ok(BlockingIter::new(self.runtime.clone(), stream))
    }

    pub fn parallel_chat(
        &self,
        question: &str,
        chat_title: &str,
        model_ids: &[&str],
    ) -> Result<ParallelChatResponse> {
        self.block_on(
            self.client
                .parallel_chat(question, chat_title, model_ids.iter().copied()),
        )
    }

    pub fn switch_chat_model(&self, chat_id: &str, selector: impl Into<ModelSelector>) -> bool {
        self.block_on(self.client.switch_chat_model(chat_id, selector))
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<ChatSession> {
        self.block_on(self.client.get_chat(chat_id))
    }

    pub fn delete_chat(&self, chat_id: &str) -> bool {
        self.block_on(self.client.delete_chat(chat_id))
    }

    pub fn process_task(&self, options: TaskOptions) -> Result<TaskResult> {
        self.block_on(self.client.process_task(options))
    }

    pub fn stream_process_task(&self, options: TaskOptions) -> BlockingIter<TaskEvent> {
        let stream: TaskEventStream = self.client.stream_process_task(options);
        BlockingIter::new(self.runtime.clone(), stream)
    }

    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.block_on(self.client.list_models())
    }

    pub fn upload_file(&self, path: impl AsRef<Path>) -> Result<FileInfo> {
        self.block_on(self.client.upload_file(path))
    }

    pub fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        self.block_on(self.client.list_knowledge_bases())
    }

    pub fn list_notes(&self) -> Result<Vec<Note>> {
        self.block_on(self.client.list_notes())
    }

    pub fn create_note(&self, title: &str, markdown: &str) -> Result<Note> {
        self.block_on(self.client.create_note(title, markdown))
    }
}

/// Iterator that blocks on the next item of an async stream.
pub struct BlockingIter<T> {
    runtime: Arc<Runtime>,
    stream: std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send>>,
}

impl<T> BlockingIter<T> {
    fn new(
        runtime: Arc<Runtime>,
        stream: std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send>>,
    ) -> Self {
        Self { runtime, stream }
    }
}

impl<T> Iterator for BlockingIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.runtime.block_on(self.stream.next())
    }
}
