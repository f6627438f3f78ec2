//! Files, knowledge bases and notes.
//!
//! Thin typed wrappers over the server's resource endpoints. They share the
//! client's executor, so they get the same retry behavior as chat calls.

use crate::client::Client;
use crate::types::{FileInfo, KnowledgeBase, Note};
use crate::{Error, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;

fn decode_list<T: DeserializeOwned>(value: Value) -> Result<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        // Some list endpoints wrap results as {"items": [...]}
        Value::Object(mut map) if map.contains_key("items") => Ok(serde_json::from_value(
            map.remove("items").unwrap_or(Value::Array(Vec::new())),
        )?),
        other => Ok(serde_json::from_value(other)?),
    }
}

fn note_body(title: &str, markdown: &str) -> Value {
    json!({
        "title": title,
        "data": { "content": { "md": markdown } },
    })
}

impl Client {
    /// Uploads a local file for use as a RAG attachment.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - [`Error::InvalidInput`] if the path has no file name
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<FileInfo> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::invalid_input(format!("{} has no file name", path.display())))?;
        let bytes = tokio::fs::read(path).await?;

        log::info!("Uploading {} ({} bytes)", filename, bytes.len());
        let value = self
            .executor()
            .upload("/api/v1/files/", filename, &bytes)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        let value = self
            .executor()
            .execute(Method::GET, "/api/v1/knowledge/list", None)
            .await?;
        decode_list(value)
    }

    /// First knowledge base with exactly this name.
    pub async fn get_knowledge_base_by_name(&self, name: &str) -> Result<Option<KnowledgeBase>> {
        Ok(self
            .list_knowledge_bases()
            .await?
            .into_iter()
            .find(|kb| kb.name == name))
    }

    pub async fn create_knowledge_base(
        &self,
        name: &str,
        description: &str,
    ) -> Result<KnowledgeBase> {
        let payload = json!({ "name": name, "description": description });
        let value = self
            .executor()
            .execute(Method::POST, "/api/v1/knowledge/create", Some(&payload))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Adds an uploaded file to a knowledge base.
    pub async fn add_file_to_knowledge_base(&self, knowledge_id: &str, file_id: &str) -> Result<()> {
        let payload = json!({ "file_id": file_id });
        self.executor()
            .execute(
                Method::POST,
                &format!("/api/v1/knowledge/{}/file/add", knowledge_id),
                Some(&payload),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_knowledge_base(&self, knowledge_id: &str) -> Result<()> {
        self.executor()
            .execute(
                Method::DELETE,
                &format!("/api/v1/knowledge/{}/delete", knowledge_id),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn list_notes(&self) -> Result<Vec<Note>> {
        let value = self
            .executor()
            .execute(Method::GET, "/api/v1/notes/", None)
            .await?;
        decode_list(value)
    }

    pub async fn get_note(&self, note_id: &str) -> Result<Note> {
        let value = self
            .executor()
            .execute(Method::GET, &format!("/api/v1/notes/{}", note_id), None)
            .await?;
        if value.is_null() {
            return Err(Error::api(404, format!("note {} not found", note_id)));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Creates a note with a markdown body.
    pub async fn create_note(&self, title: &str, markdown: &str) -> Result<Note> {
        let value = self
            .executor()
            .execute(
                Method::POST,
                "/api/v1/notes/create",
                Some(&note_body(title, markdown)),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Replaces a note's title and markdown body.
    pub async fn update_note(&self, note_id: &str, title: &str, markdown: &str) -> Result<Note> {
        let value = self
            .executor()
            .execute(
                Method::POST,
                &format!("/api/v1/notes/{}/update", note_id),
                Some(&note_body(title, markdown)),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn delete_note(&self, note_id: &str) -> Result<()> {
        self.executor()
            .execute(
                Method::DELETE,
                &format!("/api/v1/notes/{}/delete", note_id),
                None,
            )
            .await?;
        Ok(())
    }
}
