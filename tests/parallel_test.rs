//! Parallel multi-model chat tests

mod common;

use common::{FakeServer, Reply};
use serde_json::{Value, json};
use webui_chat::{Client, Error};

fn by_role<'a>(messages: &'a [Value], role: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["role"] == role).collect()
}

#[tokio::test]
async fn test_parallel_chat_collects_every_model() {
    let fake = FakeServer::start().await;
    fake.reply_for("llama3", Reply::text("Answer A"));
    fake.reply_for("mistral", Reply::text("Answer B"));
    let client = fake.client();

    let reply = client
        .parallel_chat("Compare", "Side by side", ["llama3", "mistral"])
        .await
        .unwrap();

    assert_eq!(reply.responses.len(), 2);
    assert_eq!(reply.responses["llama3"], "Answer A");
    assert_eq!(reply.responses["mistral"], "Answer B");
    assert_eq!(fake.completion_calls(), 2);

    let record = fake.chat(&reply.chat_id).unwrap();
    assert_eq!(record["chat"]["models"], json!(["llama3", "mistral"]));

    let messages = fake.history_messages(&reply.chat_id);
    let users = by_role(&messages, "user");
    let replies = by_role(&messages, "assistant");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["models"], json!(["llama3", "mistral"]));
    assert_eq!(replies.len(), 2);
    for message in &replies {
        assert_eq!(message["parentId"], users[0]["id"]);
        assert_eq!(message["done"], true);
    }
}

#[tokio::test]
async fn test_parallel_chat_drops_failed_models() {
    let fake = FakeServer::start().await;
    fake.reply_for("llama3", Reply::text("A"));
    fake.reply_for("mistral", Reply::Status(400));
    fake.reply_for("qwen", Reply::text("C"));
    let client = fake.client();

    let reply = client
        .parallel_chat("Question", "Partial", ["llama3", "mistral", "qwen"])
        .await
        .unwrap();

    assert_eq!(reply.responses.len(), 2);
    assert!(!reply.responses.contains_key("mistral"));

    let messages = fake.history_messages(&reply.chat_id);
    let replies = by_role(&messages, "assistant");
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|m| m["model"] != "mistral"));
    assert!(replies.iter().all(|m| !m["content"].as_str().unwrap().is_empty()));

    // Current leaf is the first answering model's reply
    let current = record_current(&fake, &reply.chat_id);
    let leaf = replies.iter().find(|m| m["id"] == current.as_str()).unwrap();
    assert_eq!(leaf["model"], "llama3");
}

fn record_current(fake: &FakeServer, chat_id: &str) -> String {
    fake.chat(chat_id).unwrap()["chat"]["history"]["currentId"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_parallel_chat_fails_when_every_model_fails() {
    let fake = FakeServer::start().await;
    fake.fallback(Reply::Status(400));
    let client = fake.client();

    let err = client
        .parallel_chat("Question", "All down", ["llama3", "mistral"])
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));

    let chat_id = client.synchronizer().cached_chat_id("All down").unwrap();
    let messages = fake.history_messages(&chat_id);
    assert!(by_role(&messages, "assistant").is_empty());
    assert_eq!(by_role(&messages, "user").len(), 1);
}

#[tokio::test]
async fn test_parallel_chat_deduplicates_models() {
    let fake = FakeServer::start().await;
    let client = fake.client();

    let reply = client
        .parallel_chat("Question", "Dupes", ["llama3", "llama3", "mistral"])
        .await
        .unwrap();

    assert_eq!(reply.responses.len(), 2);
    assert_eq!(fake.completion_calls(), 2);
}

#[tokio::test]
async fn test_parallel_chat_skips_unknown_models() {
    let fake = FakeServer::start().await;
    let client = Client::new(fake.options().skip_model_refresh(false).build().unwrap()).unwrap();

    let reply = client
        .parallel_chat("Question", "Known only", ["llama3", "ghost"])
        .await
        .unwrap();

    assert_eq!(reply.responses.keys().collect::<Vec<_>>(), vec!["llama3"]);
    assert_eq!(fake.completion_calls(), 1);
    assert_eq!(fake.requests_to("/api/models").await, 1);
}

#[tokio::test]
async fn test_parallel_chat_without_usable_models() {
    let fake = FakeServer::start().await;
    let client = Client::new(fake.options().skip_model_refresh(false).build().unwrap()).unwrap();

    let err = client
        .parallel_chat("Question", "Nobody", ["ghost"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let empty: [&str; 0] = [];
    let err = fake
        .client()
        .parallel_chat("Question", "Nobody", empty)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(fake.created_chats(), 0);
}

#[tokio::test]
async fn test_parallel_requests_share_history() {
    let fake = FakeServer::start().await;
    let client = fake.client();
    client
        .chat("Warm up", "Shared history", webui_chat::ChatOptions::new())
        .await
        .unwrap();

    client
        .parallel_chat("Now both", "Shared history", ["llama3", "qwen"])
        .await
        .unwrap();

    let requests = fake.completion_requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1]["messages"], requests[2]["messages"]);
    assert_eq!(requests[1]["messages"].as_array().unwrap().len(), 3);
    assert_ne!(requests[1]["id"], requests[2]["id"]);
    assert_eq!(requests[1]["parent_id"], requests[2]["parent_id"]);
}
