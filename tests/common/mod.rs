//! In-process fake of the chat server used by the integration tests.
//!
//! The chat endpoints share one stateful store so find-or-create, updates and
//! deletes behave like the real server. Completions are served from a script:
//! per-model replies first, then a FIFO queue, then a fallback.

#![allow(dead_code)]

use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use webui_chat::retry::RetryPolicy;
use webui_chat::{Client, ClientOptions, ClientOptionsBuilder};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// How the fake answers one completion request.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Streamed as one SSE event per chunk; joined for buffered requests
    Chunks(Vec<String>),
    /// Streams the chunks, then an event whose payload is not valid JSON
    Broken(Vec<String>),
    Status(u16),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Reply::Chunks(chunks.iter().map(|c| c.to_string()).collect())
    }

    pub fn broken(chunks: &[&str]) -> Self {
        Reply::Broken(chunks.iter().map(|c| c.to_string()).collect())
    }
}

#[derive(Default)]
pub struct ServerState {
    chats: HashMap<String, Value>,
    next_id: u64,
    clock: i64,
    created: usize,
    updates: usize,
    fail_updates: bool,
    fail_search: bool,
    completion_requests: Vec<Value>,
    scripted: VecDeque<Reply>,
    by_model: HashMap<String, Reply>,
    fallback: Option<Reply>,
}

impl ServerState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn next_reply(&mut self, model: &str) -> Reply {
        if let Some(reply) = self.by_model.get(model) {
            return reply.clone();
        }
        self.scripted
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Reply::text("OK"))
    }
}

fn json_response(status: u16, body: Value) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(body)
}

fn not_found() -> ResponseTemplate {
    json_response(404, json!({"detail": "Not found"}))
}

/// `/api/v1/chats/...`
struct ChatStore(Arc<Mutex<ServerState>>);

impl Respond for ChatStore {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.0.lock().unwrap();
        let tail = request
            .url
            .path()
            .trim_start_matches("/api/v1/chats/")
            .to_string();
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);

        match (request.method.as_str(), tail.as_str()) {
            ("GET", "search") => {
                if state.fail_search {
                    return json_response(500, json!({"detail": "search unavailable"}));
                }
                let text = request
                    .url
                    .query_pairs()
                    .find(|(key, _)| key == "text")
                    .map(|(_, value)| value.to_lowercase())
                    .unwrap_or_default();
                let hits: Vec<Value> = state
                    .chats
                    .values()
                    .filter(|chat| {
                        chat["title"]
                            .as_str()
                            .is_some_and(|title| title.to_lowercase().contains(&text))
                    })
                    .map(|chat| {
                        json!({
                            "id": chat["id"],
                            "title": chat["title"],
                            "updated_at": chat["updated_at"],
                        })
                    })
                    .collect();
                json_response(200, Value::Array(hits))
            }
            ("POST", "new") => {
                state.next_id += 1;
                state.created += 1;
                let id = format!("chat-{}", state.next_id);
                let updated_at = state.tick();
                let record = json!({
                    "id": id,
                    "title": body["chat"]["title"],
                    "chat": body["chat"],
                    "updated_at": updated_at,
                });
                state.chats.insert(id, record.clone());
                json_response(200, record)
            }
            ("GET", id) => match state.chats.get(id) {
                Some(record) => json_response(200, record.clone()),
                None => not_found(),
            },
            ("POST", id) => {
                if state.fail_updates {
                    return json_response(500, json!({"detail": "write failed"}));
                }
                let updated_at = state.tick();
                let Some(record) = state.chats.get_mut(id) else {
                    return not_found();
                };
                if let Some(title) = body["chat"].get("title") {
                    record["title"] = title.clone();
                }
                record["chat"] = body["chat"].clone();
                record["updated_at"] = json!(updated_at);
                let record = record.clone();
                state.updates += 1;
                json_response(200, record)
            }
            ("DELETE", id) => match state.chats.remove(id) {
                Some(_) => json_response(200, json!(true)),
                None => not_found(),
            },
            _ => not_found(),
        }
    }
}

/// `/api/chat/completions`
struct Completions(Arc<Mutex<ServerState>>);

impl Respond for Completions {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.0.lock().unwrap();
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let model = body["model"].as_str().unwrap_or_default().to_string();
        let stream = body["stream"].as_bool().unwrap_or(false);
        state.completion_requests.push(body);

        match state.next_reply(&model) {
            Reply::Status(status) => json_response(status, json!({"detail": "upstream error"})),
            Reply::Text(text) if stream => sse_response(&[text]),
            Reply::Chunks(chunks) if stream => sse_response(&chunks),
            Reply::Broken(chunks) if stream => broken_sse_response(&chunks),
            Reply::Text(text) => json_response(200, completion_body(&text)),
            Reply::Chunks(chunks) | Reply::Broken(chunks) => {
                json_response(200, completion_body(&chunks.concat()))
            }
        }
    }
}

pub fn completion_body(text: &str) -> Value {
    json!({
        "id": "cmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }]
    })
}

fn sse_events(chunks: &[String]) -> String {
    let mut body = String::new();
    body.push_str("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n");
    for chunk in chunks {
        let event = json!({"choices": [{"delta": {"content": chunk}}]});
        body.push_str(&format!("data: {}\n\n", event));
    }
    body
}

pub fn sse_body(chunks: &[String]) -> String {
    sse_events(chunks) + "data: [DONE]\n\n"
}

fn broken_sse_response(chunks: &[String]) -> ResponseTemplate {
    let body = sse_events(chunks) + "data: {\"choices\": [\n\n";
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn sse_response(chunks: &[String]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(sse_body(chunks), "text/event-stream")
}

/// A running fake server plus handles into its state.
pub struct FakeServer {
    pub server: MockServer,
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub async fn start() -> Self {
        // Debug logs show every request and retry when a test fails
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();

        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(ServerState::default()));

        Mock::given(path_regex(r"^/api/v1/chats/.+$"))
            .respond_with(ChatStore(state.clone()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat/completions"))
            .respond_with(Completions(state.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/models"))
            .respond_with(json_response(
                200,
                json!({"data": [{"id": "llama3"}, {"id": "mistral"}, {"id": "qwen"}]}),
            ))
            .mount(&server)
            .await;

        Self { server, state }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Options pointing at this server; retries are immediate.
    pub fn options(&self) -> ClientOptionsBuilder {
        ClientOptions::builder()
            .base_url(self.uri())
            .token("sk-test")
            .default_model("llama3")
            .retry_policy(RetryPolicy::no_delay(2))
            .skip_model_refresh(true)
    }

    pub fn client(&self) -> Client {
        Client::new(self.options().build().unwrap()).unwrap()
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state.lock().unwrap().scripted.extend(replies);
    }

    pub fn reply_for(&self, model: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .by_model
            .insert(model.to_string(), reply);
    }

    pub fn fallback(&self, reply: Reply) {
        self.state.lock().unwrap().fallback = Some(reply);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.state.lock().unwrap().fail_updates = fail;
    }

    pub fn fail_search(&self, fail: bool) {
        self.state.lock().unwrap().fail_search = fail;
    }

    pub fn completion_calls(&self) -> usize {
        self.state.lock().unwrap().completion_requests.len()
    }

    pub fn completion_requests(&self) -> Vec<Value> {
        self.state.lock().unwrap().completion_requests.clone()
    }

    pub fn created_chats(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn chat_updates(&self) -> usize {
        self.state.lock().unwrap().updates
    }

    /// Stored chat record, as the server would return it.
    pub fn chat(&self, id: &str) -> Option<Value> {
        self.state.lock().unwrap().chats.get(id).cloned()
    }

    /// Overwrites a stored chat record as another client would.
    pub fn replace_chat(&self, id: &str, record: Value) {
        self.state
            .lock()
            .unwrap()
            .chats
            .insert(id.to_string(), record);
    }

    pub fn chat_count(&self) -> usize {
        self.state.lock().unwrap().chats.len()
    }

    /// Every message in a stored chat's history.
    pub fn history_messages(&self, id: &str) -> Vec<Value> {
        let Some(record) = self.chat(id) else {
            return Vec::new();
        };
        record["chat"]["history"]["messages"]
            .as_object()
            .map(|messages| messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Inserts an empty chat directly into the store.
    pub fn seed_chat(&self, title: &str, updated_at: i64) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("chat-{}", state.next_id);
        state.chats.insert(
            id.clone(),
            json!({
                "id": id,
                "title": title,
                "chat": {
                    "title": title,
                    "models": ["llama3"],
                    "history": {"messages": {}, "currentId": null},
                    "messages": [],
                },
                "updated_at": updated_at,
            }),
        );
        id
    }

    /// Number of requests the server received for `path`.
    pub async fn requests_to(&self, request_path: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == request_path)
            .count()
    }
}
