//! Request executor tests
//!
//! Verifies retry counts, status mapping and request shape against a mock
//! server.

use reqwest::Method;
use serde_json::json;
use webui_chat::retry::RetryPolicy;
use webui_chat::{ClientOptions, Error, RequestExecutor};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn executor(server: &MockServer, retries: u32) -> RequestExecutor {
    let options = ClientOptions::builder()
        .base_url(server.uri())
        .token("sk-test")
        .default_model("llama3")
        .retry_policy(RetryPolicy::no_delay(retries))
        .build()
        .unwrap();
    RequestExecutor::new(&options).unwrap()
}

#[tokio::test]
async fn test_server_errors_are_retried_until_attempts_run_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let result = executor(&server, 2)
        .execute(Method::GET, "/api/models", None)
        .await;

    match result {
        Err(Error::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.status(), Some(503));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chats/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Not found"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = executor(&server, 3)
        .execute(Method::GET, "/api/v1/chats/missing", None)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(err.is_permanent());
    assert!(err.to_string().contains("Not found"));
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let value = executor(&server, 2)
        .execute(Method::GET, "/api/models", None)
        .await
        .unwrap();
    assert_eq!(value, json!({"data": []}));
}

#[tokio::test]
async fn test_three_failures_then_success_takes_four_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "llama3"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let value = executor(&server, 3)
        .execute(Method::GET, "/api/models", None)
        .await
        .unwrap();
    assert_eq!(value["data"][0]["id"], "llama3");
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_four_failures_exhaust_default_retry_count() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let err = executor(&server, 3)
        .execute(Method::GET, "/api/models", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_zero_retries_means_single_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let err = executor(&server, 0)
        .execute(Method::POST, "/api/chat/completions", Some(&json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 1, .. }));
}

#[tokio::test]
async fn test_sends_bearer_token_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/notes/create"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "n1"})))
        .expect(1)
        .mount(&server)
        .await;

    let value = executor(&server, 0)
        .execute(Method::POST, "/api/v1/notes/create", Some(&json!({"title": "t"})))
        .await
        .unwrap();
    assert_eq!(value["id"], "n1");

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body, json!({"title": "t"}));
}

#[tokio::test]
async fn test_query_parameters_are_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chats/search"))
        .and(query_param("text", "Trip & plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let value = executor(&server, 0)
        .execute_query("/api/v1/chats/search", &[("text", "Trip & plans")])
        .await
        .unwrap();
    assert_eq!(value, json!([]));
}

#[tokio::test]
async fn test_empty_body_decodes_to_null() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/chats/c1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let value = executor(&server, 0)
        .execute(Method::DELETE, "/api/v1/chats/c1", None)
        .await
        .unwrap();
    assert!(value.is_null());
}

#[tokio::test]
async fn test_invalid_json_body_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let err = executor(&server, 3)
        .execute(Method::GET, "/api/models", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Json(_)));
}

#[tokio::test]
async fn test_connection_refused_is_retried() {
    let options = ClientOptions::builder()
        .base_url("http://127.0.0.1:9")
        .token("sk-test")
        .default_model("llama3")
        .retry_policy(RetryPolicy::no_delay(1))
        .build()
        .unwrap();
    let executor = RequestExecutor::new(&options).unwrap();

    let err = executor
        .execute(Method::GET, "/api/models", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
}
