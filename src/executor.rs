//! HTTP request execution with retry.
//!
//! [`RequestExecutor`] is the only place that talks to the network. Every call
//! goes through [`retry_with_backoff`] with the client's [`RetryPolicy`]:
//! connection failures, timeouts and 5xx responses are retried, 4xx responses
//! come back immediately as [`Error::Api`].

use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::types::ClientOptions;
use crate::{Error, Result};
use reqwest::{Method, Response};
use serde_json::Value;
use std::time::Duration;

/// Issues authenticated JSON requests against the server.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    http: reqwest::Client,
    base_url: String,
    token: String,
    retry: RetryPolicy,
}

impl RequestExecutor {
    /// Builds the executor and its pooled HTTP client.
    ///
    /// The timeout from `options` applies to every request this executor sends.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout()))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: options.base_url().to_string(),
            token: options.token().to_string(),
            retry: options.retry().clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sends a request and decodes the JSON body.
    ///
    /// An empty success body decodes to [`Value::Null`].
    ///
    /// # Errors
    ///
    /// - [`Error::Api`] for a 4xx response (no retry)
    /// - [`Error::RetriesExhausted`] when every attempt failed transiently
    /// - [`Error::Json`] when a success body is not valid JSON
    pub async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Result<Value> {
        retry_with_backoff(&self.retry, || {
            let method = method.clone();
            async move {
                let response = self.send(method, endpoint, &[], payload).await?;
                decode_body(response).await
            }
        })
        .await
    }

    /// `GET` with URL-encoded query parameters.
    pub async fn execute_query(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Value> {
        retry_with_backoff(&self.retry, || async move {
            let response = self.send(Method::GET, endpoint, query, None).await?;
            decode_body(response).await
        })
        .await
    }

    /// `POST`s `payload` and hands back the live response for streaming.
    ///
    /// Retries cover connecting and the status line only; once the body is
    /// being read a failure surfaces to the stream consumer.
    pub async fn execute_stream(&self, endpoint: &str, payload: &Value) -> Result<Response> {
        retry_with_backoff(&self.retry, || {
            self.send(Method::POST, endpoint, &[], Some(payload))
        })
        .await
    }

    /// Uploads `bytes` as the multipart field `file`.
    pub async fn upload(&self, endpoint: &str, filename: &str, bytes: &[u8]) -> Result<Value> {
        let url = self.url(endpoint);
        let url = url.as_str();
        retry_with_backoff(&self.retry, || async move {
            // A multipart form is consumed by send, so each attempt builds its own
            let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename.to_string());
            let form = reqwest::multipart::Form::new().part("file", part);

            log::debug!("POST {} (upload {}, {} bytes)", url, filename, bytes.len());
            let response = self
                .http
                .post(url)
                .bearer_auth(&self.token)
                .multipart(form)
                .send()
                .await
                .map_err(map_transport)?;
            let response = check_status(response).await?;
            decode_body(response).await
        })
        .await
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        payload: Option<&Value>,
    ) -> Result<Response> {
        let url = self.url(endpoint);
        log::debug!("{} {}", method, url);

        let mut request = self.http.request(method, &url).bearer_auth(&self.token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = request.send().await.map_err(map_transport)?;
        check_status(response).await
    }
}

fn map_transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(err)
    }
}

/// Turns a non-success status into [`Error::Api`] carrying the response body.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_else(|e| {
        log::warn!("Failed to read error response body: {}", e);
        String::new()
    });
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("no response body").to_string()
    } else {
        body
    };
    Err(Error::api(status.as_u16(), message))
}

async fn decode_body(response: Response) -> Result<Value> {
    let body = response.text().await.map_err(map_transport)?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(base_url: &str) -> RequestExecutor {
        let options = ClientOptions::builder()
            .base_url(base_url)
            .token("sk-test")
            .default_model("llama3")
            .build()
            .unwrap();
        RequestExecutor::new(&options).unwrap()
    }

    #[test]
    fn test_url_join() {
        let exec = executor("http://localhost:3000/");
        assert_eq!(exec.url("/api/models"), "http://localhost:3000/api/models");
        assert_eq!(exec.url("api/models"), "http://localhost:3000/api/models");
    }

    #[test]
    fn test_executor_takes_retry_policy_from_options() {
        let exec = executor("http://localhost:3000");
        assert_eq!(exec.retry_policy().max_attempts(), 4);
        assert_eq!(exec.base_url(), "http://localhost:3000");
    }
}
