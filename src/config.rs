//! Configuration helpers for the WebUI chat SDK

use crate::types::{ClientOptions, ClientOptionsBuilder};
use std::env;

/// Environment variable holding the server root URL
pub const ENV_BASE_URL: &str = "WEBUI_BASE_URL";

/// Environment variable holding the API token
pub const ENV_TOKEN: &str = "WEBUI_TOKEN";

/// Environment variable holding the default model id
pub const ENV_DEFAULT_MODEL: &str = "WEBUI_DEFAULT_MODEL";

/// Default server URL of a local install
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

/// Get the base URL from environment variable or fallback
///
/// Priority:
/// 1. WEBUI_BASE_URL environment variable
/// 2. fallback parameter
/// 3. `http://localhost:3000`
///
/// # Examples
///
/// ```rust,no_run
/// use webui_chat::get_base_url;
///
/// let url = get_base_url(None);
/// let url = get_base_url(Some("http://chat.internal:8080"));
/// ```
pub fn get_base_url(fallback: Option<&str>) -> String {
    if let Ok(url) = env::var(ENV_BASE_URL) {
        if !url.trim().is_empty() {
            return url;
        }
    }

    fallback.unwrap_or(DEFAULT_BASE_URL).to_string()
}

/// Get the default model from environment variable or fallback
///
/// Priority:
/// 1. WEBUI_DEFAULT_MODEL environment variable (if prefer_env is true)
/// 2. fallback parameter
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    if prefer_env {
        if let Ok(model) = env::var(ENV_DEFAULT_MODEL) {
            if !model.trim().is_empty() {
                return Some(model);
            }
        }
    }

    fallback.map(|s| s.to_string())
}

/// Get the API token from the environment.
pub fn get_token() -> Option<String> {
    env::var(ENV_TOKEN).ok().filter(|t| !t.trim().is_empty())
}

impl ClientOptions {
    /// Builder pre-filled from `WEBUI_BASE_URL`, `WEBUI_TOKEN` and
    /// `WEBUI_DEFAULT_MODEL`. Missing values surface as configuration errors
    /// from `build()`.
    pub fn from_env() -> ClientOptionsBuilder {
        let mut builder = ClientOptions::builder().base_url(get_base_url(None));
        if let Some(token) = get_token() {
            builder = builder.token(token);
        }
        if let Some(model) = get_model(None, true) {
            builder = builder.default_model(model);
        }
        builder
    }
}
