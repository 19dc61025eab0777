//! OpenAI-style chat-completion client
//!
//! Serves both as the generation backend and as the router's decision model.
//! Defaults point at the Upstage Solar endpoint.

use crate::error::ClientError;
use async_trait::async_trait;
use ctd_core::{BackendError, ChatMessage, DecisionClient, GenerationBackend, GenerationRequest};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default API base
pub const DEFAULT_BASE_URL: &str = "https://api.upstage.ai/v1";
/// Default completion path
pub const DEFAULT_CHAT_PATH: &str = "/solar/chat/completions";
/// Path tried when the configured one answers 404
pub const FALLBACK_CHAT_PATH: &str = "/chat/completions";
/// Default model
pub const DEFAULT_MODEL: &str = "solar-pro2";

const ERROR_BODY_CHARS: usize = 500;

/// Chat client settings
#[derive(Clone, PartialEq)]
pub struct ChatClientConfig {
    /// API base URL
    pub base_url: String,
    /// Completion path under the base URL
    pub chat_path: String,
    /// Model name
    pub model: String,
    /// Bearer token; `None` leaves the client unconfigured
    pub api_key: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Per-request timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for ChatClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClientConfig")
            .field("base_url", &self.base_url)
            .field("chat_path", &self.chat_path)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.2,
            timeout: Duration::from_secs(90),
        }
    }
}

impl ChatClientConfig {
    /// Settings from `UPSTAGE_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Settings from an arbitrary variable lookup
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();
        if let Some(base) = get("UPSTAGE_API_BASE") {
            config.base_url = base;
        }
        if let Some(path) = get("UPSTAGE_CHAT_PATH") {
            config.chat_path = path;
        }
        if let Some(model) = get("UPSTAGE_MODEL") {
            config.model = model;
        }
        config.api_key = get("UPSTAGE_API_KEY");
        config
    }

    /// With timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// With API key
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Completion URLs in the order they are tried
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let base = self.base_url.trim_end_matches('/');
        let mut urls = vec![format!("{base}/{}", self.chat_path.trim_start_matches('/'))];
        let fallback = format!("{base}{FALLBACK_CHAT_PATH}");
        if !urls.contains(&fallback) {
            urls.push(fallback);
        }
        urls
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First non-empty completion text
fn completion_text(body: CompletionResponse) -> Result<String, ClientError> {
    body.choices
        .into_iter()
        .filter_map(|c| c.message.content)
        .find(|text| !text.trim().is_empty())
        .ok_or(ClientError::EmptyResponse)
}

/// Chat-completion HTTP client
#[derive(Clone)]
pub struct ChatClient {
    config: ChatClientConfig,
    api_key: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Build a client
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConfigured`] when no API key is set.
    pub fn new(config: ChatClientConfig) -> Result<Self, ClientError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ClientError::NotConfigured("UPSTAGE_API_KEY is not set".to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::NotConfigured(e.to_string()))?;
        Ok(Self { config, api_key, http })
    }

    /// Settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ChatClientConfig {
        &self.config
    }

    /// Send a conversation and return the first completion
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ClientError> {
        let body = CompletionRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            stream: false,
        };

        let endpoints = self.config.endpoints();
        let mut last_status = None;
        for url in &endpoints {
            let response = self
                .http
                .post(url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.send_error(&e))?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                tracing::debug!(%url, "chat endpoint not found; trying next path");
                last_status = Some(status);
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ClientError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(ERROR_BODY_CHARS).collect(),
                });
            }

            let parsed: CompletionResponse = response
                .json()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            let text = completion_text(parsed)?;
            tracing::debug!(model = %self.config.model, chars = text.len(), "completion received");
            return Ok(text);
        }

        Err(ClientError::Status {
            status: last_status.map_or(404, |s| s.as_u16()),
            body: format!("no chat endpoint found among {}", endpoints.join(", ")),
        })
    }

    fn send_error(&self, err: &reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout(self.config.timeout)
        } else if err.is_connect() {
            ClientError::Connection(self.config.base_url.clone())
        } else {
            ClientError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl GenerationBackend for ChatClient {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        self.chat(&request.messages).await.map_err(Into::into)
    }
}

#[async_trait]
impl DecisionClient for ChatClient {
    async fn decide(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        self.chat(&messages).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn env_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("UPSTAGE_API_BASE", "http://localhost:8080/v1/"),
            ("UPSTAGE_MODEL", "solar-mini"),
            ("UPSTAGE_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();

        let config = ChatClientConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.model, "solar-mini");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(
            config.endpoints(),
            vec![
                "http://localhost:8080/v1/solar/chat/completions".to_string(),
                "http://localhost:8080/v1/chat/completions".to_string(),
            ]
        );
    }

    #[test]
    fn missing_key_leaves_client_unconfigured() {
        let config = ChatClientConfig::from_lookup(|_| None);
        assert!(config.api_key.is_none());
        assert!(matches!(ChatClient::new(config), Err(ClientError::NotConfigured(_))));
    }

    #[test]
    fn debug_redacts_key() {
        let config = ChatClientConfig::default().with_api_key("secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn fallback_path_is_not_duplicated() {
        let config = ChatClientConfig {
            chat_path: "chat/completions".into(),
            ..ChatClientConfig::default()
        };
        assert_eq!(config.endpoints().len(), 1);
    }

    #[test]
    fn completion_text_takes_first_non_empty_choice() {
        let body: CompletionResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "  "}}, {"message": {"content": "```yaml\nA: 1\n```"}}]}"#,
        )
        .unwrap();
        assert_eq!(completion_text(body).unwrap(), "```yaml\nA: 1\n```");

        let empty: CompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(completion_text(empty), Err(ClientError::EmptyResponse)));
    }

    #[test]
    fn request_body_uses_lowercase_roles() {
        let messages = [ChatMessage::system("s"), ChatMessage::user("u")];
        let body = CompletionRequest {
            model: "m",
            messages: &messages,
            temperature: 0.2,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["stream"], false);
    }
}
