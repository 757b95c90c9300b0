//! HTTP chat client for OpenAI-compatible and Gemini endpoints.
//!
//! Returns the provider-native JSON untouched in `ModelResponse::raw`; text
//! extraction happens in the generator.

use super::{ChatModel, ChatRequest, ModelResponse};
use crate::config::ModelSettings;
use crate::{MindmapError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Wire format spoken by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireApi {
    /// `/chat/completions`
    OpenAiChat,
    /// `/models/{model}:generateContent`
    Gemini,
}

pub struct HttpChatModel {
    client: Client,
    wire_api: WireApi,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpChatModel {
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        settings.validate()?;

        let provider = settings.provider.to_lowercase();
        let wire_api = match provider.as_str() {
            "gemini" | "google" => WireApi::Gemini,
            _ => WireApi::OpenAiChat,
        };
        let base_url = match &settings.base_url {
            Some(url) => url.clone(),
            None => default_base_url(&provider).ok_or_else(|| {
                MindmapError::Configuration(format!(
                    "provider '{}' needs an explicit base_url",
                    settings.provider
                ))
            })?,
        };

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("mindmap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MindmapError::Configuration(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            wire_api,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    fn openai_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": false,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    fn gemini_body(&self, request: &ChatRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation_config = json!({
            "maxOutputTokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if request.json_mode {
            generation_config["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }
        body
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = crate::excerpt(&extract_error_detail(&body), 500);
        if detail.is_empty() {
            return Err(MindmapError::ModelCall(format!("API error {status}")));
        }
        Err(MindmapError::ModelCall(format!("API error {status}: {detail}")))
    }

    fn map_reqwest_error(e: reqwest::Error) -> MindmapError {
        if e.is_timeout() {
            MindmapError::ModelCall(format!("timeout: {e}"))
        } else if e.is_connect() {
            MindmapError::ModelCall(format!("network: {e}"))
        } else {
            MindmapError::ModelCall(e.to_string())
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ModelResponse> {
        let builder = match self.wire_api {
            WireApi::OpenAiChat => {
                let url = format!("{}/chat/completions", self.base_url);
                let mut builder = self.client.post(url).json(&self.openai_body(request));
                if let Some(key) = &self.api_key {
                    builder = builder.bearer_auth(key);
                }
                builder
            }
            WireApi::Gemini => {
                let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
                let mut builder = self.client.post(url).json(&self.gemini_body(request));
                if let Some(key) = &self.api_key {
                    builder = builder.header("x-goog-api-key", key);
                }
                builder
            }
        };

        debug!(
            "Calling {:?} model {} (max_tokens={})",
            self.wire_api, self.model, request.max_tokens
        );

        let response = builder.send().await.map_err(Self::map_reqwest_error)?;
        let response = Self::check_response_status(response).await?;
        let raw: Value = response
            .json()
            .await
            .map_err(|e| MindmapError::ModelCall(format!("invalid response body: {e}")))?;

        Ok(ModelResponse::from_raw(raw))
    }
}

fn default_base_url(provider: &str) -> Option<String> {
    let url = match provider {
        "openai" => std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        "gemini" | "google" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "anthropic" => "https://api.anthropic.com/v1".to_string(),
        "ollama" => "http://localhost:11434/v1".to_string(),
        "lmstudio" => "http://localhost:1234/v1".to_string(),
        _ => return None,
    };
    Some(url)
}

fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}
