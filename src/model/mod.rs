//! Model invocation seam.
//!
//! The engine only needs `chat(messages) -> response`. Responses stay loosely
//! shaped on purpose: the generator probes them for text because different
//! providers and SDK wrappers put it in different places.

mod capabilities;
mod http;

pub use capabilities::{Capabilities, CapabilityTable};
pub use http::HttpChatModel;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for JSON-only output when it supports it
    pub json_mode: bool,
}

/// A `text` field that is either a value or a zero-argument accessor.
#[derive(Clone)]
pub enum TextField {
    Plain(String),
    Accessor(Arc<dyn Fn() -> Option<String> + Send + Sync>),
}

impl TextField {
    pub fn resolve(&self) -> Option<String> {
        match self {
            TextField::Plain(s) => Some(s.clone()),
            TextField::Accessor(f) => f(),
        }
    }
}

impl std::fmt::Debug for TextField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextField::Plain(s) => f.debug_tuple("Plain").field(s).finish(),
            TextField::Accessor(_) => f.write_str("Accessor(..)"),
        }
    }
}

/// Whatever the model client handed back.
///
/// Clients fill whichever fields they have: a normalized `content`, a `text`
/// field or accessor, and/or the provider-native `raw` payload.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: Option<Value>,
    pub text: Option<TextField>,
    pub raw: Option<Value>,
}

impl ModelResponse {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: Some(Value::String(content.into())),
            ..Self::default()
        }
    }

    pub fn from_text(text: TextField) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }

    pub fn from_raw(raw: Value) -> Self {
        Self {
            raw: Some(raw),
            ..Self::default()
        }
    }
}

/// Opaque chat completion provider.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ModelResponse>;
}
