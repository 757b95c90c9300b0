//! Response text extraction.
//!
//! Each known response shape gets one `ResponseExtractor`; `normalize` probes
//! them in priority order and takes the first that yields text:
//!   1. direct string `content`
//!   2. `text` value or accessor
//!   3. raw OpenAI `choices[0].message.content`
//!   4. raw Gemini `response.text` / `candidates[0].content.parts[].text`

use crate::model::ModelResponse;
use serde_json::Value;

/// Text pulled out of a model response
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub finish_reason: Option<String>,
    /// Which extractor matched
    pub source: &'static str,
}

impl ExtractedText {
    /// Whether the provider stopped because it ran out of tokens.
    pub fn is_truncated(&self) -> bool {
        self.finish_reason
            .as_deref()
            .map(is_truncation_reason)
            .unwrap_or(false)
    }
}

pub fn is_truncation_reason(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason == "length" || reason.contains("max_tokens") || reason.contains("max tokens")
}

pub trait ResponseExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, response: &ModelResponse) -> Option<ExtractedText>;
}

/// Extractors in probing order.
pub fn default_extractors() -> Vec<Box<dyn ResponseExtractor>> {
    vec![
        Box::new(ContentField),
        Box::new(TextProperty),
        Box::new(OpenAiChoices),
        Box::new(GeminiCandidates),
    ]
}

/// First non-empty text any extractor finds.
pub fn normalize(
    response: &ModelResponse,
    extractors: &[Box<dyn ResponseExtractor>],
) -> Option<ExtractedText> {
    extractors
        .iter()
        .filter_map(|e| e.extract(response))
        .find(|t| !t.text.trim().is_empty())
}

struct ContentField;

impl ResponseExtractor for ContentField {
    fn name(&self) -> &'static str {
        "content"
    }

    fn extract(&self, response: &ModelResponse) -> Option<ExtractedText> {
        let text = response.content.as_ref()?.as_str()?;
        Some(ExtractedText {
            text: text.to_string(),
            finish_reason: None,
            source: self.name(),
        })
    }
}

struct TextProperty;

impl ResponseExtractor for TextProperty {
    fn name(&self) -> &'static str {
        "text"
    }

    fn extract(&self, response: &ModelResponse) -> Option<ExtractedText> {
        let text = response.text.as_ref()?.resolve()?;
        Some(ExtractedText {
            text,
            finish_reason: None,
            source: self.name(),
        })
    }
}

struct OpenAiChoices;

impl ResponseExtractor for OpenAiChoices {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn extract(&self, response: &ModelResponse) -> Option<ExtractedText> {
        let choice = response.raw.as_ref()?.get("choices")?.get(0)?;
        let content = choice.get("message")?.get("content")?;
        let text = match content {
            Value::String(s) => s.clone(),
            // Content-part arrays: [{"type":"text","text":"..."}]
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>(),
            _ => return None,
        };
        Some(ExtractedText {
            text,
            finish_reason: string_field(choice, "finish_reason"),
            source: self.name(),
        })
    }
}

struct GeminiCandidates;

impl GeminiCandidates {
    fn candidates_text(payload: &Value) -> Option<(String, Option<String>)> {
        let candidate = payload.get("candidates")?.get(0)?;
        let parts = candidate.get("content")?.get("parts")?.as_array()?;
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();
        Some((text, string_field(candidate, "finishReason")))
    }
}

impl ResponseExtractor for GeminiCandidates {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn extract(&self, response: &ModelResponse) -> Option<ExtractedText> {
        let raw = response.raw.as_ref()?;
        // SDK wrappers nest the payload under `response`.
        let payload = raw.get("response").unwrap_or(raw);

        let from_candidates = Self::candidates_text(payload);
        let finish_reason = from_candidates.as_ref().and_then(|(_, r)| r.clone());

        if let Some(text) = payload.get("text").and_then(|t| t.as_str()) {
            if !text.trim().is_empty() {
                return Some(ExtractedText {
                    text: text.to_string(),
                    finish_reason,
                    source: self.name(),
                });
            }
        }

        let (text, finish_reason) = from_candidates?;
        Some(ExtractedText {
            text,
            finish_reason,
            source: self.name(),
        })
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TextField as Text;
    use serde_json::json;
    use std::sync::Arc;

    fn run(response: &ModelResponse) -> Option<ExtractedText> {
        normalize(response, &default_extractors())
    }

    #[test]
    fn test_content_field_wins() {
        let mut response = ModelResponse::from_content("{\"a\":1}");
        response.raw = Some(json!({"choices":[{"message":{"content":"other"}}]}));
        let extracted = run(&response).unwrap();
        assert_eq!(extracted.text, "{\"a\":1}");
        assert_eq!(extracted.source, "content");
    }

    #[test]
    fn test_non_string_content_falls_through() {
        let mut response = ModelResponse::default();
        response.content = Some(json!({"nested": true}));
        response.text = Some(Text::Plain("from text".into()));
        assert_eq!(run(&response).unwrap().source, "text");
    }

    #[test]
    fn test_text_accessor() {
        let response =
            ModelResponse::from_text(Text::Accessor(Arc::new(|| Some("lazy".to_string()))));
        assert_eq!(run(&response).unwrap().text, "lazy");
    }

    #[test]
    fn test_openai_choices_with_finish_reason() {
        let response = ModelResponse::from_raw(json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"nodes\":[]}"}, "finish_reason": "length"}]
        }));
        let extracted = run(&response).unwrap();
        assert_eq!(extracted.source, "openai");
        assert_eq!(extracted.finish_reason.as_deref(), Some("length"));
        assert!(extracted.is_truncated());
    }

    #[test]
    fn test_gemini_candidates_parts_joined() {
        let response = ModelResponse::from_raw(json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"nodes\":"}, {"text": "[]}"}]},
                "finishReason": "MAX_TOKENS"
            }]
        }));
        let extracted = run(&response).unwrap();
        assert_eq!(extracted.text, "{\"nodes\":[]}");
        assert_eq!(extracted.source, "gemini");
        assert!(extracted.is_truncated());
    }

    #[test]
    fn test_gemini_wrapped_response_text() {
        let response = ModelResponse::from_raw(json!({
            "response": {
                "text": "{}",
                "candidates": [{"content": {"parts": []}, "finishReason": "STOP"}]
            }
        }));
        let extracted = run(&response).unwrap();
        assert_eq!(extracted.text, "{}");
        assert_eq!(extracted.finish_reason.as_deref(), Some("STOP"));
        assert!(!extracted.is_truncated());
    }

    #[test]
    fn test_empty_everything_is_none() {
        assert!(run(&ModelResponse::default()).is_none());
        assert!(run(&ModelResponse::from_content("   ")).is_none());
        assert!(run(&ModelResponse::from_raw(json!({"choices": []}))).is_none());
    }
}
