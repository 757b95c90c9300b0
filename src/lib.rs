//! Mindmap - incremental conversation graph engine
//!
//! Turns a growing, multi-speaker transcript into a bounded, versioned
//! node/edge graph:
//! - Periodically regenerates the graph from the full transcript via an LLM
//! - Normalizes heterogeneous provider responses into a candidate graph
//! - Bounds graph size by collapsing the oldest nodes into summary nodes
//! - Persists the latest graph per session without touching sibling fields

pub mod config;
pub mod engine;
pub mod generator;
pub mod graph;
pub mod merge;
pub mod model;
pub mod store;
pub mod summarize;
pub mod transcript;

pub use config::{EngineConfig, ModelSettings};
pub use engine::{CycleOutcome, EngineEvent, MindmapEngine, SkipReason, StatusEvent};
pub use generator::{Generation, Generator};
pub use graph::{Edge, Graph, GraphDelta, GraphMetadata, Node, NodeMetadata, NodeType};
pub use merge::{merge_delta, similar};
pub use model::{ChatModel, ChatRequest, ModelResponse};
pub use store::{FileRecordStore, MemoryRecordStore, MindmapStore, RecordStore, SessionRecord};
pub use summarize::summarize;
pub use transcript::{JsonlTranscript, MemoryTranscript, TranscriptSource, TranscriptTurn};

use serde::{Deserialize, Serialize};

/// Result type for mindmap operations
pub type Result<T> = std::result::Result<T, MindmapError>;

/// Errors that can occur while building or storing a mindmap
#[derive(Debug, thiserror::Error)]
pub enum MindmapError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No transcript content to analyze")]
    NoTranscriptContent,

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("No JSON object found in model response: {excerpt}")]
    NoJsonFound { excerpt: String },

    #[error("Failed to parse model JSON ({message}): {excerpt}")]
    JsonParse { excerpt: String, message: String },

    #[error("Model call failed: {0}")]
    ModelCall(String),

    #[error("Transcript error: {0}")]
    Transcript(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured error classification carried on status events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NoTranscriptContent,
    EmptyResponse,
    NoJsonFound,
    JsonParse,
    ModelCall,
    Transcript,
    Persistence,
    Internal,
}

impl MindmapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MindmapError::Configuration(_) => ErrorKind::Configuration,
            MindmapError::NoTranscriptContent => ErrorKind::NoTranscriptContent,
            MindmapError::EmptyResponse => ErrorKind::EmptyResponse,
            MindmapError::NoJsonFound { .. } => ErrorKind::NoJsonFound,
            MindmapError::JsonParse { .. } => ErrorKind::JsonParse,
            MindmapError::ModelCall(_) => ErrorKind::ModelCall,
            MindmapError::Transcript(_) => ErrorKind::Transcript,
            MindmapError::Persistence(_) => ErrorKind::Persistence,
            MindmapError::Io(_) | MindmapError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether another generation attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MindmapError::EmptyResponse
                | MindmapError::NoJsonFound { .. }
                | MindmapError::JsonParse { .. }
                | MindmapError::ModelCall(_)
        )
    }
}

/// Truncate `text` to at most `max_chars` characters for diagnostics.
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("... [truncated]");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            MindmapError::NoJsonFound { excerpt: "x".into() }.kind(),
            ErrorKind::NoJsonFound
        );
        assert!(MindmapError::EmptyResponse.is_retryable());
        assert!(!MindmapError::Configuration("no key".into()).is_retryable());
        assert!(!MindmapError::NoTranscriptContent.is_retryable());
        assert!(!MindmapError::Persistence("disk full".into()).is_retryable());
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("short", 10), "short");
        let long = "é".repeat(20);
        let cut = excerpt(&long, 5);
        assert!(cut.starts_with("ééééé"));
        assert!(cut.ends_with("[truncated]"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NoTranscriptContent).unwrap();
        assert_eq!(json, "\"no_transcript_content\"");
    }
}
