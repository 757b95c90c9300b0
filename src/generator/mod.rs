//! Structural update generator
//!
//! Turns the full transcript of a session into a candidate graph with one
//! model call. The generator is pure with respect to retries: a failure is
//! returned as-is and the caller decides whether to try again.

mod extract;
mod json;
mod prompt;

pub use extract::{default_extractors, normalize, ExtractedText, ResponseExtractor};
pub use json::{balanced_object, extract_json_object, payload_to_delta, strip_code_fences};
pub use prompt::{build_structure_prompt, format_transcript, SYSTEM_PROMPT};

use crate::config::ModelSettings;
use crate::graph::{palette, Edge, Graph, GraphDelta, NodeType};
use crate::model::{CapabilityTable, ChatMessage, ChatModel, ChatRequest};
use crate::transcript::TranscriptTurn;
use crate::{MindmapError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const TEMPERATURE: f32 = 0.3;

/// A candidate graph plus what the model said about how it finished.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Nodes and edges only; metadata is stamped by the engine on commit
    pub graph: Graph,
    pub finish_reason: Option<String>,
    /// Set when the completion was cut short
    pub warning: Option<String>,
}

pub struct Generator {
    model: Arc<dyn ChatModel>,
    settings: ModelSettings,
    capabilities: CapabilityTable,
    extractors: Vec<Box<dyn ResponseExtractor>>,
}

impl Generator {
    pub fn new(model: Arc<dyn ChatModel>, settings: ModelSettings) -> Self {
        Self {
            model,
            settings,
            capabilities: CapabilityTable::default(),
            extractors: default_extractors(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Build the chat request for a formatted transcript.
    pub fn build_request(&self, transcript: &str) -> ChatRequest {
        let caps = self
            .capabilities
            .lookup(&self.settings.provider, &self.settings.model);
        ChatRequest {
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(build_structure_prompt(transcript)),
            ],
            max_tokens: caps.max_output_tokens(),
            temperature: TEMPERATURE,
            json_mode: caps.json_output,
        }
    }

    /// Generate a candidate graph from every turn of the session.
    pub async fn generate(&self, turns: &[TranscriptTurn]) -> Result<Generation> {
        self.settings.validate()?;

        let transcript = format_transcript(turns);
        if transcript.trim().is_empty() {
            return Err(MindmapError::NoTranscriptContent);
        }

        let request = self.build_request(&transcript);
        debug!(
            "Requesting structure for {} turns (prompt {} chars, max_tokens {})",
            turns.len(),
            transcript.len(),
            request.max_tokens
        );

        let response = self.model.chat(&request).await?;
        let extracted = normalize(&response, &self.extractors).ok_or(MindmapError::EmptyResponse)?;
        debug!(
            "Model answered via {} extractor ({} chars, finish={:?})",
            extracted.source,
            extracted.text.len(),
            extracted.finish_reason
        );

        let warning = if extracted.is_truncated() {
            let reason = extracted.finish_reason.clone().unwrap_or_default();
            warn!("Model output truncated (finish reason: {})", reason);
            Some(format!(
                "model output was truncated ({}); the mindmap may be incomplete",
                reason
            ))
        } else {
            None
        };

        let payload = extract_json_object(&extracted.text)?;
        let delta = payload_to_delta(&payload);
        let graph = sanitize(delta, chrono::Utc::now().timestamp());

        Ok(Generation {
            graph,
            finish_reason: extracted.finish_reason,
            warning,
        })
    }
}

/// Normalize model output into a graph that upholds the invariants:
/// unique non-empty ids, level ≥ 1, canonical visuals where missing, and no
/// edge pointing at an absent node.
pub fn sanitize(delta: GraphDelta, first_mentioned: i64) -> Graph {
    let mut graph = Graph::default();
    let mut seen: HashSet<String> = HashSet::new();

    for mut node in delta.nodes {
        node.label = node.label.trim().to_string();
        if node.label.is_empty() {
            continue;
        }
        if node.id.trim().is_empty() {
            node.id = crate::graph::generate_node_id();
        }
        if !seen.insert(node.id.clone()) {
            debug!("Dropping duplicate node id {}", node.id);
            continue;
        }
        node.level = node.level.max(1);
        if node.node_type.is_none() {
            node.node_type = Some(NodeType::for_level(node.level));
        }
        if node.color.trim().is_empty() {
            node.color = palette::color_for_level(node.level).to_string();
        }
        if node.size == 0 {
            node.size = palette::size_for_level(node.level);
        }
        if node.metadata.first_mentioned.is_none() {
            node.metadata.first_mentioned = Some(first_mentioned);
        }
        graph.nodes.push(node);
    }

    let mut pairs: HashSet<(String, String)> = HashSet::new();
    for (i, mut edge) in delta.edges.into_iter().enumerate() {
        if !seen.contains(&edge.from) || !seen.contains(&edge.to) {
            debug!("Dropping dangling edge {} -> {}", edge.from, edge.to);
            continue;
        }
        if !pairs.insert((edge.from.clone(), edge.to.clone())) {
            continue;
        }
        if edge.id.trim().is_empty() {
            edge.id = format!("edge-{}", i + 1);
        }
        if edge.edge_type.trim().is_empty() {
            edge.edge_type = palette::HIERARCHICAL_EDGE.to_string();
        }
        if edge.color.trim().is_empty() {
            edge.color = palette::EDGE_COLOR.to_string();
        }
        graph.edges.push(edge);
    }

    dedupe_edge_ids(&mut graph.edges);
    graph
}

fn dedupe_edge_ids(edges: &mut [Edge]) {
    let mut seen: HashSet<String> = HashSet::new();
    for edge in edges.iter_mut() {
        if !seen.insert(edge.id.clone()) {
            edge.id = format!("edge-{}-{}", edge.from, edge.to);
            seen.insert(edge.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::model::ModelResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Returns a fixed response and records the last request.
    struct FixedModel {
        response: ModelResponse,
        last_request: Mutex<Option<ChatRequest>>,
    }

    impl FixedModel {
        fn new(response: ModelResponse) -> Arc<Self> {
            Arc::new(Self {
                response,
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn chat(&self, request: &ChatRequest) -> Result<ModelResponse> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            Ok(self.response.clone())
        }
    }

    fn settings() -> ModelSettings {
        ModelSettings::new("openai", "gpt-4o-mini").with_api_key("sk-test")
    }

    fn turns() -> Vec<TranscriptTurn> {
        vec![TranscriptTurn::new(
            "them",
            "Misaligned AI curiosity poses risks.",
            Some(1000.0),
        )]
    }

    #[tokio::test]
    async fn test_generate_single_node() {
        let model = FixedModel::new(ModelResponse::from_content(
            r##"{"nodes":[{"id":"node-1","label":"AI Curiosity","type":"topic","level":1,"color":"#4A90E2","size":20}],"edges":[]}"##,
        ));
        let generator = Generator::new(model.clone(), settings());

        let generation = generator.generate(&turns()).await.unwrap();
        assert_eq!(generation.graph.nodes.len(), 1);
        assert_eq!(generation.graph.edges.len(), 0);
        assert_eq!(generation.graph.nodes[0].label, "AI Curiosity");
        assert!(generation.warning.is_none());

        let request = model.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.messages[0].role, "system");
        assert!(request.messages[1].content.contains("them: Misaligned AI curiosity"));
    }

    #[tokio::test]
    async fn test_configuration_error_before_model_call() {
        let model = FixedModel::new(ModelResponse::from_content("{}"));
        let generator = Generator::new(model.clone(), ModelSettings::new("openai", "gpt-4.1"));
        let err = generator.generate(&turns()).await.unwrap_err();
        assert!(matches!(err, MindmapError::Configuration(_)));
        assert!(model.last_request.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_transcript() {
        let generator = Generator::new(FixedModel::new(ModelResponse::from_content("{}")), settings());
        let err = generator
            .generate(&[TranscriptTurn::new("me", "  ", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, MindmapError::NoTranscriptContent));
    }

    #[tokio::test]
    async fn test_empty_response() {
        let generator = Generator::new(FixedModel::new(ModelResponse::default()), settings());
        let err = generator.generate(&turns()).await.unwrap_err();
        assert!(matches!(err, MindmapError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_refusal_is_no_json_found() {
        let generator = Generator::new(
            FixedModel::new(ModelResponse::from_content("I cannot help with that.")),
            settings(),
        );
        let err = generator.generate(&turns()).await.unwrap_err();
        assert!(matches!(err, MindmapError::NoJsonFound { .. }));
    }

    #[tokio::test]
    async fn test_truncation_is_a_warning() {
        let raw = json!({
            "choices": [{
                "message": {"content": "```json\n{\"nodes\":[{\"id\":\"topic-1\",\"label\":\"Budget\"}]}\n```"},
                "finish_reason": "length"
            }]
        });
        let generator = Generator::new(FixedModel::new(ModelResponse::from_raw(raw)), settings());
        let generation = generator.generate(&turns()).await.unwrap();
        assert_eq!(generation.graph.nodes.len(), 1);
        assert!(generation.warning.unwrap().contains("truncated"));
        assert_eq!(generation.finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn test_token_budget_follows_capabilities() {
        let model = FixedModel::new(ModelResponse::default());
        let short = Generator::new(model.clone(), settings()).build_request("x");
        let long = Generator::new(
            model,
            ModelSettings::new("gemini", "gemini-2.5-flash").with_api_key("k"),
        )
        .build_request("x");
        assert!(long.max_tokens > short.max_tokens);
    }

    #[test]
    fn test_sanitize_enforces_invariants() {
        let delta = GraphDelta {
            nodes: vec![
                Node::new("topic-1", "Budget", 1),
                Node::new("topic-1", "Duplicate id", 1),
                Node::new("", "No id", 2),
                Node::new("blank", "   ", 1),
            ],
            edges: vec![
                Edge::new("edge-1", "topic-1", "ghost"),
                Edge::new("", "topic-1", "topic-1"),
                Edge::new("edge-3", "topic-1", "topic-1"),
            ],
        };
        let mut delta = delta;
        delta.nodes[2].node_type = None;
        delta.nodes[2].color.clear();
        delta.nodes[2].size = 0;

        let graph = sanitize(delta, 42);
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.nodes[1].id.starts_with("node-"));
        assert_eq!(graph.nodes[1].node_type, Some(NodeType::Subtopic));
        assert_eq!(graph.nodes[1].color, palette::SUBTOPIC_COLOR);
        assert_eq!(graph.nodes[1].size, palette::SUBTOPIC_SIZE);
        assert_eq!(graph.nodes[0].metadata.first_mentioned, Some(42));

        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].id, "edge-2");
        assert!(graph.dangling_edges().is_empty());
    }
}
