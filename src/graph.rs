//! Mindmap graph types
//!
//! Field names serialize in camelCase so the stored JSON matches what the
//! render layer consumes.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

/// Canonical visuals per hierarchy level.
pub mod palette {
    pub const TOPIC_COLOR: &str = "#4A90E2";
    pub const SUBTOPIC_COLOR: &str = "#7ED321";
    pub const DETAIL_COLOR: &str = "#F5A623";
    pub const SUMMARY_COLOR: &str = "#9B9B9B";
    pub const EDGE_COLOR: &str = "#CCCCCC";

    pub const TOPIC_SIZE: u32 = 20;
    pub const SUBTOPIC_SIZE: u32 = 15;
    pub const DETAIL_SIZE: u32 = 10;

    pub const HIERARCHICAL_EDGE: &str = "hierarchical";

    pub fn color_for_level(level: u32) -> &'static str {
        match level {
            0 | 1 => TOPIC_COLOR,
            2 => SUBTOPIC_COLOR,
            _ => DETAIL_COLOR,
        }
    }

    pub fn size_for_level(level: u32) -> u32 {
        match level {
            0 | 1 => TOPIC_SIZE,
            2 => SUBTOPIC_SIZE,
            _ => DETAIL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Topic,
    Subtopic,
    Detail,
    Summary,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Topic => "topic",
            NodeType::Subtopic => "subtopic",
            NodeType::Detail => "detail",
            NodeType::Summary => "summary",
        }
    }

    /// Type implied by a hierarchy level when the model omitted one.
    pub fn for_level(level: u32) -> Self {
        match level {
            0 | 1 => NodeType::Topic,
            2 => NodeType::Subtopic,
            _ => NodeType::Detail,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "topic" => Ok(NodeType::Topic),
            "subtopic" => Ok(NodeType::Subtopic),
            "detail" => Ok(NodeType::Detail),
            "summary" => Ok(NodeType::Summary),
            other => Err(format!("Unknown node type: {}", other)),
        }
    }
}

/// Unknown type strings from the model become `None` instead of failing the
/// whole node.
fn lenient_node_type<'de, D>(deserializer: D) -> Result<Option<NodeType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    /// Unix seconds of the first mention; missing sorts as oldest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_mentioned: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,

    #[serde(default)]
    pub transcript_indices: Vec<u64>,

    /// Ids collapsed into this node (summary nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_nodes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub id: String,

    pub label: String,

    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_node_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub node_type: Option<NodeType>,

    #[serde(default = "default_level")]
    pub level: u32,

    #[serde(default)]
    pub color: String,

    #[serde(default)]
    pub size: u32,

    #[serde(default)]
    pub metadata: NodeMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expandable: Option<bool>,
}

fn default_level() -> u32 {
    1
}

impl Node {
    /// Build a node with the canonical visuals for its level.
    pub fn new(id: impl Into<String>, label: impl Into<String>, level: u32) -> Self {
        let level = level.max(1);
        Self {
            id: id.into(),
            label: label.into(),
            node_type: Some(NodeType::for_level(level)),
            level,
            color: palette::color_for_level(level).to_string(),
            size: palette::size_for_level(level),
            metadata: NodeMetadata::default(),
            expandable: None,
        }
    }

    pub fn with_first_mentioned(mut self, ts: i64) -> Self {
        self.metadata.first_mentioned = Some(ts);
        self
    }

    pub fn with_transcript_indices(mut self, indices: Vec<u64>) -> Self {
        self.metadata.transcript_indices = indices;
        self
    }

    pub fn is_summary(&self) -> bool {
        self.node_type == Some(NodeType::Summary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,

    pub from: String,

    pub to: String,

    #[serde(rename = "type", default = "default_edge_type")]
    pub edge_type: String,

    #[serde(default)]
    pub color: String,
}

fn default_edge_type() -> String {
    palette::HIERARCHICAL_EDGE.to_string()
}

impl Edge {
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            edge_type: default_edge_type(),
            color: palette::EDGE_COLOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    #[serde(default)]
    pub session_id: String,

    /// Unix milliseconds of the last successful update
    #[serde(default)]
    pub last_updated: i64,

    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub total_transcripts: usize,

    /// Diagnostic set when the very first cycle for a session failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Non-fatal notice, e.g. a truncated model completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    #[serde(default)]
    pub metadata: GraphMetadata,
}

/// A partial `{nodes, edges}` payload applied on top of an existing graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    /// Empty graph bound to a session, version 0.
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: GraphMetadata {
                session_id: session_id.into(),
                ..GraphMetadata::default()
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Whether this graph has ever been produced by a successful update.
    pub fn has_content(&self) -> bool {
        self.metadata.version > 0 || !self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_ids(&self) -> HashSet<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    /// Edges whose endpoints are missing from `nodes`.
    pub fn dangling_edges(&self) -> Vec<&Edge> {
        let ids = self.node_ids();
        self.edges
            .iter()
            .filter(|e| !ids.contains(e.from.as_str()) || !ids.contains(e.to.as_str()))
            .collect()
    }

    /// Drop edges that point at nodes not present in this graph.
    pub fn prune_dangling_edges(&mut self) -> usize {
        let ids: HashSet<String> = self.nodes.iter().map(|n| n.id.clone()).collect();
        let before = self.edges.len();
        self.edges
            .retain(|e| ids.contains(&e.from) && ids.contains(&e.to));
        before - self.edges.len()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Current time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `node-<ms>-<random>` id for nodes that arrived without one.
pub fn generate_node_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("node-{}-{}", now_millis(), suffix)
}
