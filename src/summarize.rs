//! Size bounding by collapsing the oldest nodes into summary nodes.
//!
//! When the graph exceeds `max_nodes`:
//!   1. Order nodes by `firstMentioned` (missing counts as oldest)
//!   2. Keep the newest `max_nodes` untouched
//!   3. Collapse the rest into one summary node per level
//!   4. Re-point edges that touched a collapsed node at its summary
//!
//! Edges whose endpoints were both collapsed are dropped; the summary node
//! stands in for them.

use crate::graph::{palette, Graph, Node, NodeMetadata, NodeType};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Default node budget for the scheduled cycle
pub const DEFAULT_MAX_NODES: usize = 200;

/// Bound `graph` to `max_nodes` visible nodes plus one summary node per
/// collapsed level. Graphs already within budget are returned unchanged.
pub fn summarize(graph: &Graph, max_nodes: usize) -> Graph {
    if graph.nodes.len() <= max_nodes {
        return graph.clone();
    }

    // Stable sort keeps model order among equal timestamps.
    let mut ordered: Vec<&Node> = graph.nodes.iter().collect();
    ordered.sort_by_key(|n| n.metadata.first_mentioned.unwrap_or(0));

    let split = ordered.len() - max_nodes;
    let (older, recent) = ordered.split_at(split);

    let mut by_level: BTreeMap<u32, Vec<&Node>> = BTreeMap::new();
    for node in older {
        by_level.entry(node.level).or_default().push(node);
    }

    let stamp = chrono::Utc::now().timestamp_millis();
    let mut summaries: Vec<Node> = Vec::with_capacity(by_level.len());
    // Collapsed id -> summary id
    let mut collapsed: HashMap<&str, String> = HashMap::new();

    for (level, group) in &by_level {
        let summary_id = unique_summary_id(graph, *level, stamp);
        let kind = group
            .first()
            .and_then(|n| n.node_type)
            .map(|t| t.as_str())
            .unwrap_or("items");

        let mut summarized: Vec<String> = Vec::new();
        for node in group {
            summarized.push(node.id.clone());
            // A summary being re-collapsed hands over what it already covered.
            if let Some(inner) = &node.metadata.summarized_nodes {
                summarized.extend(inner.iter().cloned());
            }
            collapsed.insert(node.id.as_str(), summary_id.clone());
        }

        let first_mentioned = group
            .iter()
            .map(|n| n.metadata.first_mentioned.unwrap_or(0))
            .min()
            .unwrap_or(0);

        summaries.push(Node {
            id: summary_id,
            label: format!("{} {}", group.len(), kind),
            node_type: Some(NodeType::Summary),
            level: *level,
            color: palette::SUMMARY_COLOR.to_string(),
            size: palette::size_for_level(*level),
            metadata: NodeMetadata {
                first_mentioned: Some(first_mentioned),
                speaker: None,
                transcript_indices: Vec::new(),
                summarized_nodes: Some(summarized),
            },
            expandable: Some(true),
        });
    }

    let mut edges = Vec::with_capacity(graph.edges.len());
    let mut dropped = 0usize;
    for edge in &graph.edges {
        let from_old = collapsed.get(edge.from.as_str());
        let to_old = collapsed.get(edge.to.as_str());
        match (from_old, to_old) {
            (Some(_), Some(_)) => dropped += 1,
            (Some(summary), None) => {
                let mut e = edge.clone();
                e.from = summary.clone();
                edges.push(e);
            }
            (None, Some(summary)) => {
                let mut e = edge.clone();
                e.to = summary.clone();
                edges.push(e);
            }
            (None, None) => edges.push(edge.clone()),
        }
    }

    let mut nodes: Vec<Node> = summaries;
    nodes.extend(recent.iter().map(|n| (*n).clone()));

    let mut bounded = Graph {
        nodes,
        edges,
        metadata: graph.metadata.clone(),
    };
    // Edges that were already dangling in the input must not survive either.
    dropped += bounded.prune_dangling_edges();

    info!(
        "Summarized graph: {} nodes -> {} ({} collapsed into {} summaries, {} edges dropped)",
        graph.nodes.len(),
        bounded.nodes.len(),
        older.len(),
        by_level.len(),
        dropped
    );

    bounded
}

fn unique_summary_id(graph: &Graph, level: u32, stamp: i64) -> String {
    let base = format!("summary-l{}-{}", level, stamp);
    let mut candidate = base.clone();
    let mut n = 1;
    while graph.nodes.iter().any(|node| node.id == candidate) {
        candidate = format!("{}-{}", base, n);
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use std::collections::HashSet;

    fn level_one_graph(count: usize) -> Graph {
        let mut graph = Graph::empty("s");
        for i in 0..count {
            graph
                .nodes
                .push(Node::new(format!("n{}", i), format!("Topic {}", i), 1).with_first_mentioned(i as i64));
        }
        graph
    }

    #[test]
    fn test_within_budget_is_identity() {
        let mut graph = level_one_graph(10);
        graph.edges.push(Edge::new("e", "n0", "n1"));
        assert_eq!(summarize(&graph, 10), graph);
        assert_eq!(summarize(&graph, 200), graph);
    }

    #[test]
    fn test_collapses_oldest_level_one_nodes() {
        let mut graph = level_one_graph(150);
        // Edges among the old, old->recent, recent->old, recent->recent
        graph.edges.push(Edge::new("old-old", "n0", "n1"));
        graph.edges.push(Edge::new("old-new", "n2", "n120"));
        graph.edges.push(Edge::new("new-old", "n130", "n3"));
        graph.edges.push(Edge::new("new-new", "n140", "n141"));

        let bounded = summarize(&graph, 100);
        assert!(bounded.nodes.len() <= 101);
        let summaries: Vec<&Node> = bounded.nodes.iter().filter(|n| n.is_summary()).collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].label, "50 topic");
        assert_eq!(summaries[0].expandable, Some(true));
        assert_eq!(summaries[0].metadata.first_mentioned, Some(0));

        let oldest: HashSet<String> = (0..50).map(|i| format!("n{}", i)).collect();
        for edge in &bounded.edges {
            assert!(!oldest.contains(&edge.from), "edge {} still from old node", edge.id);
            assert!(!oldest.contains(&edge.to), "edge {} still to old node", edge.id);
        }
        assert!(bounded.dangling_edges().is_empty());

        let ids: Vec<&str> = bounded.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["old-new", "new-old", "new-new"]);
        assert_eq!(bounded.edges[0].from, summaries[0].id);
        assert_eq!(bounded.edges[1].to, summaries[0].id);
    }

    #[test]
    fn test_summary_ids_disjoint_from_visible_nodes() {
        let graph = level_one_graph(30);
        let bounded = summarize(&graph, 20);
        let visible: HashSet<&str> = bounded.nodes.iter().map(|n| n.id.as_str()).collect();
        for node in bounded.nodes.iter().filter(|n| n.is_summary()) {
            for id in node.metadata.summarized_nodes.as_ref().unwrap() {
                assert!(!visible.contains(id.as_str()));
            }
        }
    }

    #[test]
    fn test_one_summary_per_level_group() {
        let mut graph = Graph::empty("s");
        for i in 0..6 {
            let level = (i % 3) as u32 + 1;
            graph
                .nodes
                .push(Node::new(format!("n{}", i), format!("Node {}", i), level).with_first_mentioned(i));
        }
        let bounded = summarize(&graph, 3);
        let summaries: Vec<&Node> = bounded.nodes.iter().filter(|n| n.is_summary()).collect();
        assert_eq!(summaries.len(), 3);
        let levels: Vec<u32> = summaries.iter().map(|n| n.level).collect();
        assert_eq!(levels, vec![1, 2, 3]);
        assert_eq!(summaries[1].label, "1 subtopic");
    }

    #[test]
    fn test_missing_first_mentioned_is_oldest() {
        let mut graph = level_one_graph(3);
        graph.nodes.push(Node::new("undated", "Undated", 1));
        let bounded = summarize(&graph, 2);
        let summary = bounded.nodes.iter().find(|n| n.is_summary()).unwrap();
        assert_eq!(
            summary.metadata.summarized_nodes.as_deref(),
            Some(&["n0".to_string(), "undated".to_string()][..])
        );
    }

    #[test]
    fn test_untyped_group_is_labelled_items() {
        let mut graph = level_one_graph(4);
        graph.nodes[0].node_type = None;
        let bounded = summarize(&graph, 3);
        assert!(bounded.nodes.iter().any(|n| n.label == "1 items"));
    }

    #[test]
    fn test_resummarizing_keeps_prior_coverage() {
        let graph = level_one_graph(30);
        let once = summarize(&graph, 20);
        let mut grown = once.clone();
        for i in 30..40 {
            grown
                .nodes
                .push(Node::new(format!("n{}", i), format!("Topic {}", i), 1).with_first_mentioned(i));
        }
        let twice = summarize(&grown, 20);
        let summary = twice.nodes.iter().find(|n| n.is_summary()).unwrap();
        let covered = summary.metadata.summarized_nodes.as_ref().unwrap();
        assert!(covered.contains(&"n0".to_string()));
        assert!(covered.contains(&"n15".to_string()));
        assert_eq!(twice.nodes.len(), 21);
    }
}
