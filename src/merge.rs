//! Fuzzy node merging for incremental graph deltas.
//!
//! Near-duplicate labels collapse into one node; everything else is appended.

use crate::graph::{generate_node_id, now_millis, Graph, GraphDelta};
use std::collections::HashSet;
use tracing::debug;

/// Token overlap above which two labels count as the same concept.
const TOKEN_OVERLAP_THRESHOLD: f64 = 0.5;

/// Case-insensitive label similarity.
///
/// True on exact match, when either label contains the other, or when the
/// shared lowercase word count divided by the larger word count exceeds 0.5.
pub fn similar(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();

    if a == b {
        return true;
    }
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.contains(&b) || b.contains(&a) {
        return true;
    }

    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    let larger = words_a.len().max(words_b.len());
    if larger == 0 {
        return false;
    }
    let shared = words_a.intersection(&words_b).count();
    (shared as f64 / larger as f64) > TOKEN_OVERLAP_THRESHOLD
}

/// Merge `delta` into `existing`, returning the merged graph.
///
/// Incoming nodes similar to an existing node fold their transcript indices
/// into it; the rest are appended. Edges are appended unless the same
/// `(from, to)` pair is already present, and edges that would dangle after
/// the merge are dropped. The version always advances by one.
pub fn merge_delta(existing: &Graph, delta: &GraphDelta) -> Graph {
    let mut merged = existing.clone();
    // Incoming id -> id of the node it ended up as, so delta edges follow merges.
    let mut remap: Vec<(String, String)> = Vec::new();
    let mut absorbed = 0usize;

    for incoming in &delta.nodes {
        if let Some(target) = merged
            .nodes
            .iter_mut()
            .find(|n| similar(&n.label, &incoming.label))
        {
            target
                .metadata
                .transcript_indices
                .extend(incoming.metadata.transcript_indices.iter().copied());
            if !incoming.id.is_empty() && incoming.id != target.id {
                remap.push((incoming.id.clone(), target.id.clone()));
            }
            absorbed += 1;
            continue;
        }

        let mut node = incoming.clone();
        if node.id.is_empty() || merged.node(&node.id).is_some() {
            let fresh = generate_node_id();
            if !node.id.is_empty() {
                remap.push((node.id.clone(), fresh.clone()));
            }
            node.id = fresh;
        }
        merged.nodes.push(node);
    }

    let resolve = |id: &str| -> String {
        remap
            .iter()
            .find(|(from, _)| from == id)
            .map(|(_, to)| to.clone())
            .unwrap_or_else(|| id.to_string())
    };

    let mut added_edges = 0usize;
    for incoming in &delta.edges {
        let mut edge = incoming.clone();
        edge.from = resolve(&edge.from);
        edge.to = resolve(&edge.to);
        let duplicate = merged
            .edges
            .iter()
            .any(|e| e.from == edge.from && e.to == edge.to);
        if duplicate {
            continue;
        }
        if edge.id.is_empty() {
            edge.id = format!("edge-{}-{}", edge.from, edge.to);
        }
        merged.edges.push(edge);
        added_edges += 1;
    }

    let dropped = merged.prune_dangling_edges();

    merged.metadata.version += 1;
    merged.metadata.last_updated = now_millis();

    debug!(
        "Merged delta: {} nodes absorbed, {} appended, {} edges added, {} dangling dropped (v{})",
        absorbed,
        delta.nodes.len() - absorbed,
        added_edges,
        dropped,
        merged.metadata.version
    );

    merged
}
