//! Transcript formatting and the structure prompt.

use crate::graph::palette;
use crate::transcript::TranscriptTurn;
use chrono::{DateTime, Local, TimeZone};

/// Values at or above this are treated as epoch milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

pub const SYSTEM_PROMPT: &str = "You are a conversation structure analyzer. \
Respond with a single raw JSON object only. No prose, no explanations, no markdown code fences.";

/// Render turns as `[HH:MM:SS] speaker: text`, one per line.
///
/// Turns without a usable timestamp get their 1-based position instead.
pub fn format_transcript(turns: &[TranscriptTurn]) -> String {
    turns
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.text.trim().is_empty())
        .map(|(i, t)| {
            let stamp = t
                .start_at
                .and_then(local_time)
                .map(|dt| dt.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| (i + 1).to_string());
            format!("[{}] {}: {}", stamp, t.speaker, t.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Interpret `ts` as epoch seconds, or milliseconds when it is large.
fn local_time(ts: f64) -> Option<DateTime<Local>> {
    if !ts.is_finite() || ts < 0.0 {
        return None;
    }
    let millis = if ts >= EPOCH_MILLIS_THRESHOLD {
        ts
    } else {
        ts * 1000.0
    };
    if millis > i64::MAX as f64 {
        return None;
    }
    Local.timestamp_millis_opt(millis as i64).single()
}

/// Build the user prompt asking for the hierarchical structure.
pub fn build_structure_prompt(transcript: &str) -> String {
    format!(
        r#"Analyze the conversation transcript below and extract its structure as a mindmap.

Selection rules:
- Pick the 3-6 most important top-level topics (level 1).
- Give each topic 2-3 subtopics (level 2).
- Add at most 1-2 details (level 3) per subtopic, only when essential.

Node contract:
- "id": sequential per type: "topic-1", "topic-2", "subtopic-1", "detail-1", ...
- "label": at most 20 characters
- "type": "topic" | "subtopic" | "detail"
- "level": 1 | 2 | 3
- "color": "{topic_color}" for level 1, "{subtopic_color}" for level 2, "{detail_color}" for level 3
- "size": {topic_size} for level 1, {subtopic_size} for level 2, {detail_size} for level 3

Edge contract:
- "id": "edge-1", "edge-2", ...
- "from": parent node id, "to": child node id
- "type": "{edge_type}"
- "color": "{edge_color}"

Output exactly this shape as raw JSON, with no prose and no code fences:
{{"nodes":[{{"id":"topic-1","label":"...","type":"topic","level":1,"color":"{topic_color}","size":{topic_size}}}],"edges":[{{"id":"edge-1","from":"topic-1","to":"subtopic-1","type":"{edge_type}","color":"{edge_color}"}}]}}

=== TRANSCRIPT ===
{transcript}
=== END TRANSCRIPT ==="#,
        topic_color = palette::TOPIC_COLOR,
        subtopic_color = palette::SUBTOPIC_COLOR,
        detail_color = palette::DETAIL_COLOR,
        topic_size = palette::TOPIC_SIZE,
        subtopic_size = palette::SUBTOPIC_SIZE,
        detail_size = palette::DETAIL_SIZE,
        edge_type = palette::HIERARCHICAL_EDGE,
        edge_color = palette::EDGE_COLOR,
        transcript = transcript,
    )
}
