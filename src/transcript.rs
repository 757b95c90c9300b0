//! Transcript sources.
//!
//! The engine never owns the transcript; it asks a `TranscriptSource` for all
//! rows of a session each cycle. Two backends ship with the crate: an
//! in-memory log and a per-session JSONL directory.

use crate::{MindmapError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

/// One transcribed utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: String,
    pub text: String,
    /// Epoch seconds (milliseconds are tolerated)
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_at: Option<f64>,
}

/// Accept numbers and numeric strings; anything else becomes `None` so the
/// turn still formats with a positional index.
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

impl TranscriptTurn {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>, start_at: Option<f64>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
            start_at,
        }
    }

    /// Turn stamped with the current time.
    pub fn now(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        let secs = chrono::Utc::now().timestamp() as f64;
        Self::new(speaker, text, Some(secs))
    }
}

/// Ordered, append-only transcript store queried per session.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// All turns recorded for `session_id`, oldest first.
    async fn turns(&self, session_id: &str) -> Result<Vec<TranscriptTurn>>;

    /// Append a turn to the session's transcript.
    async fn append(&self, session_id: &str, turn: TranscriptTurn) -> Result<()>;
}

/// In-memory transcript log.
#[derive(Debug, Default)]
pub struct MemoryTranscript {
    sessions: RwLock<HashMap<String, Vec<TranscriptTurn>>>,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptSource for MemoryTranscript {
    async fn turns(&self, session_id: &str) -> Result<Vec<TranscriptTurn>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, session_id: &str, turn: TranscriptTurn) -> Result<()> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }
}

/// Transcript stored as `{dir}/{session_id}.jsonl`, one turn per line.
pub struct JsonlTranscript {
    dir: PathBuf,
}

impl JsonlTranscript {
    /// Create the store, creating `dir` if needed.
    pub async fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", crate::store::sanitize_session_id(session_id)))
    }
}

#[async_trait]
impl TranscriptSource for JsonlTranscript {
    async fn turns(&self, session_id: &str) -> Result<Vec<TranscriptTurn>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| MindmapError::Transcript(format!("{}: {}", path.display(), e)))?;

        let mut turns = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptTurn>(line) {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!(
                    "Skipping malformed transcript line {} for {}: {}",
                    line_no + 1,
                    session_id,
                    e
                ),
            }
        }
        Ok(turns)
    }

    async fn append(&self, session_id: &str, turn: TranscriptTurn) -> Result<()> {
        let line = serde_json::to_string(&turn)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session_id))
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
