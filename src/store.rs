//! Per-session record storage for the latest mindmap.
//!
//! A session record is shared with other writers (e.g. the post-meeting
//! summary), so saving the mindmap is read-modify-write: only the `mindmap`
//! and `updatedAt` fields change and everything else is written back exactly
//! as loaded, whatever its shape.
//!
//! Directory layout for the file backend:
//!   {records_dir}/{session_id}.json

use crate::graph::{now_millis, Graph};
use crate::{MindmapError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const SESSION_ID_FIELD: &str = "sessionId";
const MINDMAP_FIELD: &str = "mindmap";
const CREATED_AT_FIELD: &str = "createdAt";
const UPDATED_AT_FIELD: &str = "updatedAt";

/// Stored per-session record: a JSON object whose fields mostly belong to
/// other writers. The mindmap travels as serialized JSON text under `mindmap`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRecord {
    fields: Map<String, Value>,
}

impl SessionRecord {
    /// Record with empty sibling fields, used for the first write of a session.
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = now_millis();
        let mut fields = Map::new();
        fields.insert(SESSION_ID_FIELD.to_string(), Value::String(session_id.into()));
        fields.insert("summaryText".to_string(), Value::String(String::new()));
        fields.insert("keyTopics".to_string(), Value::Array(Vec::new()));
        fields.insert("actionItems".to_string(), Value::Array(Vec::new()));
        fields.insert(CREATED_AT_FIELD.to_string(), Value::from(now));
        fields.insert(UPDATED_AT_FIELD.to_string(), Value::from(now));
        Self { fields }
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(key.into(), value)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.fields.get(SESSION_ID_FIELD).and_then(Value::as_str)
    }

    /// Serialized `Graph`, when the field holds a string.
    pub fn mindmap(&self) -> Option<&str> {
        self.fields.get(MINDMAP_FIELD).and_then(Value::as_str)
    }

    pub fn set_mindmap(&mut self, serialized: String) {
        self.fields
            .insert(MINDMAP_FIELD.to_string(), Value::String(serialized));
    }

    fn touch(&mut self) {
        self.fields
            .insert(UPDATED_AT_FIELD.to_string(), Value::from(now_millis()));
    }
}

/// Generic per-session record substrate.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn write(&self, session_id: &str, record: &SessionRecord) -> Result<()>;
}

/// Record store backed by one JSON file per session.
///
/// Files are named after the sanitized session id, so distinct ids that
/// sanitize alike share a file.
pub struct FileRecordStore {
    records_dir: PathBuf,
}

impl FileRecordStore {
    /// Create a new file store. Creates the directory if needed.
    pub async fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            records_dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.records_dir
            .join(format!("{}.json", sanitize_session_id(session_id)))
    }

    fn temp_path(&self, session_id: &str) -> PathBuf {
        self.records_dir
            .join(format!("{}.json.tmp", sanitize_session_id(session_id)))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.record_path(session_id);
        if !path.exists() {
            return Ok(None);
        }

        // Anything other than a JSON object is corrupt and must not be overwritten
        let content = fs::read_to_string(&path).await?;
        let record = serde_json::from_str::<SessionRecord>(&content).map_err(|e| {
            MindmapError::Persistence(format!("corrupt record for {}: {}", session_id, e))
        })?;
        Ok(Some(record))
    }

    async fn write(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        let path = self.record_path(session_id);
        let temp = self.temp_path(session_id);
        let content = serde_json::to_string_pretty(record)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &path).await?;

        debug!("Wrote session record for {}", session_id);
        Ok(())
    }
}

/// Record store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn write(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(session_id.to_string(), record.clone());
        Ok(())
    }
}

/// Mindmap persistence on top of a `RecordStore`.
///
/// Writes for the same session are serialized so two read-modify-write
/// sequences never interleave. A session's lock lives only while a save
/// holds or waits on it.
pub struct MindmapStore {
    records: Arc<dyn RecordStore>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MindmapStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop our handle and forget the lock if nobody else holds one.
    async fn release_session_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.session_locks.lock().await;
        drop(lock);
        if locks
            .get(session_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(session_id);
        }
    }

    /// Overlay `graph` onto the stored record, preserving all other fields.
    pub async fn save_graph(&self, session_id: &str, graph: &Graph) -> Result<()> {
        let lock = self.session_lock(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.overlay_graph(session_id, graph).await
        };
        self.release_session_lock(session_id, lock).await;
        result
    }

    async fn overlay_graph(&self, session_id: &str, graph: &Graph) -> Result<()> {
        let serialized = graph.to_json()?;
        let existing = self
            .records
            .load(session_id)
            .await
            .map_err(into_persistence)?;

        let mut record = existing.unwrap_or_else(|| {
            debug!("No record for {}, creating one", session_id);
            SessionRecord::new(session_id)
        });
        record.set_mindmap(serialized);
        record.touch();

        self.records
            .write(session_id, &record)
            .await
            .map_err(into_persistence)?;

        info!(
            "Persisted mindmap v{} for session {} ({} nodes)",
            graph.metadata.version,
            session_id,
            graph.nodes.len()
        );
        Ok(())
    }

    /// Load the stored mindmap for a session.
    /// Returns None if no record or no usable mindmap field exists.
    pub async fn load_graph(&self, session_id: &str) -> Result<Option<Graph>> {
        let record = self
            .records
            .load(session_id)
            .await
            .map_err(into_persistence)?;

        let Some(stored) = record.and_then(|r| r.get(MINDMAP_FIELD).cloned()) else {
            return Ok(None);
        };

        let parsed = match stored {
            Value::String(serialized) => Graph::from_json(&serialized),
            Value::Null => return Ok(None),
            other => serde_json::from_value::<Graph>(other).map_err(MindmapError::from),
        };
        match parsed {
            Ok(graph) => Ok(Some(graph)),
            Err(e) => {
                warn!("Failed to parse stored mindmap for {}: {}", session_id, e);
                Ok(None)
            }
        }
    }

    /// Raw record access for callers that own sibling fields.
    pub async fn load_record(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.records.load(session_id).await.map_err(into_persistence)
    }
}

fn into_persistence(e: MindmapError) -> MindmapError {
    match e {
        MindmapError::Persistence(_) => e,
        other => MindmapError::Persistence(other.to_string()),
    }
}

/// Sanitize a session id for use as a file name.
pub(crate) fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
