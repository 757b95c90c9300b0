//! Update scheduler
//!
//! Owns the graph bound to a session and refreshes it on a timer:
//! fetch transcript → generate (with retries) → summarize → commit →
//! broadcast → persist.
//!
//! Cycles are single-flight. Every bind/reset/unbind bumps an epoch, and a
//! cycle only commits when the `(session_id, epoch)` it started with still
//! holds, so a slow model call can never resurrect a graph for a session the
//! caller has moved away from.

use crate::config::EngineConfig;
use crate::generator::{Generation, Generator};
use crate::graph::{now_millis, Graph, GraphMetadata};
use crate::store::MindmapStore;
use crate::summarize::summarize;
use crate::transcript::{TranscriptSource, TranscriptTurn};
use crate::{ErrorKind, MindmapError, Result};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MIN_TICK: Duration = Duration::from_millis(1);

/// Notifications for render/UI consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A new graph was committed (or adopted from persistence)
    Updated(Graph),
    Status(StatusEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub kind: ErrorKind,
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle is in flight
    Busy,
    /// No session is bound
    Unbound,
    /// The transcript has no text yet
    NoTranscriptContent,
    /// The session was rebound, reset or unbound while the cycle ran
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Updated(Graph),
    Skipped(SkipReason),
}

struct EngineState {
    session_id: Option<String>,
    epoch: u64,
    pending: Vec<TranscriptTurn>,
    graph: Graph,
    timer: Option<UpdateTimer>,
}

/// A running update timer and the signal that ends it between ticks.
struct UpdateTimer {
    task: JoinHandle<()>,
    stop: Arc<Notify>,
}

impl UpdateTimer {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// The loop exits at its next wait; a cycle already in flight completes.
    fn stop(self) {
        self.stop.notify_one();
    }
}

impl EngineState {
    /// Stop the timer and drop everything bound to the current session.
    fn invalidate(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        self.epoch += 1;
        self.pending.clear();
    }

    fn timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(UpdateTimer::is_running)
    }
}

struct EngineInner {
    config: EngineConfig,
    generator: Generator,
    transcripts: Arc<dyn TranscriptSource>,
    store: MindmapStore,
    state: RwLock<EngineState>,
    cycle: Mutex<()>,
    events: broadcast::Sender<EngineEvent>,
}

/// The conversation graph engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MindmapEngine {
    inner: Arc<EngineInner>,
}

impl MindmapEngine {
    pub fn new(
        config: EngineConfig,
        generator: Generator,
        transcripts: Arc<dyn TranscriptSource>,
        store: MindmapStore,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(EngineInner {
                config,
                generator,
                transcripts,
                store,
                state: RwLock::new(EngineState {
                    session_id: None,
                    epoch: 0,
                    pending: Vec::new(),
                    graph: Graph::default(),
                    timer: None,
                }),
                cycle: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Bind to a session. Rebinding to the current session is a no-op.
    pub async fn bind_session(&self, session_id: &str) {
        let mut state = self.inner.state.write().await;
        if state.session_id.as_deref() == Some(session_id) {
            return;
        }
        state.invalidate();
        state.session_id = Some(session_id.to_string());
        state.graph = Graph::empty(session_id);
        info!("Bound mindmap engine to session {}", session_id);
    }

    /// Note a new transcript turn. Arms the timer (with one immediate cycle)
    /// when a session is bound and no timer is running.
    pub async fn record_turn(&self, speaker: &str, text: &str) {
        let mut state = self.inner.state.write().await;
        state.pending.push(TranscriptTurn::now(speaker, text));

        if state.session_id.is_some() && !state.timer_armed() {
            let epoch = state.epoch;
            state.timer = Some(spawn_timer(&self.inner, epoch));
            debug!(
                "Armed update timer ({:?}) at epoch {}",
                self.inner.config.update_interval, epoch
            );
        }
    }

    pub async fn current_graph(&self) -> Graph {
        self.inner.state.read().await.graph.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.state.read().await.session_id.clone()
    }

    /// Turns recorded since the last committed update.
    pub async fn pending_turns(&self) -> Vec<TranscriptTurn> {
        self.inner.state.read().await.pending.clone()
    }

    pub async fn is_timer_armed(&self) -> bool {
        self.inner.state.read().await.timer_armed()
    }

    /// Clear the graph for the bound session, keeping the binding.
    pub async fn reset_session(&self) {
        let mut state = self.inner.state.write().await;
        state.invalidate();
        state.graph = Graph::empty(state.session_id.clone().unwrap_or_default());
        info!("Reset mindmap for session {:?}", state.session_id);
    }

    pub async fn unbind(&self) {
        let mut state = self.inner.state.write().await;
        state.invalidate();
        if let Some(id) = state.session_id.take() {
            info!("Unbound mindmap engine from session {}", id);
        }
        state.graph = Graph::default();
    }

    /// Load the stored graph for `session_id`. When the engine is bound to that
    /// session the loaded graph becomes current and is broadcast.
    pub async fn load_from_persistence(&self, session_id: &str) -> Result<Option<Graph>> {
        let Some(graph) = self.inner.store.load_graph(session_id).await? else {
            return Ok(None);
        };

        let mut state = self.inner.state.write().await;
        if state.session_id.as_deref() == Some(session_id) {
            state.graph = graph.clone();
            drop(state);
            debug!(
                "Adopted persisted mindmap v{} for {}",
                graph.metadata.version, session_id
            );
            let _ = self.inner.events.send(EngineEvent::Updated(graph.clone()));
        }
        Ok(Some(graph))
    }

    /// Run one update cycle now.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.inner.run_cycle().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }
}

impl EngineInner {
    async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Ok(_guard) = self.cycle.try_lock() else {
            debug!("Update cycle already running, skipping");
            return Ok(CycleOutcome::Skipped(SkipReason::Busy));
        };

        let (session_id, epoch, pending_at_start) = {
            let state = self.state.read().await;
            match &state.session_id {
                Some(id) => (id.clone(), state.epoch, state.pending.len()),
                None => return Ok(CycleOutcome::Skipped(SkipReason::Unbound)),
            }
        };

        let turns = match self.transcripts.turns(&session_id).await {
            Ok(turns) => turns,
            Err(e) => {
                let e = match e {
                    MindmapError::Transcript(_) => e,
                    other => MindmapError::Transcript(other.to_string()),
                };
                return Err(self.fail_cycle(&session_id, epoch, e).await);
            }
        };

        let generation = match self.generate_with_retry(&turns).await {
            Ok(generation) => generation,
            Err(MindmapError::NoTranscriptContent) => {
                debug!("No transcript content for {} yet", session_id);
                self.emit_status(&MindmapError::NoTranscriptContent, Some(&session_id));
                return Ok(CycleOutcome::Skipped(SkipReason::NoTranscriptContent));
            }
            Err(e) => return Err(self.fail_cycle(&session_id, epoch, e).await),
        };

        let Generation { graph, warning, .. } = generation;
        let mut graph = summarize(&graph, self.config.max_nodes);

        {
            let mut state = self.state.write().await;
            if state.epoch != epoch || state.session_id.as_deref() != Some(session_id.as_str()) {
                info!("Session {} changed during update, discarding result", session_id);
                return Ok(CycleOutcome::Skipped(SkipReason::Superseded));
            }
            graph.metadata = GraphMetadata {
                session_id: session_id.clone(),
                last_updated: now_millis(),
                version: state.graph.metadata.version + 1,
                total_transcripts: turns.len(),
                error: None,
                warning,
            };
            state.graph = graph.clone();
            let drained = pending_at_start.min(state.pending.len());
            state.pending.drain(..drained);
        }

        info!(
            "Mindmap v{} for {}: {} nodes, {} edges from {} turns",
            graph.metadata.version,
            session_id,
            graph.nodes.len(),
            graph.edges.len(),
            turns.len()
        );
        let _ = self.events.send(EngineEvent::Updated(graph.clone()));

        if let Err(e) = self.store.save_graph(&session_id, &graph).await {
            warn!("Failed to persist mindmap for {}: {}", session_id, e);
            self.emit_status(&e, Some(&session_id));
            return Err(e);
        }

        Ok(CycleOutcome::Updated(graph))
    }

    async fn generate_with_retry(&self, turns: &[TranscriptTurn]) -> Result<Generation> {
        let attempts = self.config.retry_count.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.generator.generate(turns).await {
                Ok(generation) => return Ok(generation),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Mindmap generation attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, attempts, e, self.config.retry_delay
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Keep the last good graph; only a session that never produced one gets
    /// the error stamped on its metadata.
    async fn fail_cycle(&self, session_id: &str, epoch: u64, error: MindmapError) -> MindmapError {
        warn!("Mindmap update for {} failed: {}", session_id, error);
        {
            let mut state = self.state.write().await;
            if state.epoch == epoch
                && state.session_id.as_deref() == Some(session_id)
                && !state.graph.has_content()
            {
                state.graph.metadata.error = Some(error.to_string());
            }
        }
        self.emit_status(&error, Some(session_id));
        error
    }

    fn emit_status(&self, error: &MindmapError, session_id: Option<&str>) {
        let _ = self.events.send(EngineEvent::Status(StatusEvent {
            kind: error.kind(),
            message: error.to_string(),
            session_id: session_id.map(str::to_string),
        }));
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.task.abort();
        }
    }
}

/// Tick immediately, then every `update_interval`, until stopped, the epoch
/// moves on or the engine is dropped. Errors are logged, never propagated.
///
/// Stopping never interrupts a running cycle, so a commit that already
/// happened still reaches the record store.
fn spawn_timer(inner: &Arc<EngineInner>, epoch: u64) -> UpdateTimer {
    let weak: Weak<EngineInner> = Arc::downgrade(inner);
    let period = inner.config.update_interval.max(MIN_TICK);
    let stop = Arc::new(Notify::new());
    let stopped = stop.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped.notified() => break,
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.state.read().await.epoch != epoch {
                break;
            }
            match inner.run_cycle().await {
                Ok(CycleOutcome::Updated(graph)) => {
                    debug!("Timer cycle produced v{}", graph.metadata.version)
                }
                Ok(CycleOutcome::Skipped(reason)) => debug!("Timer cycle skipped: {:?}", reason),
                Err(e) => debug!("Timer cycle failed: {}", e),
            }
        }
        debug!("Update timer for epoch {} stopped", epoch);
    });

    UpdateTimer { task, stop }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSettings;
    use crate::model::{ChatModel, ChatRequest, ModelResponse};
    use crate::store::MemoryRecordStore;
    use crate::transcript::MemoryTranscript;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays queued responses, repeating the last one when the queue drains.
    struct ScriptedModel {
        responses: StdMutex<VecDeque<String>>,
        calls: StdMutex<usize>,
    }

    impl ScriptedModel {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.iter().map(|s| s.to_string()).collect()),
                calls: StdMutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(&self, _request: &ChatRequest) -> Result<ModelResponse> {
            *self.calls.lock().unwrap() += 1;
            let mut queue = self.responses.lock().unwrap();
            let next = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap_or_default()
            };
            Ok(ModelResponse::from_content(next))
        }
    }

    const ONE_NODE: &str = r#"{"nodes":[{"id":"topic-1","label":"Budget","type":"topic","level":1}],"edges":[]}"#;

    async fn engine_with(model: Arc<ScriptedModel>) -> (MindmapEngine, Arc<MemoryTranscript>) {
        let settings = ModelSettings::new("openai", "gpt-4o-mini").with_api_key("sk-test");
        let config = EngineConfig::default()
            .with_retry(2, Duration::from_millis(1))
            .with_model(settings.clone());
        let transcripts = Arc::new(MemoryTranscript::new());
        let store = MindmapStore::new(Arc::new(MemoryRecordStore::new()));
        let engine = MindmapEngine::new(
            config,
            Generator::new(model, settings),
            transcripts.clone(),
            store,
        );
        (engine, transcripts)
    }

    #[tokio::test]
    async fn test_unbound_cycle_is_skipped() {
        let (engine, _) = engine_with(ScriptedModel::new(&[ONE_NODE])).await;
        assert_eq!(
            engine.run_cycle().await.unwrap(),
            CycleOutcome::Skipped(SkipReason::Unbound)
        );
    }

    #[tokio::test]
    async fn test_rebinding_same_session_keeps_graph() {
        let model = ScriptedModel::new(&[ONE_NODE]);
        let (engine, transcripts) = engine_with(model).await;
        engine.bind_session("s1").await;
        transcripts
            .append("s1", TranscriptTurn::new("me", "budget", Some(1.0)))
            .await
            .unwrap();
        engine.run_cycle().await.unwrap();

        engine.bind_session("s1").await;
        assert_eq!(engine.current_graph().await.metadata.version, 1);

        engine.bind_session("s2").await;
        let graph = engine.current_graph().await;
        assert_eq!(graph.metadata.version, 0);
        assert_eq!(graph.metadata.session_id, "s2");
    }

    #[tokio::test]
    async fn test_blank_transcript_is_soft_skip() {
        let model = ScriptedModel::new(&[ONE_NODE]);
        let (engine, _) = engine_with(model.clone()).await;
        engine.bind_session("s1").await;
        let mut events = engine.subscribe();

        let outcome = engine.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::NoTranscriptContent));
        assert_eq!(model.calls(), 0);
        match events.try_recv().unwrap() {
            EngineEvent::Status(status) => assert_eq!(status.kind, ErrorKind::NoTranscriptContent),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(engine.current_graph().await.metadata.error.is_none());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let model = ScriptedModel::new(&["no json here", "still none", ONE_NODE]);
        let (engine, transcripts) = engine_with(model.clone()).await;
        engine.bind_session("s1").await;
        transcripts
            .append("s1", TranscriptTurn::new("me", "budget", None))
            .await
            .unwrap();

        let outcome = engine.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Updated(_)));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_configuration_error_is_not_retried() {
        let model = ScriptedModel::new(&[ONE_NODE]);
        let transcripts = Arc::new(MemoryTranscript::new());
        let engine = MindmapEngine::new(
            EngineConfig::default().with_retry(2, Duration::from_millis(1)),
            Generator::new(model.clone(), ModelSettings::new("openai", "gpt-4.1")),
            transcripts.clone(),
            MindmapStore::new(Arc::new(MemoryRecordStore::new())),
        );
        engine.bind_session("s1").await;
        transcripts
            .append("s1", TranscriptTurn::new("me", "budget", None))
            .await
            .unwrap();

        let err = engine.run_cycle().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_pending_turns_drain_on_commit() {
        let (engine, transcripts) = engine_with(ScriptedModel::new(&[ONE_NODE])).await;
        engine.record_turn("me", "unbound turn").await;
        assert!(!engine.is_timer_armed().await);
        assert_eq!(engine.pending_turns().await.len(), 1);

        engine.bind_session("s1").await;
        assert!(engine.pending_turns().await.is_empty());

        transcripts
            .append("s1", TranscriptTurn::new("me", "budget", None))
            .await
            .unwrap();
        engine.inner.state.write().await.pending.push(TranscriptTurn::now("me", "budget"));
        engine.run_cycle().await.unwrap();
        assert!(engine.pending_turns().await.is_empty());
    }

    #[tokio::test]
    async fn test_unbind_clears_everything() {
        let (engine, _) = engine_with(ScriptedModel::new(&[ONE_NODE])).await;
        engine.bind_session("s1").await;
        engine.record_turn("me", "hello").await;
        assert!(engine.is_timer_armed().await);

        engine.unbind().await;
        assert!(!engine.is_timer_armed().await);
        assert!(engine.session_id().await.is_none());
        assert!(engine.pending_turns().await.is_empty());
        assert_eq!(engine.current_graph().await, Graph::default());
    }
}
