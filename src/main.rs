//! Mindmap CLI
//!
//! Drives the conversation graph engine from transcript files or stdin, and
//! exposes the merge and summarize utilities for graph files.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mindmap::{
    merge_delta, summarize, EngineConfig, EngineEvent, FileRecordStore, Generator, Graph,
    GraphDelta, JsonlTranscript, MindmapEngine, MindmapStore, TranscriptSource, TranscriptTurn,
};
use mindmap::model::HttpChatModel;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Mindmap - turn a live transcript into a bounded conversation graph
#[derive(Parser, Debug)]
#[command(name = "mindmap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to ~/.config/mindmap/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output: debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bind a session, feed it transcript turns and print each updated graph
    Run {
        /// Session id to bind
        #[arg(short, long)]
        session: String,

        /// JSONL file of {"speaker","text","start_at"} turns to import
        #[arg(short, long)]
        transcript: Option<PathBuf>,

        /// Also read `speaker: text` lines from stdin
        #[arg(long)]
        stdin: bool,

        /// Exit after the first update (or failure)
        #[arg(long)]
        once: bool,
    },

    /// Merge a delta ({nodes, edges}) into a graph file
    Merge {
        graph: PathBuf,
        delta: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Collapse the oldest nodes of a graph file into summary nodes
    Summarize {
        graph: PathBuf,

        /// Node budget (defaults to the configured max_nodes)
        #[arg(long)]
        max_nodes: Option<usize>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries graph JSON
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            session,
            transcript,
            stdin,
            once,
        } => run(config, &session, transcript.as_deref(), stdin, once).await,
        Command::Merge {
            graph,
            delta,
            output,
        } => {
            let existing: Graph = read_json(&graph).await?;
            let delta: GraphDelta = read_json(&delta).await?;
            let merged = merge_delta(&existing, &delta);
            info!(
                "Merged into v{}: {} nodes, {} edges",
                merged.metadata.version,
                merged.nodes.len(),
                merged.edges.len()
            );
            write_graph(&merged, output.as_deref()).await
        }
        Command::Summarize {
            graph,
            max_nodes,
            output,
        } => {
            let graph: Graph = read_json(&graph).await?;
            let bounded = summarize(&graph, max_nodes.unwrap_or(config.max_nodes));
            write_graph(&bounded, output.as_deref()).await
        }
    }
}

async fn run(
    config: EngineConfig,
    session_id: &str,
    import: Option<&Path>,
    read_stdin: bool,
    once: bool,
) -> anyhow::Result<()> {
    let model = Arc::new(HttpChatModel::new(&config.model)?);
    let generator = Generator::new(model, config.model.clone());

    let transcripts: Arc<dyn TranscriptSource> =
        Arc::new(JsonlTranscript::new(&config.data_dir.join("transcripts")).await?);
    let records = FileRecordStore::new(&config.data_dir.join("sessions")).await?;
    let store = MindmapStore::new(Arc::new(records));

    info!(
        "Using {}/{} (update every {:?}, data in {})",
        config.model.provider,
        config.model.model,
        config.update_interval,
        config.data_dir.display()
    );

    let engine = MindmapEngine::new(config, generator, transcripts.clone(), store);
    let mut events = engine.subscribe();

    engine.bind_session(session_id).await;
    if let Some(graph) = engine.load_from_persistence(session_id).await? {
        info!("Resuming mindmap v{}", graph.metadata.version);
    }

    if let Some(path) = import {
        let turns = read_turns(path).await?;
        info!("Importing {} turns from {}", turns.len(), path.display());
        for turn in turns {
            feed(&engine, transcripts.as_ref(), session_id, turn).await?;
        }
    }

    if read_stdin {
        let engine = engine.clone();
        let transcripts = transcripts.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(turn) = parse_stdin_turn(&line) else {
                    continue;
                };
                if let Err(e) = feed(&engine, transcripts.as_ref(), &session_id, turn).await {
                    error!("Failed to record turn: {}", e);
                }
            }
        });
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::Updated(graph)) => {
                    println!("{}", serde_json::to_string_pretty(&graph)?);
                    if once {
                        break;
                    }
                }
                Ok(EngineEvent::Status(status)) => {
                    warn!("{:?}: {}", status.kind, status.message);
                    if once && status.kind != mindmap::ErrorKind::NoTranscriptContent {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} engine events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    engine.unbind().await;
    Ok(())
}

/// Append to the stored transcript, then notify the engine.
async fn feed(
    engine: &MindmapEngine,
    transcripts: &dyn TranscriptSource,
    session_id: &str,
    turn: TranscriptTurn,
) -> mindmap::Result<()> {
    let (speaker, text) = (turn.speaker.clone(), turn.text.clone());
    transcripts.append(session_id, turn).await?;
    engine.record_turn(&speaker, &text).await;
    Ok(())
}

/// `speaker: text`, or bare text attributed to `me`.
fn parse_stdin_turn(line: &str) -> Option<TranscriptTurn> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.split_once(':') {
        Some((speaker, text)) if !speaker.trim().is_empty() && !speaker.contains(' ') => {
            Some(TranscriptTurn::now(speaker.trim(), text.trim()))
        }
        _ => Some(TranscriptTurn::now("me", line)),
    }
}

async fn read_turns(path: &Path) -> anyhow::Result<Vec<TranscriptTurn>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut turns = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptTurn>(line) {
            Ok(turn) => turns.push(turn),
            Err(e) => warn!("Skipping line {} of {}: {}", n + 1, path.display(), e),
        }
    }
    Ok(turns)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

async fn write_graph(graph: &Graph, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(graph)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
