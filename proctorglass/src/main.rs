// proctorglass/src/main.rs
//
// Proctorglass — interview proctoring risk & code-originality scoring
//
// Two operational modes:
//   tail    — tail a JSONL telemetry feed written by the session gateway
//   replay  — replay a captured feed at scaled speed (testing/research)
//
// Usage:
//   proctorglass --mode tail --path /var/log/proctor/feed.jsonl
//   proctorglass --mode replay --path captured.jsonl --speed 10.0
//   proctorglass --mode tail --store /var/lib/proctorglass/scores.jsonl

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use proctorglass::engine::combiner::risk_level;
use proctorglass::events::{EventKind, RiskLevel, TelemetryEvent};
use proctorglass::store::{JsonlStore, KvStore, MemoryStore};
use proctorglass::{Config, ProctoringService};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "proctorglass",
    about   = "Interview proctoring risk & code-originality scoring",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/proctorglass_feed.jsonl",
          help = "JSONL telemetry feed path")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,

    #[arg(long, help = "Durable score store (JSONL); in-memory if omitted")]
    store: Option<PathBuf>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,   // tail a live JSONL feed
    Replay, // replay a static JSONL file at scaled speed
}

// ── Feed records ──────────────────────────────────────────────────────────────
// The gateway writes two record shapes into one feed: behavioral event
// batches and code snapshots.

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    timestamp: i64, // epoch milliseconds
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsBatch {
    session_id: String,
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeSnapshot {
    session_id: String,
    task_id: String,
    code: String,
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "python".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedRecord {
    Events(EventsBatch),
    Code(CodeSnapshot),
}

fn to_event(session_id: &str, wire: WireEvent) -> TelemetryEvent {
    TelemetryEvent {
        session_id: session_id.to_string(),
        kind: wire.kind,
        timestamp: DateTime::<Utc>::from_timestamp_millis(wire.timestamp)
            .unwrap_or_else(Utc::now),
        metadata: wire.metadata,
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

async fn process(svc: &ProctoringService, record: FeedRecord) {
    match record {
        FeedRecord::Events(batch) => {
            let events: Vec<TelemetryEvent> = batch
                .events
                .into_iter()
                .map(|w| to_event(&batch.session_id, w))
                .collect();
            let outcome = svc.ingest_events(&batch.session_id, events).await;
            if !outcome.patterns.is_empty() {
                info!(
                    session = %outcome.session_id,
                    rule_score = outcome.rule_score,
                    patterns = outcome.patterns.len(),
                    "suspicious patterns firing"
                );
            }
        }
        FeedRecord::Code(snapshot) => {
            let verdict = svc
                .submit_code(
                    &snapshot.session_id,
                    &snapshot.task_id,
                    &snapshot.code,
                    &snapshot.language,
                )
                .await;
            info!(
                session = %snapshot.session_id,
                task = %snapshot.task_id,
                originality = verdict.score,
                method = %verdict.method,
                cached = verdict.cached,
                "code snapshot analyzed"
            );
        }
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m  proctorglass\x1b[0m — interview risk & originality scoring");
    println!("  \x1b[90mgithub.com/m0rs3c0d3/proctorglass\x1b[0m\n");
}

fn print_score_update(session_id: &str, final_score: u8, flagged: &std::collections::BTreeSet<String>) {
    let level = risk_level(final_score);
    if matches!(level, RiskLevel::Minimal | RiskLevel::Low) {
        return;
    }
    let color = match level {
        RiskLevel::Critical => "\x1b[91;1m",
        RiskLevel::High => "\x1b[93;1m",
        _ => "\x1b[96m",
    };
    let reset = "\x1b[0m";
    let flags = flagged.iter().cloned().collect::<Vec<_>>().join(" | ");
    println!("\n{}{} risk={}{}", color, level, final_score, reset);
    println!("  Session : {color}{session_id}{reset}");
    println!("  Flagged : {flags}");
}

async fn print_stats_loop(svc: Arc<ProctoringService>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let events = svc.total_events();
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  events={}  eps={:.1}  sessions={}  corpus={} ──\x1b[0m",
            elapsed,
            events,
            events as f64 / elapsed,
            svc.n_sessions(),
            svc.corpus_len()
        );
    }
}

// ── Feed sources ──────────────────────────────────────────────────────────────

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<FeedRecord>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {} // consume existing
    }

    info!("Tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<FeedRecord>(line) {
                    Ok(rec) => {
                        if tx.send(rec).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Parse error: {}", e),
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<FeedRecord>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    let mut records: Vec<(f64, FeedRecord)> = Vec::new();
    let mut last_ts = 0.0f64;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(rec) = serde_json::from_str::<FeedRecord>(line) {
            // Event batches carry their own clock; code snapshots ride on
            // the previous record's.
            if let FeedRecord::Events(ref batch) = rec {
                if let Some(first) = batch.events.first() {
                    last_ts = first.timestamp as f64;
                }
            }
            records.push((last_ts, rec));
        }
    }

    if records.is_empty() {
        return Ok(());
    }

    let base_ts = records[0].0;
    let base_wall = Instant::now();

    for (ts, mut record) in records {
        let offset = (ts - base_ts) / speed / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset.max(0.0));
        let now = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        // Re-stamp so replayed events land inside the live analysis window.
        if let FeedRecord::Events(ref mut batch) = record {
            let now_ms = Utc::now().timestamp_millis();
            for ev in batch.events.iter_mut() {
                ev.timestamp = now_ms;
            }
        }
        if tx.send(record).await.is_err() {
            break;
        }
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("proctorglass=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env();

    let store: Arc<dyn KvStore> = match &cli.store {
        Some(path) => Arc::new(JsonlStore::open(path).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let svc = ProctoringService::new(
        cfg,
        store,
        Some(Arc::new(
            |session_id: &str, final_score: u8, flagged: &std::collections::BTreeSet<String>| {
                print_score_update(session_id, final_score, flagged);
            },
        )),
    );
    let start = Instant::now();
    let (tx, mut rx) = mpsc::channel::<FeedRecord>(16384);

    print_banner();

    // Stats printer
    tokio::spawn(print_stats_loop(Arc::clone(&svc), start));

    // Housekeeping
    tokio::spawn(svc.state_store().housekeeping_loop());

    // Feed source
    match cli.mode {
        Mode::Tail => {
            println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.path.display());
            let path = cli.path.clone();
            tokio::spawn(async move {
                tail_jsonl(path, tx, true).await.ok();
            });
        }
        Mode::Replay => {
            println!(
                "  Mode: \x1b[93mREPLAY\x1b[0m  |  {}  speed={:.1}x",
                cli.path.display(),
                cli.speed
            );
            let path = cli.path.clone();
            let speed = cli.speed;
            tokio::spawn(async move {
                replay_jsonl(path, tx, speed).await.ok();
            });
        }
    }

    println!("  Press Ctrl+C to stop.\n");

    // Main consumer — one task per record for parallelism across sessions
    while let Some(record) = rx.recv().await {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move {
            process(&svc, record).await;
        });
    }

    Ok(())
}
