//! CLI entry point for the tributary ingest service.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use tributary_core::{KnowledgeSink, SchemaRegistry};
use tributary_deadletter::{DeadLetterStore, FileDeadLetterStore};
use tributary_graph::{GraphClient, GraphConfig, MemoryGraph};

use tributary_ingest::broker::{AmqpTransport, BrokerTransport, MemoryBroker};
use tributary_ingest::{
    BrokerAdapter, BrokerConfig, IngestConfig, IngestService, ServiceHandle, SharedRegistry,
    Transformer,
};

#[derive(Parser)]
#[command(name = "tributary-ingest")]
#[command(about = "Stream broker messages into the knowledge graph")]
struct Cli {
    /// Config file prefix (default: tributary).
    #[arg(short, long, default_value = "tributary")]
    config: String,

    /// Override the topic to consume.
    #[arg(short, long)]
    topic: Option<String>,

    /// Replay a JSONL file (one payload per line) instead of consuming from the broker.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Write to an in-memory graph instead of Neo4j.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();

    let cfg = tributary_core::config::load_layered(&cli.config)?;
    let mut ingest_config: IngestConfig = tributary_core::config::section(&cfg, "ingest")?;
    let broker_config: BrokerConfig = tributary_core::config::section(&cfg, "broker")?;
    let graph_config: GraphConfig = tributary_core::config::section(&cfg, "neo4j")?;
    if let Some(topic) = cli.topic.clone() {
        ingest_config.topic = topic;
    }
    ingest_config.validate().context("invalid ingest config")?;

    let registry = SchemaRegistry::load(&ingest_config.schema_path)
        .with_context(|| format!("loading schema mappings from {}", ingest_config.schema_path))?;
    tracing::info!(
        path = %ingest_config.schema_path,
        mappings = registry.mappings.len(),
        "Schema mappings loaded"
    );
    let registry = SharedRegistry::new(registry);

    let sink: Arc<dyn KnowledgeSink> = if cli.dry_run {
        tracing::info!("Dry run: writing to in-memory graph");
        Arc::new(MemoryGraph::new())
    } else {
        let graph = GraphClient::connect(&graph_config).await?;
        graph.ensure_schema().await?;
        tracing::info!(uri = %graph_config.uri, "Connected to Neo4j");
        Arc::new(graph)
    };

    let dead_letters: Arc<dyn DeadLetterStore> =
        Arc::new(FileDeadLetterStore::new(&ingest_config.dead_letter_dir)?);

    let replay = match &cli.replay {
        Some(path) => Some(replay_broker(path, &ingest_config.topic)?),
        None => None,
    };
    let transport: Arc<dyn BrokerTransport> = match &replay {
        Some(broker) => Arc::new(broker.clone()),
        None => Arc::new(AmqpTransport::new()),
    };

    let adapter = Arc::new(BrokerAdapter::new(
        broker_config,
        transport,
        ingest_config.buffer_capacity,
    ));
    let stats_interval = Duration::from_secs(ingest_config.stats_interval_secs);
    let schema_path = ingest_config.schema_path.clone();
    let topic = ingest_config.topic.clone();

    let service = IngestService::new(
        ingest_config,
        adapter,
        Transformer::new(registry.clone()),
        sink,
        dead_letters,
    );
    let handle = service.handle();

    let mut background = vec![
        tokio::spawn(log_stats(handle.clone(), stats_interval)),
        tokio::spawn(shutdown_on_signal(handle.clone())),
        tokio::spawn(reload_on_hangup(registry, schema_path)),
    ];
    if let Some(broker) = replay {
        let handle = handle.clone();
        background.push(tokio::spawn(async move {
            broker.wait_until_drained(&topic).await;
            tracing::info!(topic = %topic, "Replay drained");
            handle.shutdown();
        }));
    }

    let outcome = service.run().await;
    for task in background {
        task.abort();
    }

    let status = handle.status();
    tracing::info!(status = %serde_json::to_string(&status)?, "Final status");
    outcome?;
    Ok(())
}

fn replay_broker(path: &Path, topic: &str) -> anyhow::Result<MemoryBroker> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading replay file {}", path.display()))?;
    let broker = MemoryBroker::new();
    let mut count = 0usize;
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        broker.publish(topic, line.as_bytes().to_vec());
        count += 1;
    }
    tracing::info!(path = %path.display(), messages = count, "Replay loaded");
    Ok(broker)
}

async fn log_stats(handle: ServiceHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let status = handle.status();
        tracing::info!(
            state = %status.state,
            connection = ?status.connection.state,
            received = status.stats.received,
            committed = status.stats.committed,
            dead_lettered = status.stats.dead_lettered,
            retries = status.stats.retries,
            in_flight = status.stats.in_flight,
            pending_acks = status.acks.pending,
            withheld_acks = status.acks.withheld,
            blocked_on = status.acks.blocked_on.as_deref().unwrap_or("-"),
            success_rate = status.stats.success_rate,
            throughput_per_sec = status.stats.throughput_per_sec,
            "Ingest stats"
        );
    }
}

async fn shutdown_on_signal(handle: ServiceHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown signal received");
    handle.shutdown();
}

#[cfg(unix)]
async fn reload_on_hangup(registry: SharedRegistry, path: String) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "SIGHUP handler unavailable; schema reload disabled");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match registry.reload(&path) {
            Ok(()) => tracing::info!(path = %path, "Schema mappings reloaded"),
            Err(e) => tracing::error!(path = %path, error = %e, "Schema reload failed; keeping previous mappings"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_registry: SharedRegistry, _path: String) {}
