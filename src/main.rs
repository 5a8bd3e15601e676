use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use feedlink_client::{ConnectionConfig, LoopbackConnection};
use feedlink_core::config::{AppConfig, ConnectionDef, LogFormat, LoggingConfig};
use feedlink_core::types::ClusterNodeInfo;
use feedlink_pool::{IntegrationManager, MetricsConfig, MetricsExporter};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// feedlink - connection lifecycle and traffic management for streaming feeds
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FEEDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,

    /// Interval between simulated inbound messages per feed, in milliseconds
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_config_builder(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.filter_directives()))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(logging.file_line)
        .with_line_number(logging.file_line);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

/// Registers one configured feed on a loopback transport.
async fn register_feed(manager: &IntegrationManager, def: &ConnectionDef) -> Option<Arc<LoopbackConnection>> {
    let mut config = ConnectionConfig::new(def.id.clone(), def.class)
        .with_endpoint(def.endpoint.clone())
        .connect_on_register(true);
    if let Some(weight) = def.weight {
        config = config.with_weight(weight);
    }
    if let Some(node) = &def.node {
        config = config.with_owner(node.clone());
    }

    let conn = Arc::new(LoopbackConnection::new(config.clone()));
    if !manager.register_connection(conn.clone(), config).await {
        warn!(connection_id = %def.id, "Skipping feed that failed to register");
        return None;
    }
    for channel in &def.channels {
        if !manager.subscribe(&def.id, channel).await {
            warn!(connection_id = %def.id, channel = %channel, "Subscription failed");
        }
    }
    Some(conn)
}

/// Injects traffic with jittered latency into a loopback feed.
fn simulate_feed(conn: Arc<LoopbackConnection>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        let base_latency = rand::thread_rng().gen_range(5.0..40.0);
        let mut seq: u64 = 0;
        loop {
            interval.tick().await;
            seq += 1;
            let latency = {
                let mut rng = rand::thread_rng();
                base_latency + rng.gen_range(-2.0..2.0f64)
            };
            conn.set_latency(Some(latency.max(0.1)));
            conn.inject_message(Bytes::from(format!("{{\"seq\":{seq}}}")));
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    if args.check {
        println!("Configuration OK");
        return Ok(());
    }

    init_logging(&config.logging)?;
    info!(
        app = %config.app.name,
        node_id = %config.app.node_id,
        connections = config.connections.len(),
        "Starting feedlink"
    );

    let mut exporter = MetricsExporter::new(MetricsConfig::from_settings(&config.metrics)?);
    if let Err(e) = exporter.init() {
        error!(error = %e, "Failed to start metrics exporter, continuing without it");
    }

    let manager = IntegrationManager::new(config.clone()).context("Failed to build manager")?;

    let mut nodes: Vec<&String> = config.connections.iter().filter_map(|c| c.node.as_ref()).collect();
    nodes.sort();
    nodes.dedup();
    for node in nodes {
        if *node != config.app.node_id {
            manager.register_cluster_node(ClusterNodeInfo::new(node.clone(), "unknown"));
        }
    }

    manager.start().context("Failed to start background tasks")?;

    let tick = Duration::from_millis(args.tick_ms.max(1));
    let mut simulators = Vec::new();
    for def in &config.connections {
        if let Some(conn) = register_feed(&manager, def).await {
            simulators.push(simulate_feed(conn, tick));
        }
    }
    info!(feeds = simulators.len(), "Feeds registered");

    let mut report = tokio::time::interval(config.app.report_interval());
    report.tick().await;
    loop {
        tokio::select! {
            _ = report.tick() => {
                let overview = manager.get_system_overview();
                match serde_json::to_string_pretty(&overview) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "Failed to render overview"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal, stopping feedlink...");
                break;
            }
        }
    }

    for simulator in simulators {
        simulator.abort();
    }
    manager.shutdown().await;
    info!("feedlink stopped");
    Ok(())
}
