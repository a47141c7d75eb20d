use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use archivist_core::{ArchivistConfig, ArchivistError, ClusterConfig};
use archivist_monitor::{CapacityReport, ClusterMonitor, MonitorSources};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "archivist", version, about = "Namespace activity monitor and archival selector")]
struct Cli {
    /// Config file (YAML); built-in defaults when omitted
    #[arg(short = 'c', long = "config", global = true, env = "ARCHIVIST_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Cluster entry to use (default: the first configured)
    #[arg(long = "cluster", global = true)]
    cluster: Option<String>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitor until Ctrl-C
    Monitor,
    /// Sync once, run a single capacity check and print the report
    Evaluate,
    /// Print the last activity time of a namespace
    LastActivity {
        namespace: String,
    },
}

#[derive(Serialize)]
struct ActivityOut<'a> {
    namespace: &'a str,
    last_activity: Option<DateTime<Utc>>,
}

fn init_tracing(config_level: &str) {
    let env = std::env::var("ARCHIVIST_LOG").unwrap_or_else(|_| config_level.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARCHIVIST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARCHIVIST_METRICS_ADDR; expected host:port");
        }
    }
}

/// Read the config, hand it to `before_validate` (which installs logging), then validate,
/// so validation warnings reach the subscriber.
fn load_config(path: Option<&std::path::Path>, before_validate: impl FnOnce(&ArchivistConfig)) -> Result<ArchivistConfig> {
    let config = match path {
        Some(p) => ArchivistConfig::read_file(p)?,
        None => ArchivistConfig::default(),
    };
    before_validate(&config);
    config.validate()?;
    Ok(config)
}

async fn build_monitor(cluster: ClusterConfig) -> Result<Arc<ClusterMonitor>> {
    let client = archivist_kubehub::connect().await?;
    let sources = MonitorSources {
        namespaces: Arc::new(archivist_kubehub::namespace_source(client.clone())),
        builds: Arc::new(archivist_kubehub::build_source(client.clone())),
        replica_sets: Arc::new(archivist_kubehub::replication_controller_source(client)),
    };
    Ok(Arc::new(ClusterMonitor::new(cluster, sources)))
}

/// Start the subscriptions and wait until every mirror has synced, at least the
/// configured warm-up and at most ARCHIVIST_WAIT_SECS (default 30s).
async fn sync_mirrors(monitor: &ClusterMonitor, stop: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
    let tasks = monitor.start_subscriptions(stop);
    let wait_secs = std::env::var("ARCHIVIST_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
    let started = Instant::now();
    let deadline = started + Duration::from_secs(wait_secs).max(monitor.cluster().warmup());
    tokio::time::sleep(monitor.cluster().warmup()).await;
    while !monitor.synced() {
        if Instant::now() >= deadline {
            warn!(wait_secs, "mirrors not synced before deadline; results may be incomplete");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, synced = monitor.synced(), "mirror sync finished");
    tasks
}

async fn shutdown(stop: CancellationToken, tasks: Vec<tokio::task::JoinHandle<()>>) {
    stop.cancel();
    for t in tasks {
        if let Err(e) = t.await {
            error!(error = %e, "subscription task failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), |c| init_tracing(&c.log_level))?;
    init_metrics();
    let cluster = config.cluster(cli.cluster.as_deref())?.clone();
    info!(cluster = %cluster.name, "config loaded");

    match cli.command {
        Commands::Monitor => {
            let monitor = build_monitor(cluster).await?;
            let stop = CancellationToken::new();
            let run = tokio::spawn(Arc::clone(&monitor).run(stop.clone()));
            match signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received; stopping monitor"),
                Err(e) => error!(error = %e, "failed to listen for Ctrl-C; stopping monitor"),
            }
            stop.cancel();
            run.await.context("monitor task")?;
        }
        Commands::Evaluate => {
            let monitor = build_monitor(cluster).await?;
            let stop = CancellationToken::new();
            let tasks = sync_mirrors(&monitor, &stop).await;
            let res = monitor.check_capacity();
            shutdown(stop, tasks).await;
            let report = res?;
            match cli.output {
                Output::Human => print_report(&report),
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::LastActivity { namespace } => {
            let monitor = build_monitor(cluster).await?;
            let stop = CancellationToken::new();
            let tasks = sync_mirrors(&monitor, &stop).await;
            let res = monitor.get_last_activity(&namespace);
            shutdown(stop, tasks).await;
            let last = match res {
                Ok(t) => t,
                Err(ArchivistError::NotFound { namespace }) => {
                    eprintln!("namespace not found: {}", namespace);
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            };
            match cli.output {
                Output::Human => match last {
                    Some(t) => println!("{}  {}  ({} ago)", namespace, t.to_rfc3339(), render_age(t)),
                    None => println!("{}  no activity", namespace),
                },
                Output::Json => {
                    let out = ActivityOut { namespace: &namespace, last_activity: last };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
    }

    Ok(())
}

fn print_report(r: &CapacityReport) {
    if let Some(reason) = r.skipped {
        println!("capacity check skipped: {:?}", reason);
        return;
    }
    println!(
        "namespaces: {} total, {} protected, {} without activity, {} very inactive, {} somewhat inactive",
        r.total_namespaces, r.protected, r.no_activity, r.very_inactive, r.somewhat_inactive
    );
    println!("remaining after archival: {} (low watermark reached: {})", r.remaining, r.low_watermark_reached);
    if r.candidates.is_empty() {
        println!("no namespaces to archive");
        return;
    }
    println!("{:<40} {:<27} AGE", "NAMESPACE", "LAST ACTIVITY");
    for c in &r.candidates {
        println!("{:<40} {:<27} {}", c.namespace, c.time.to_rfc3339(), render_age(c.time));
    }
}

fn render_age(t: DateTime<Utc>) -> String {
    let mut secs = (Utc::now() - t).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
