use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use replicant_core::{Action, ActionEmitter, FeedEvent};
use replicant_reconcile::{fixture, spawn_engine, DryRunEmitter, EngineConfig, EngineHandle, Phase, StatusSnapshot};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "replicantctl", version, about = "Replica reconciler for label-selected pods")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Planning threads per pass (overrides REPLICANT_WORKERS)
    #[arg(long = "workers", global = true)]
    workers: Option<usize>,

    /// Actions per controller per pass (overrides REPLICANT_MAX_ACTIONS_PER_PASS)
    #[arg(long = "max-actions", global = true)]
    max_actions: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch pods and replication controllers and keep replica counts converged
    Run {
        /// Kubernetes namespace (default: all namespaces)
        #[arg(long = "ns", env = "REPLICANT_NAMESPACE")]
        namespace: Option<String>,
        /// Log intended creates/deletes instead of calling the API
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Reconcile the mock-0..N fixture in memory and print the result
    Simulate {
        /// Number of mock pods
        #[arg(long = "count", default_value_t = 1000)]
        count: u64,
        /// Delete a pod (e.g. mock-1) after the first convergence; repeatable
        #[arg(long = "delete")]
        delete: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("REPLICANT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REPLICANT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REPLICANT_METRICS_ADDR; expected host:port");
        }
    }
}

fn converged(s: &StatusSnapshot) -> bool {
    !s.controllers.is_empty() && s.in_flight == 0 && s.controllers.iter().all(|c| c.phase == Phase::Converged)
}

/// Wait until every controller converged or the deadline passes; returns the last snapshot.
async fn settle(handle: &EngineHandle, after: u64, wait: Duration) -> Arc<StatusSnapshot> {
    let mut rx = handle.subscribe_epoch();
    let _ = tokio::time::timeout(wait, async {
        loop {
            let snap = handle.current();
            if snap.epoch > after && converged(&snap) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    handle.current()
}

fn render(snap: &StatusSnapshot, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<11} {:<24} {:<28} {:>7} {:>7}  PHASE", "NAMESPACE", "CONTROLLER", "SELECTOR", "MATCHED", "DESIRED");
            for c in snap.controllers.iter() {
                let phase = match (c.phase, c.paused) {
                    (_, true) => "Paused",
                    (Phase::Converged, _) => "Converged",
                    (Phase::ActionsPending, _) => "ActionsPending",
                    (Phase::Evaluating, _) => "Evaluating",
                };
                println!(
                    "{:<11} {:<24} {:<28} {:>7} {:>7}  {}",
                    c.key.namespace, c.key.name, c.selector, c.matched, c.desired, phase
                );
                if let Some(err) = &c.last_error {
                    println!("  last error: {}", err);
                }
            }
            println!("resources: {}  in-flight: {}  epoch: {}", snap.resources, snap.in_flight, snap.world_epoch);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(snap)?),
    }
    Ok(())
}

fn print_summary(stage: &str, actions: &[Action]) {
    let creates = actions.iter().filter(|a| matches!(a, Action::Create(_))).count();
    println!("{}: {} actions ({} creates, {} deletes)", stage, actions.len(), creates, actions.len() - creates);
}

fn mock_index(name: &str) -> Result<u64> {
    name.strip_prefix("mock-")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("unknown fixture pod `{}` (expected mock-<n>)", name))
}

async fn simulate(cfg: EngineConfig, count: u64, delete: Vec<String>, output: Output) -> Result<()> {
    let wait = wait_budget();
    let deletes = delete.iter().map(|n| mock_index(n)).collect::<Result<Vec<_>>>()?;
    let emitter = Arc::new(DryRunEmitter::new());
    let (tx, handle) = spawn_engine(cfg, emitter.clone());
    for ev in fixture::population(count) {
        tx.send(ev).await.context("engine stopped while loading fixture")?;
    }
    let snap = settle(&handle, 0, wait).await;
    let first = emitter.take();
    info!(actions = first.len(), "fixture converged");
    if output == Output::Human {
        print_summary("initial", &first);
    }

    if !deletes.is_empty() {
        for n in deletes.iter() {
            tx.send(FeedEvent::Change(fixture::delete_pod(*n))).await.context("engine stopped")?;
        }
        settle(&handle, snap.epoch, wait).await;
        let after = emitter.take();
        info!(actions = after.len(), "deletions reconciled");
        if output == Output::Human {
            print_summary("after deletes", &after);
        }
    }

    drop(tx);
    let last = handle.stopped().await;
    render(&last, output)
}

async fn run(cfg: EngineConfig, namespace: Option<String>, dry_run: bool, output: Output) -> Result<()> {
    let client = kube::Client::try_default().await.context("connecting to cluster")?;
    let emitter: Arc<dyn ActionEmitter> = if dry_run {
        Arc::new(DryRunEmitter::new())
    } else {
        Arc::new(replicant_kubehub::KubeEmitter::new(client.clone()))
    };
    let (tx, handle) = spawn_engine(cfg, emitter);
    let watcher = tokio::spawn({
        let tx: mpsc::Sender<FeedEvent> = tx.clone();
        async move {
            if let Err(e) = replicant_kubehub::start_watchers(client, namespace.as_deref(), tx).await {
                error!(error = ?e, "watchers failed");
            }
        }
    });
    drop(tx);

    let mut epochs = handle.subscribe_epoch();
    let mut last_line = String::new();
    loop {
        tokio::select! {
            changed = epochs.changed() => {
                if changed.is_err() { break; }
                let snap = handle.current();
                let line = snap.controllers.iter().map(|c| format!("{}={}/{}", c.key.name, c.matched, c.desired)).collect::<Vec<_>>().join(" ");
                if line != last_line && output == Output::Human {
                    println!("{}", line);
                    last_line = line;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; draining in-flight actions");
                break;
            }
        }
    }
    // The watcher task owns the last feed sender.
    watcher.abort();
    let last = handle.stopped().await;
    render(&last, output)
}

fn wait_budget() -> Duration {
    let secs = std::env::var("REPLICANT_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut cfg = EngineConfig::from_env();
    if let Some(w) = cli.workers { cfg.workers = w.max(1); }
    if let Some(m) = cli.max_actions { cfg.max_actions_per_pass = m.max(1); }
    info!(?cfg, "engine config");

    match cli.command {
        Commands::Run { namespace, dry_run } => run(cfg, namespace, dry_run, cli.output).await,
        Commands::Simulate { count, delete } => simulate(cfg, count, delete, cli.output).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulate_flags() {
        let cli = Cli::try_parse_from(["replicantctl", "-o", "json", "simulate", "--count", "30", "--delete", "mock-1", "--delete", "mock-3"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Simulate { count, delete } => {
                assert_eq!(count, 30);
                assert_eq!(delete, vec!["mock-1", "mock-3"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn mock_names_resolve_to_fixture_indexes() {
        assert_eq!(mock_index("mock-17").unwrap(), 17);
        assert!(mock_index("web-1").is_err());
    }
}
