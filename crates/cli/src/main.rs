use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_apply::{Applier, ApplierOptions, Event, ItemOutcome, Manifest};
use berth_core::ObjId;
use berth_status::{PollOptions, PollerEngine, StatusEvent, StatusPoller};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "berth", version, about = "Declarative cluster apply")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a manifest set and stream progress until it terminates
    Apply {
        /// Files or directories containing YAML manifests
        #[arg(short = 'f', long = "filename", required = true)]
        paths: Vec<PathBuf>,
        /// Wait for every applied resource to reach Current
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Wait timeout in seconds
        #[arg(long = "timeout", default_value_t = 300)]
        timeout_secs: u64,
        /// Status poll interval in milliseconds
        #[arg(long = "poll-interval-ms")]
        poll_interval_ms: Option<u64>,
        /// Keep previously applied resources that left the set
        #[arg(long = "no-prune", action = ArgAction::SetTrue)]
        no_prune: bool,
        /// Server-side dry run; prune deletions are skipped too
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// One GET per resource per cycle instead of the per-kind list cache
        #[arg(long = "no-cache", action = ArgAction::SetTrue)]
        no_cache: bool,
    },
    /// Poll resource statuses until they all reach Current
    Status {
        /// Identifiers in namespace_name_group_kind form
        #[arg(required = true)]
        identifiers: Vec<String>,
        /// Status poll interval in milliseconds
        #[arg(long = "poll-interval-ms")]
        poll_interval_ms: Option<u64>,
        /// Keep polling until interrupted instead of stopping at Current
        #[arg(long = "watch", action = ArgAction::SetTrue)]
        watch: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("BERTH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BERTH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid BERTH_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            paths,
            wait,
            timeout_secs,
            poll_interval_ms,
            no_prune,
            dry_run,
            no_cache,
        } => {
            let manifests = load_manifests(&paths)?;
            info!(count = manifests.len(), "manifests loaded");

            let mut options = ApplierOptions {
                wait: wait.then(|| Duration::from_secs(timeout_secs)),
                prune: !no_prune,
                dry_run,
                ..ApplierOptions::default()
            };
            if let Some(ms) = poll_interval_ms {
                options.poll_interval = Duration::from_millis(ms);
            }
            if no_cache {
                options.use_cache = false;
            }

            let applier = Applier::for_cluster(options).await?;
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight work");
                    signal_cancel.cancel();
                }
            });

            let mut rx = applier.run(cancel, manifests);
            let mut failed = false;
            while let Some(event) = rx.recv().await {
                if matches!(event, Event::Error { .. }) {
                    failed = true;
                }
                match cli.output {
                    Output::Human => println!("{}", render(&event)),
                    Output::Json => println!("{}", serde_json::to_string(&event)?),
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Status { identifiers, poll_interval_ms, watch } => {
            let ids = identifiers
                .iter()
                .map(|s| s.parse::<ObjId>().with_context(|| format!("parsing identifier {s:?}")))
                .collect::<Result<Vec<ObjId>>>()?;

            let mut options = PollOptions { poll_until_cancelled: watch, ..PollOptions::default() };
            if let Some(ms) = poll_interval_ms {
                options.poll_interval = Duration::from_millis(ms);
            }

            let client = berth_kubehub::get_kube_client().await?;
            let engine = PollerEngine::for_cluster(client);
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_cancel.cancel();
                }
            });

            let mut rx = engine.poll(cancel, ids, options);
            let mut failed = false;
            while let Some(event) = rx.recv().await {
                match &event {
                    StatusEvent::ResourceUpdate(obs) => match cli.output {
                        Output::Human => println!("{} is {}", display(&obs.id), obs.status),
                        Output::Json => println!(
                            "{}",
                            serde_json::json!({
                                "id": obs.id,
                                "status": obs.status,
                                "message": obs.message,
                            })
                        ),
                    },
                    StatusEvent::Completed => println!("all resources reconciled"),
                    StatusEvent::Aborted => println!("polling stopped"),
                    StatusEvent::Error(e) => {
                        failed = true;
                        eprintln!("polling error: {e}");
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn display(id: &ObjId) -> String {
    if id.namespace.is_empty() {
        format!("{}/{}", id.group_kind(), id.name)
    } else {
        format!("{}/{} ({})", id.group_kind(), id.name, id.namespace)
    }
}

fn render(event: &Event) -> String {
    match event {
        Event::Init { groups } => {
            let total: usize = groups.iter().map(|g| g.identifiers.len()).sum();
            format!("applying {} object(s)", total)
        }
        Event::ApplyItem { id, outcome: ItemOutcome::Succeeded } => {
            format!("applied {}", display(id))
        }
        Event::ApplyItem { id, outcome: ItemOutcome::Failed(msg) } => {
            format!("apply failed {}: {}", display(id), msg)
        }
        Event::ApplyCompleted => "apply complete".to_string(),
        Event::Status { id, status } => format!("{} is {}", display(id), status),
        Event::StatusCompleted => "all resources reconciled".to_string(),
        Event::PruneItem { id, outcome: ItemOutcome::Succeeded } => {
            format!("pruned {}", display(id))
        }
        Event::PruneItem { id, outcome: ItemOutcome::Failed(msg) } => {
            format!("prune failed {}: {}", display(id), msg)
        }
        Event::PruneCompleted => "prune complete".to_string(),
        Event::Error { error } => format!("error ({}): {}", error.kind(), error),
    }
}

/// Reads every YAML document under the given files or directories, in path
/// order, and parses each into a manifest.
fn load_manifests(paths: &[PathBuf]) -> Result<Vec<Manifest>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for path in paths {
        collect_yaml_files(path, &mut files)?;
    }
    files.sort();

    let mut manifests = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(doc)
                .with_context(|| format!("parsing YAML in {}", file.display()))?;
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_value(value)
                .with_context(|| format!("converting YAML in {}", file.display()))?;
            let manifest = Manifest::from_json(json)
                .with_context(|| format!("invalid manifest in {}", file.display()))?;
            manifests.push(manifest);
        }
    }
    Ok(manifests)
}

fn collect_yaml_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.is_dir() {
        for entry in
            std::fs::read_dir(path).with_context(|| format!("reading {}", path.display()))?
        {
            collect_yaml_files(&entry?.path(), out)?;
        }
    } else if matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    ) {
        out.push(path.to_path_buf());
    }
    Ok(())
}
