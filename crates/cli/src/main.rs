use std::io::Read as _;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_cluster::{Cluster, KubeCluster};
use keel_manifests::parse_multidoc;
use keel_sync::{Reconciler, SyncOptions};

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel GitOps sync CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace whitelist (comma separated); empty means all namespaces
    #[arg(long = "ns-whitelist", global = true, value_delimiter = ',')]
    ns_whitelist: Vec<String>,

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
    /// Check that the API server is reachable
    Ping,
    /// List the namespaces the reconciler may look inside
    Namespaces,
    /// Print the cluster snapshot used for planning
    Export,
    /// List controllers of a kind, with attached sync errors
    Controllers {
        /// Controller kind, e.g. "Deployment"
        kind: String,
        /// Restrict to one namespace
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    /// Run one reconciliation round from a multi-doc manifest stream
    Sync {
        /// Manifest file, or "-" for stdin
        file: PathBuf,
        /// Delete stack-owned resources missing from the stream
        #[arg(long, action = ArgAction::SetTrue)]
        deletes: bool,
        /// Skip stack/checksum stamping
        #[arg(long = "no-tracks", action = ArgAction::SetTrue)]
        no_tracks: bool,
        /// Garbage-collect stack resources with out-of-date checksums
        #[arg(long, action = ArgAction::SetTrue)]
        gc: bool,
    },
}

fn read_manifests(file: &PathBuf) -> Result<Vec<u8>> {
    if file.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("reading manifests from stdin")?;
        Ok(buf)
    } else {
        std::fs::read(file).with_context(|| format!("reading {}", file.display()))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cluster = Arc::new(KubeCluster::connect(cli.ns_whitelist.clone()).await?);

    match cli.command {
        Commands::Ping => {
            cluster.ping().await?;
            println!("ok");
        }
        Commands::Namespaces => {
            let namespaces = cluster.list_namespaces().await?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&namespaces)?),
                Output::Human => {
                    for ns in namespaces {
                        println!("{ns}");
                    }
                }
            }
        }
        Commands::Export => {
            let bytes = cluster.export().await?;
            print!("{}", String::from_utf8_lossy(&bytes));
        }
        Commands::Controllers { kind, namespace } => {
            let rec = Reconciler::new(cluster.clone(), false);
            let controllers = rec.controllers(namespace.as_deref(), &kind).await?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&controllers)?),
                Output::Human => {
                    for c in controllers {
                        match c.sync_error {
                            Some(err) => println!("{}\terror: {}", c.id, err),
                            None => println!("{}", c.id),
                        }
                    }
                }
            }
        }
        Commands::Sync { file, deletes, no_tracks, gc } => {
            let bytes = read_manifests(&file)?;
            let source = if file.as_os_str() == "-" { "stdin".to_string() } else { file.display().to_string() };
            let repo = parse_multidoc(&bytes, &source)?;
            info!(resources = repo.len(), source = %source, "repo set loaded");

            let cancel = CancellationToken::new();
            let ctrlc = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    ctrlc.cancel();
                }
            });

            let rec = Reconciler::new(cluster.clone(), gc);
            let opts = SyncOptions { tracks: !no_tracks, deletes };
            let summary = rec.sync(&repo, opts, &cancel).await?;

            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                Output::Human => {
                    println!("applied: {}  deleted: {}", summary.applied, summary.deleted);
                    if !summary.errors.is_empty() {
                        eprintln!("{}", summary.errors);
                    }
                }
            }
            if !summary.errors.is_empty() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
