use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use portd::config::{load_config, AppConfig};
use portd::logging::init_tracing;
use portd::registry::{parse_index, sync::LatestVersions, Registry};
use portd::server::run_http_server;

/// portd: tracks FreeBSD ports generated from CRAN and PIP packages
#[derive(Parser)]
#[command(name = "portd")]
#[command(
    about = "Port and patch registry for FreeBSD ports generated from upstream package ecosystems."
)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "PORTD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Web API and the patch pipeline
    Serve,
    /// Reconcile the registry with a ports-tree INDEX
    Sync {
        /// Path to the INDEX file
        #[arg(short, long)]
        index: PathBuf,
        /// JSON map of upstream versions: {"cran": {"dplyr": "1.1.4"}}
        #[arg(short, long)]
        latest: Option<PathBuf>,
        /// Ask the configured version command for every port
        #[arg(long)]
        upstream: bool,
    },
    /// List registered ports
    Ports,
    /// List patches
    Patches {
        /// Only patches still in the workflow
        #[arg(long)]
        open: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Serve => run_http_server(config).await?,
        Commands::Sync {
            index,
            latest,
            upstream,
        } => run_sync(&config, index, latest, upstream).await?,
        Commands::Ports => {
            let registry = Registry::open(&config)?;
            let ports = registry.list_ports().await?;
            if ports.is_empty() {
                println!("No ports registered.");
            }
            for port in ports {
                println!(
                    "{:>6}  {:<40} {:<12} {:<12} {}{}",
                    port.id,
                    port.origin,
                    port.version.as_deref().unwrap_or("-"),
                    port.latest_version.as_deref().unwrap_or("-"),
                    port.maintainer,
                    port.patch
                        .map(|patch| format!("  (patch {})", patch))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Patches { open } => {
            let registry = Registry::open(&config)?;
            for patch in registry.list_patches().await? {
                if open && !patch.is_open() {
                    continue;
                }
                println!(
                    "{:>6}  port {:<6} {:<7} {:<9} {}",
                    patch.id, patch.port, patch.action, patch.status, patch.log
                );
                if let Some(error) = &patch.error {
                    println!("        error: {}", error);
                }
            }
        }
    }

    Ok(())
}

async fn run_sync(
    config: &AppConfig,
    index: PathBuf,
    latest: Option<PathBuf>,
    upstream: bool,
) -> anyhow::Result<()> {
    let registry = Registry::open(config)?;

    let text = tokio::fs::read_to_string(&index)
        .await
        .with_context(|| format!("failed to read {}", index.display()))?;
    let report = registry.sync_index(&parse_index(&text)?).await?;
    println!(
        "Synced {}: {} added, {} updated, {} removed",
        index.display(),
        report.added,
        report.updated,
        report.removed
    );

    if let Some(path) = latest {
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let versions: LatestVersions = serde_json::from_str(&text)
            .with_context(|| format!("invalid version map in {}", path.display()))?;
        let refreshed = registry.apply_latest(&versions).await?;
        println!("Recorded {} new upstream versions", refreshed);
    }

    if upstream {
        let refreshed = registry.refresh_upstream().await?;
        println!("Found {} new upstream versions", refreshed);
    }

    Ok(())
}
