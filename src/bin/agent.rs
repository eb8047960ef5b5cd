//! Fleet agent binary

use clap::{Parser, Subcommand};
use hafleet::common::{format_bytes, parse_duration, timestamp_now_millis, SnapshotConfig};
use hafleet::snapshot::{
    prune_candidates, remove_snapshot, retention_policy, scan_dir, FloorRestorePolicy,
    RestorePolicy, SnapshotRecord,
};
use hafleet::{Fleet, FleetConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hafleet-agent")]
#[command(about = "hafleet replica supervisor and snapshot tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap discovery and run the configured services
    Run {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// How long to wait for every service to reach quorum
        #[arg(long, default_value = "60s")]
        quorum_timeout: String,
    },

    /// Snapshot catalog operations
    Snapshots {
        /// Config file (TOML); its [snapshots] section supplies defaults
        #[arg(long, global = true)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List snapshots, oldest first
    List {
        /// Snapshot directory (default: from config)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Show the snapshot to restore from for a recovery point
    RestorePoint {
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Recovery point, milliseconds since the epoch
        #[arg(long)]
        at: i64,
    },

    /// Delete snapshots outside the retention window
    Prune {
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Snapshots always kept, newest first (default: from config)
        #[arg(long)]
        keep_last: Option<usize>,

        /// Retention window, e.g. 7d (default: from config)
        #[arg(long)]
        max_age: Option<String>,

        /// Dry run
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            quorum_timeout,
        } => {
            let config = FleetConfig::load(config.as_deref())?;
            init_tracing(&config.log_level);
            let quorum_timeout = parse_duration(&quorum_timeout)?;
            run(config, quorum_timeout).await?;
        }

        Commands::Snapshots { config, command } => {
            init_tracing("warn");
            let configured = FleetConfig::load(config.as_deref())?.snapshots;
            match command {
                SnapshotCommands::List { dir } => {
                    list(&configured.with_overrides(dir, None, None)?.dir)?
                }
                SnapshotCommands::RestorePoint { dir, at } => {
                    restore_point(&configured.with_overrides(dir, None, None)?.dir, at)?
                }
                SnapshotCommands::Prune {
                    dir,
                    keep_last,
                    max_age,
                    dry_run,
                } => prune(&configured.with_overrides(dir, keep_last, max_age)?, dry_run)?,
            }
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: FleetConfig, quorum_timeout: Duration) -> anyhow::Result<()> {
    tracing::info!(
        "Starting hafleet-agent {} as {} on {}",
        hafleet::VERSION,
        config.node_id,
        config.hostname
    );
    let fleet = Fleet::start(&config).await?;

    match fleet.await_quorum(quorum_timeout).await {
        Ok(tokens) => {
            for (name, token) in tokens {
                tracing::info!("{} is quorate, token {}", name, token);
            }
        }
        Err(e) => tracing::warn!("Fleet not quorate yet: {}", e),
    }
    for service in fleet.services() {
        match service.master() {
            Some(master) => tracing::info!(
                "{} master is {}",
                service.logical().name,
                master.node_path()
            ),
            None => tracing::info!("{} has no master yet", service.logical().name),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    fleet.shutdown(false).await;
    Ok(())
}

fn print_record(record: &SnapshotRecord) {
    let time = chrono::DateTime::from_timestamp_millis(record.commit_time())
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| record.commit_time().to_string());
    println!(
        "  {:>21}  {}  {:>10}",
        record.commit_counter(),
        time,
        format_bytes(record.size_on_disk())
    );
}

fn list(dir: &Path) -> anyhow::Result<()> {
    let catalog = scan_dir(dir)?;
    println!(
        "{} snapshot(s), {} total",
        catalog.len(),
        format_bytes(catalog.total_size())
    );
    for record in catalog.records() {
        print_record(&record);
    }
    Ok(())
}

fn restore_point(dir: &Path, at: i64) -> anyhow::Result<()> {
    let catalog = scan_dir(dir)?;
    match FloorRestorePolicy.restore_point(&catalog, at) {
        Some(record) => {
            println!("Restore point for {}:", at);
            print_record(&record);
        }
        None => {
            println!("No snapshot at or before {}", at);
            if let Some(next) = catalog.ceiling(at) {
                println!("Earliest later snapshot:");
                print_record(&next);
            }
        }
    }
    Ok(())
}

fn prune(config: &SnapshotConfig, dry_run: bool) -> anyhow::Result<()> {
    let dir = config.dir.as_path();
    let catalog = scan_dir(dir)?;
    let policy = retention_policy(config)?;

    let pruned = prune_candidates(
        &catalog,
        policy.as_ref(),
        config.keep_last,
        timestamp_now_millis(),
    );
    println!("Prune report:");
    println!("  Snapshots: {}", catalog.len());
    println!("  To delete: {}", pruned.len());
    println!(
        "  Bytes freed: {}",
        format_bytes(pruned.iter().map(|r| r.size_on_disk()).sum())
    );
    for record in &pruned {
        print_record(record);
        if !dry_run {
            remove_snapshot(dir, record)?;
        }
    }
    if dry_run {
        println!("  (dry run, nothing deleted)");
    }
    Ok(())
}
