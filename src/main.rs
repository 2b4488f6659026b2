//! hypernet-sync: keeps a hypernet data directory in sync with its git remote
//!
//! ## Usage
//!
//! ```bash
//! # One pull/push cycle, then exit
//! hypernet-sync --config hypernet.toml --once
//!
//! # Sync every `git.sync_interval_secs` until Ctrl-C
//! hypernet-sync --data-dir ~/hypernet/data --contributor alice
//! ```

use clap::Parser;
use hypernet_store::git::{GitBatchCoordinator, GitCli, SyncResult};
use hypernet_store::{Config, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hypernet-sync")]
#[command(about = "Synchronize a hypernet store with its git remote")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "HYPERNET_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "HYPERNET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Git working tree (overrides config file)
    #[arg(long, env = "HYPERNET_REPO_ROOT")]
    repo_root: Option<PathBuf>,

    /// Contributor id (overrides config file)
    #[arg(long, env = "HYPERNET_CONTRIBUTOR")]
    contributor: Option<String>,

    /// Run one sync cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hypernet_store=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) if path.exists() => Config::load(path)?,
        Some(path) => {
            info!("Config file {} not found, using defaults", path.display());
            Config::default()
        }
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }
    if let Some(repo_root) = args.repo_root {
        config.git.repo_root = Some(repo_root);
    }
    if let Some(contributor) = args.contributor {
        config.contributor.id = Some(contributor);
    }
    config.validate()?;

    let repo_root = config.repo_root();
    info!("Data dir: {}", config.store.data_dir.display());
    info!("Repository: {}", repo_root.display());

    let store = Arc::new(Store::open(&config.store.data_dir, config.store.lock_settings())?);
    let contributor = GitBatchCoordinator::resolve_contributor(config.contributor.id.as_deref())?;
    let runner = Arc::new(GitCli::new(&repo_root));
    let mut coordinator = GitBatchCoordinator::new(store, runner, config.git.clone(), contributor);
    coordinator.setup_contributor().await?;

    if args.once {
        let result = coordinator.sync().await;
        report(&result);
        if !result.success() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut ticker = tokio::time::interval(config.git.sync_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(interval_secs = config.git.sync_interval_secs, "Starting sync loop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = coordinator.sync().await;
                report(&result);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn report(result: &SyncResult) {
    info!(
        status = ?result.pull.status,
        files_updated = result.pull.files_updated,
        conflicts = result.pull.conflicts.len(),
        "Pull: {}",
        result.pull.message
    );
    match &result.push {
        Some(push) if push.success() => info!(
            files = push.files_pushed,
            retries = push.retries,
            "Push: {}",
            push.message
        ),
        Some(push) => warn!(status = ?push.status, "Push: {}", push.message),
        None => warn!("Push skipped"),
    }
    for collision in &result.address_collisions {
        warn!(
            prefix = %collision.prefix,
            start = collision.overlap_start,
            end = collision.overlap_end,
            affected = collision.affected.len(),
            "Address range collision"
        );
    }
    for conflict in &result.claim_conflicts {
        warn!(
            task = %conflict.task_address,
            winner = %conflict.winner.contributor_id,
            authority = ?conflict.authority,
            "Task claimed twice"
        );
    }
    if result.pull.validation_issues.is_empty() {
        return;
    }
    error!(issues = result.pull.validation_issues.len(), "Indexes disagree with files on disk");
}
