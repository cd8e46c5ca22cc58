use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use orphan_reclaim::config;
use orphan_reclaim::db;
use orphan_reclaim::erase::SqliteEraseQueue;
use orphan_reclaim::model::ExecutionMode;
use orphan_reclaim::reclaim::ReclaimJob;
use orphan_reclaim::store::Storage;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Delete submissions and replies whose source no longer exists and queue their files for secure erasure"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// List orphaned records without deleting anything
    #[arg(long)]
    dry_run: bool,

    /// Confirm the cleanup. Deleted rows and erased files cannot be restored.
    #[arg(long)]
    yes: bool,

    /// Abort on the first unexpected error
    #[arg(long, conflicts_with = "best_effort")]
    strict: bool,

    /// Log unexpected errors and keep going
    #[arg(long)]
    best_effort: bool,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let mode = if args.strict {
        ExecutionMode::Strict
    } else if args.best_effort {
        ExecutionMode::BestEffort
    } else {
        cfg.execution_mode()
    };

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let storage = Storage::new(&cfg.store.dir);
    let queue = SqliteEraseQueue::new(pool.clone());
    let job = ReclaimJob::new(&pool, &storage, &queue, mode);

    if args.dry_run {
        let orphans = job.plan().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&orphans)?);
        } else {
            for o in &orphans {
                println!(
                    "{} {} filename={} source_id={}",
                    o.kind,
                    o.id,
                    o.filename,
                    o.source_id
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "NULL".into())
                );
            }
        }
        info!(count = orphans.len(), "dry run; nothing deleted");
        return Ok(());
    }

    if !args.yes {
        warn!("this cleanup is irreversible; re-run with --yes to proceed or --dry-run to preview");
        bail!("refusing to reclaim orphans without --yes");
    }

    info!(mode = mode.as_str(), store = %storage.root().display(), "reclaiming orphaned records");
    let report = job.reclaim_orphans().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let remaining = job.plan().await?;
    if !remaining.is_empty() {
        warn!(remaining = remaining.len(), "orphaned records remain after reclaim");
    }
    Ok(())
}
