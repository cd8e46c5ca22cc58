use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use orphan_reclaim::config;
use orphan_reclaim::db;
use orphan_reclaim::erase::{self, ShredEraser};

#[derive(Debug, Parser)]
#[command(author, version, about = "Drain the secure-erase queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit once no task is due instead of polling forever
    #[arg(long)]
    once: bool,
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

    erase::ensure_shred_available().await?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let eraser = ShredEraser::new(cfg.worker.shred_passes);
    let poll_sleep = Duration::from_millis(cfg.worker.poll_interval_ms);
    let max_backoff = cfg.worker.max_backoff_secs()?;

    let pending = db::count_pending_erase(&pool).await?;
    info!(pending, "starting erase worker");

    let mut processed_count = 0_u64;
    loop {
        match erase::process_next_task(&pool, &eraser, max_backoff).await {
            Ok(true) => processed_count += 1,
            Ok(false) => {
                if args.once {
                    let remaining = db::count_pending_erase(&pool).await?;
                    info!(
                        processed = processed_count,
                        remaining, "no erase task due, exiting"
                    );
                    break;
                }
                tokio::time::sleep(poll_sleep).await;
            }
            Err(err) => {
                error!(?err, "erase worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    Ok(())
}
