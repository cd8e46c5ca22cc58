//! Secure-erase handoff: a durable queue the reclaim job writes to, and the
//! worker side that drains it.
use crate::db::{self, Pool};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Accepts secure-erase work. Delivery is at-least-once and the caller gets
/// no completion signal beyond the task id.
#[async_trait]
pub trait EraseQueue: Send + Sync {
    async fn enqueue(&self, path: &Path) -> Result<i64>;
}

/// Queue backed by the `erase_tasks` table.
#[derive(Debug, Clone)]
pub struct SqliteEraseQueue {
    pool: Pool,
}

impl SqliteEraseQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EraseQueue for SqliteEraseQueue {
    async fn enqueue(&self, path: &Path) -> Result<i64> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("refusing to queue non UTF-8 path {}", path.display()))?;
        db::enqueue_erase(&self.pool, path).await
    }
}

/// Irreversibly destroys a file or directory tree.
#[async_trait]
pub trait Eraser: Send + Sync {
    async fn erase(&self, path: &Path) -> Result<()>;
}

/// Overwrites with `shred` and unlinks.
#[derive(Debug, Clone)]
pub struct ShredEraser {
    passes: u32,
}

impl ShredEraser {
    pub fn new(passes: u32) -> Self {
        Self { passes }
    }

    async fn shred_file(&self, path: &Path) -> Result<()> {
        let status = Command::new("shred")
            .arg("-f")
            .arg("-z")
            .arg("-n")
            .arg(self.passes.to_string())
            .arg("-u")
            .arg(path.as_os_str())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn shred for {}", path.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "shred exited with status {} for {}",
                status,
                path.display()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Eraser for ShredEraser {
    async fn erase(&self, path: &Path) -> Result<()> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Redelivered task, or the file was removed by hand.
                debug!(path = %path.display(), "nothing to erase");
                return Ok(());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", path.display()))
            }
        };

        // Shredding a link would overwrite whatever it points at, which may
        // live outside the store. Only the link itself is removed.
        if meta.file_type().is_symlink() {
            warn!(path = %path.display(), "refusing to shred through symlink; unlinking only");
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("failed to unlink {}", path.display()))?;
            return Ok(());
        }

        if !meta.is_dir() {
            return self.shred_file(path).await;
        }

        let mut pending: Vec<PathBuf> = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("failed to read {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    self.shred_file(&entry.path()).await?;
                }
                // Symlinks inside the tree are left for remove_dir_all, which
                // unlinks them without following.
            }
        }
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(())
    }
}

/// Ensure the `shred` binary is available on PATH.
pub async fn ensure_shred_available() -> Result<()> {
    let status = Command::new("shred")
        .arg("--version")
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(anyhow!("shred not available (exit status {})", s)),
        Err(e) => Err(anyhow!("shred not available: {}", e)),
    }
}

/// Process one due erase task. Returns `false` when nothing was due.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &Pool,
    eraser: &dyn Eraser,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(task) = db::next_due_erase(pool).await? else {
        return Ok(false);
    };
    match eraser.erase(Path::new(&task.path)).await {
        Ok(()) => {
            db::delete_erase(pool, task.id).await?;
            info!(id = task.id, path = %task.path, "erase task succeeded");
        }
        Err(err) => {
            warn!(
                ?err,
                id = task.id,
                path = %task.path,
                attempt = task.attempt,
                "erase task failed; backoff"
            );
            db::backoff_erase_with_cap(pool, task.id, task.attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}
