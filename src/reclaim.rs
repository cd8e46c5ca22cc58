//! Reclamation of submission and reply rows orphaned from their source.
//!
//! Each orphan row is deleted first and its backing file is handed to the
//! erase queue afterwards. A crash between the two loses the erase task but
//! never leaves a row pointing at an erased file. The cleanup is one-way:
//! deleted rows and queued erasures cannot be restored.
//!
//! Error policy: a missing file or an ambiguous filename is expected and
//! absorbed. Any other failure on a row aborts the whole run in strict mode;
//! in best-effort mode it is recorded on that row and the run continues with
//! the next one. Failing to scan a table always aborts.
use crate::db::{self, Pool};
use crate::erase::EraseQueue;
use crate::model::{ExecutionMode, OrphanRecord, RecordKind, RowOutcome, SkipReason};
use crate::store::{FileResolver, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error("failed to scan {kind} records: {source}")]
    Scan {
        kind: RecordKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to delete {kind} {id}: {source}")]
    Delete {
        kind: RecordKind,
        id: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to resolve file of {kind} {id}: {source}")]
    Store {
        kind: RecordKind,
        id: i64,
        #[source]
        source: StoreError,
    },
    #[error("failed to queue erase for {kind} {id}: {source}")]
    Queue {
        kind: RecordKind,
        id: i64,
        #[source]
        source: anyhow::Error,
    },
}

impl ReclaimError {
    /// Whether the row was already gone from its table when this error hit.
    pub fn row_deleted(&self) -> bool {
        matches!(self, ReclaimError::Store { .. } | ReclaimError::Queue { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RowReport {
    #[serde(flatten)]
    pub record: OrphanRecord,
    #[serde(flatten)]
    pub outcome: RowOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReclaimReport {
    pub run_id: Uuid,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows: Vec<RowReport>,
}

impl ReclaimReport {
    pub fn outcome_for(&self, kind: RecordKind, id: i64) -> Option<&RowOutcome> {
        self.rows
            .iter()
            .find(|r| r.record.kind == kind && r.record.id == id)
            .map(|r| &r.outcome)
    }

    /// Rows this run removed from their table.
    pub fn deleted(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.outcome.deleted_by_run())
            .count()
    }

    pub fn queued(&self) -> usize {
        self.rows.iter().filter(|r| r.outcome.queued()).count()
    }

    pub fn failed(&self) -> usize {
        self.rows.iter().filter(|r| r.outcome.failed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub struct ReclaimJob<'a> {
    pool: &'a Pool,
    resolver: &'a dyn FileResolver,
    queue: &'a dyn EraseQueue,
    mode: ExecutionMode,
}

impl<'a> ReclaimJob<'a> {
    pub fn new(
        pool: &'a Pool,
        resolver: &'a dyn FileResolver,
        queue: &'a dyn EraseQueue,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            pool,
            resolver,
            queue,
            mode,
        }
    }

    /// Orphans that a run would remove, without touching anything.
    pub async fn plan(&self) -> Result<Vec<OrphanRecord>, ReclaimError> {
        let mut orphans = Vec::new();
        for kind in RecordKind::ALL {
            orphans.extend(self.scan(kind).await?);
        }
        Ok(orphans)
    }

    /// Delete every orphan row and queue secure erasure of its file.
    pub async fn reclaim_orphans(&self) -> Result<ReclaimReport, ReclaimError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reclaim", %run_id, mode = self.mode.as_str());
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<ReclaimReport, ReclaimError> {
        let started_at = Utc::now();

        // Both tables are scanned once, up front, so a row is never visited twice.
        let mut batches = Vec::with_capacity(RecordKind::ALL.len());
        for kind in RecordKind::ALL {
            let orphans = self.scan(kind).await?;
            info!(%kind, count = orphans.len(), "found orphaned records");
            batches.push(orphans);
        }

        let mut rows = Vec::new();
        for orphan in batches.into_iter().flatten() {
            let outcome = match self.reclaim_row(&orphan).await {
                Ok(outcome) => outcome,
                Err(err) if self.mode.is_strict() => {
                    warn!(?err, kind = %orphan.kind, id = orphan.id, "aborting reclaim");
                    return Err(err);
                }
                Err(err) => {
                    warn!(?err, kind = %orphan.kind, id = orphan.id, "continuing past error");
                    if err.row_deleted() {
                        RowOutcome::Deleted {
                            error: err.to_string(),
                        }
                    } else {
                        RowOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                }
            };
            rows.push(RowReport {
                record: orphan,
                outcome,
            });
        }

        let report = ReclaimReport {
            run_id,
            mode: self.mode,
            started_at,
            finished_at: Utc::now(),
            rows,
        };
        info!(
            orphans = report.rows.len(),
            deleted = report.deleted(),
            queued = report.queued(),
            failed = report.failed(),
            "reclaim finished"
        );
        Ok(report)
    }

    async fn scan(&self, kind: RecordKind) -> Result<Vec<OrphanRecord>, ReclaimError> {
        db::find_orphans(self.pool, kind)
            .await
            .map_err(|source| ReclaimError::Scan { kind, source })
    }

    async fn reclaim_row(&self, orphan: &OrphanRecord) -> Result<RowOutcome, ReclaimError> {
        let (kind, id) = (orphan.kind, orphan.id);

        let removed = db::delete_record(self.pool, kind, id)
            .await
            .map_err(|source| ReclaimError::Delete { kind, id, source })?;
        if removed == 0 {
            // Someone else already deleted it and owns the erase.
            info!(%kind, id, "row already gone; not queueing erase");
            return Ok(RowOutcome::DeletedOnly {
                reason: SkipReason::RowVanished,
            });
        }

        let path = match self.resolver.path_without_filesystem_id(&orphan.filename).await {
            Ok(path) => path,
            Err(StoreError::NotFound { .. }) => {
                info!(%kind, id, filename = %orphan.filename, "file already gone");
                return Ok(RowOutcome::DeletedOnly {
                    reason: SkipReason::FileMissing,
                });
            }
            Err(StoreError::TooManyMatches { count, .. }) => {
                warn!(%kind, id, filename = %orphan.filename, count, "ambiguous filename; leaving files in place");
                return Ok(RowOutcome::DeletedOnly {
                    reason: SkipReason::AmbiguousMatch,
                });
            }
            Err(source) => return Err(ReclaimError::Store { kind, id, source }),
        };

        let task_id = self
            .queue
            .enqueue(&path)
            .await
            .map_err(|source| ReclaimError::Queue { kind, id, source })?;
        info!(%kind, id, path = %path.display(), task_id, "queued secure erase");
        Ok(RowOutcome::DeletedAndQueued { path, task_id })
    }
}
