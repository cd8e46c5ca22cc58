use anyhow::{anyhow, Result};
use async_trait::async_trait;
use orphan_reclaim::db;
use orphan_reclaim::erase::{EraseQueue, SqliteEraseQueue};
use orphan_reclaim::model::{ExecutionMode, RecordKind, RowOutcome, SkipReason};
use orphan_reclaim::reclaim::{ReclaimError, ReclaimJob};
use orphan_reclaim::store::{FileResolver, Storage, StoreError};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn put_file(storage: &Storage, fs_id: &str, name: &str) -> PathBuf {
    let p = storage.path(fs_id, name).unwrap();
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(&p, b"ciphertext").unwrap();
    p
}

#[derive(Clone, Default)]
struct RecordingQueue {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl RecordingQueue {
    async fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().await.clone()
    }
}

#[async_trait]
impl EraseQueue for RecordingQueue {
    async fn enqueue(&self, path: &Path) -> Result<i64> {
        let mut guard = self.paths.lock().await;
        guard.push(path.to_path_buf());
        Ok(guard.len() as i64)
    }
}

struct BrokenQueue;

#[async_trait]
impl EraseQueue for BrokenQueue {
    async fn enqueue(&self, _path: &Path) -> Result<i64> {
        Err(anyhow!("queue unreachable"))
    }
}

/// Resolves through a real store but fails unexpectedly for chosen names.
struct FaultyResolver {
    inner: Storage,
    broken: HashSet<String>,
}

#[async_trait]
impl FileResolver for FaultyResolver {
    async fn path_without_filesystem_id(&self, filename: &str) -> Result<PathBuf, StoreError> {
        if self.broken.contains(filename) {
            return Err(StoreError::Io {
                path: self.inner.root().join(filename),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            });
        }
        self.inner.path_without_filesystem_id(filename).await
    }
}

/// Deletes another row behind the job's back while resolving `trigger`,
/// like a concurrent cleanup would.
struct RacingResolver {
    inner: Storage,
    pool: sqlx::SqlitePool,
    trigger: String,
    victim: (RecordKind, i64),
}

#[async_trait]
impl FileResolver for RacingResolver {
    async fn path_without_filesystem_id(&self, filename: &str) -> Result<PathBuf, StoreError> {
        if filename == self.trigger {
            let (kind, id) = self.victim;
            db::delete_record(&self.pool, kind, id).await.unwrap();
        }
        self.inner.path_without_filesystem_id(filename).await
    }
}

/// Source {1}; submissions 10 -> 1 (A), 11 -> 2 (B), 12 -> NULL (C).
async fn seed_scenario(pool: &sqlx::SqlitePool) -> (TempDir, Storage) {
    let source = db::insert_source(pool, "FS1").await.unwrap();
    assert_eq!(source, 1);
    db::insert_record_with_id(pool, RecordKind::Submission, 10, Some(1), "A")
        .await
        .unwrap();
    db::insert_record_with_id(pool, RecordKind::Submission, 11, Some(2), "B")
        .await
        .unwrap();
    db::insert_record_with_id(pool, RecordKind::Submission, 12, None, "C")
        .await
        .unwrap();

    let td = tempdir().unwrap();
    let storage = Storage::new(td.path().join("store"));
    put_file(&storage, "FS1", "A");
    put_file(&storage, "FS2", "B");
    put_file(&storage, "FS3", "C");
    (td, storage)
}

#[tokio::test]
async fn dangling_and_null_submissions_are_reclaimed() {
    let pool = setup_pool().await;
    let (_td, storage) = seed_scenario(&pool).await;
    let queue = RecordingQueue::default();

    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::BestEffort);
    let report = job.reclaim_orphans().await.unwrap();

    assert!(db::record_exists(&pool, RecordKind::Submission, 10).await.unwrap());
    assert!(!db::record_exists(&pool, RecordKind::Submission, 11).await.unwrap());
    assert!(!db::record_exists(&pool, RecordKind::Submission, 12).await.unwrap());

    assert_eq!(
        queue.paths().await,
        vec![
            storage.path("FS2", "B").unwrap(),
            storage.path("FS3", "C").unwrap()
        ]
    );
    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.queued(), 2);
    assert!(report.outcome_for(RecordKind::Submission, 10).is_none());
    assert!(matches!(
        report.outcome_for(RecordKind::Submission, 11),
        Some(RowOutcome::DeletedAndQueued { .. })
    ));

    // Erasure is the worker's job; the job itself leaves files alone.
    assert!(storage.path("FS2", "B").unwrap().exists());
}

#[tokio::test]
async fn valid_rows_are_untouched() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = Storage::new(td.path());
    let src = db::insert_source(&pool, "FS1").await.unwrap();
    let sub = db::insert_record(&pool, RecordKind::Submission, Some(src), "1-a-msg.gpg")
        .await
        .unwrap();
    let reply = db::insert_record(&pool, RecordKind::Reply, Some(src), "2-a-reply.gpg")
        .await
        .unwrap();
    put_file(&storage, "FS1", "1-a-msg.gpg");
    put_file(&storage, "FS1", "2-a-reply.gpg");

    let queue = RecordingQueue::default();
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::Strict);
    let report = job.reclaim_orphans().await.unwrap();

    assert!(report.is_empty());
    assert!(queue.paths().await.is_empty());
    assert!(db::record_exists(&pool, RecordKind::Submission, sub).await.unwrap());
    assert!(db::record_exists(&pool, RecordKind::Reply, reply).await.unwrap());
}

#[tokio::test]
async fn orphaned_replies_are_reclaimed_too() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = Storage::new(td.path());
    let src = db::insert_source(&pool, "FS1").await.unwrap();
    let reply = db::insert_record(&pool, RecordKind::Reply, Some(src), "1-a-reply.gpg")
        .await
        .unwrap();
    let expected = put_file(&storage, "FS1", "1-a-reply.gpg");
    db::delete_source(&pool, src).await.unwrap();

    let queue = RecordingQueue::default();
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::Strict);
    job.reclaim_orphans().await.unwrap();

    assert!(!db::record_exists(&pool, RecordKind::Reply, reply).await.unwrap());
    assert_eq!(queue.paths().await, vec![expected]);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let pool = setup_pool().await;
    let (_td, storage) = seed_scenario(&pool).await;
    let queue = RecordingQueue::default();
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::BestEffort);

    let first = job.reclaim_orphans().await.unwrap();
    assert_eq!(first.deleted(), 2);

    let second = job.reclaim_orphans().await.unwrap();
    assert!(second.is_empty());
    assert_eq!(queue.paths().await.len(), 2);
    assert!(job.plan().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_file_deletes_row_without_task() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = Storage::new(td.path());
    let id = db::insert_record(&pool, RecordKind::Submission, None, "1-gone-msg.gpg")
        .await
        .unwrap();

    let queue = RecordingQueue::default();
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::BestEffort);
    let report = job.reclaim_orphans().await.unwrap();

    assert!(!db::record_exists(&pool, RecordKind::Submission, id).await.unwrap());
    assert!(queue.paths().await.is_empty());
    assert_eq!(
        report.outcome_for(RecordKind::Submission, id),
        Some(&RowOutcome::DeletedOnly {
            reason: SkipReason::FileMissing
        })
    );
}

#[tokio::test]
async fn ambiguous_file_deletes_row_and_keeps_files() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = Storage::new(td.path());
    let id = db::insert_record(&pool, RecordKind::Reply, Some(99), "1-dup-reply.gpg")
        .await
        .unwrap();
    let first = put_file(&storage, "FS1", "1-dup-reply.gpg");
    let second = put_file(&storage, "FS2", "1-dup-reply.gpg");

    let queue = RecordingQueue::default();
    // Classified errors are absorbed even in strict mode.
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::Strict);
    let report = job.reclaim_orphans().await.unwrap();

    assert!(!db::record_exists(&pool, RecordKind::Reply, id).await.unwrap());
    assert!(queue.paths().await.is_empty());
    assert!(first.exists());
    assert!(second.exists());
    assert_eq!(
        report.outcome_for(RecordKind::Reply, id),
        Some(&RowOutcome::DeletedOnly {
            reason: SkipReason::AmbiguousMatch
        })
    );
}

#[tokio::test]
async fn strict_mode_stops_on_unexpected_error() {
    let pool = setup_pool().await;
    let (_td, storage) = seed_scenario(&pool).await;
    let resolver = FaultyResolver {
        inner: storage,
        broken: HashSet::from(["B".to_string()]),
    };
    let queue = RecordingQueue::default();

    let job = ReclaimJob::new(&pool, &resolver, &queue, ExecutionMode::Strict);
    let err = job.reclaim_orphans().await.unwrap_err();

    match &err {
        ReclaimError::Store { kind, id, source } => {
            assert_eq!(*kind, RecordKind::Submission);
            assert_eq!(*id, 11);
            assert!(matches!(source, StoreError::Io { .. }));
        }
        other => panic!("wrong error: {other:?}"),
    }
    assert!(err.row_deleted());
    // Row 11 was deleted before resolution failed; row 12 was never reached.
    assert!(!db::record_exists(&pool, RecordKind::Submission, 11).await.unwrap());
    assert!(db::record_exists(&pool, RecordKind::Submission, 12).await.unwrap());
    assert!(queue.paths().await.is_empty());
}

#[tokio::test]
async fn best_effort_mode_continues_past_unexpected_error() {
    let pool = setup_pool().await;
    let (_td, storage) = seed_scenario(&pool).await;
    let expected_c = storage.path("FS3", "C").unwrap();
    let resolver = FaultyResolver {
        inner: storage,
        broken: HashSet::from(["B".to_string()]),
    };
    let queue = RecordingQueue::default();

    let job = ReclaimJob::new(&pool, &resolver, &queue, ExecutionMode::BestEffort);
    let report = job.reclaim_orphans().await.unwrap();

    assert!(matches!(
        report.outcome_for(RecordKind::Submission, 11),
        Some(RowOutcome::Deleted { .. })
    ));
    assert!(matches!(
        report.outcome_for(RecordKind::Submission, 12),
        Some(RowOutcome::DeletedAndQueued { .. })
    ));
    assert_eq!(queue.paths().await, vec![expected_c]);
    assert!(job.plan().await.unwrap().is_empty());
}

#[tokio::test]
async fn unsafe_filename_is_unexpected() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = Storage::new(td.path());
    let id = db::insert_record(&pool, RecordKind::Submission, None, "../../etc/passwd")
        .await
        .unwrap();
    let queue = RecordingQueue::default();

    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::BestEffort);
    let report = job.reclaim_orphans().await.unwrap();
    assert!(matches!(
        report.outcome_for(RecordKind::Submission, id),
        Some(RowOutcome::Deleted { .. })
    ));
    assert!(queue.paths().await.is_empty());

    let id = db::insert_record(&pool, RecordKind::Submission, None, "a/b")
        .await
        .unwrap();
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::Strict);
    let err = job.reclaim_orphans().await.unwrap_err();
    assert!(matches!(
        err,
        ReclaimError::Store {
            source: StoreError::InvalidFilename(_),
            ..
        }
    ));
    assert!(!db::record_exists(&pool, RecordKind::Submission, id).await.unwrap());
}

#[tokio::test]
async fn queue_failure_still_leaves_row_deleted() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = Storage::new(td.path());
    let id = db::insert_record(&pool, RecordKind::Submission, None, "1-a-msg.gpg")
        .await
        .unwrap();
    put_file(&storage, "FS1", "1-a-msg.gpg");

    let job = ReclaimJob::new(&pool, &storage, &BrokenQueue, ExecutionMode::BestEffort);
    let report = job.reclaim_orphans().await.unwrap();
    assert!(!db::record_exists(&pool, RecordKind::Submission, id).await.unwrap());
    match report.outcome_for(RecordKind::Submission, id) {
        Some(RowOutcome::Deleted { error }) => assert!(error.contains("queue")),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let id = db::insert_record(&pool, RecordKind::Submission, None, "1-a-msg.gpg")
        .await
        .unwrap();
    let job = ReclaimJob::new(&pool, &storage, &BrokenQueue, ExecutionMode::Strict);
    let err = job.reclaim_orphans().await.unwrap_err();
    assert!(matches!(err, ReclaimError::Queue { .. }));
    assert!(!db::record_exists(&pool, RecordKind::Submission, id).await.unwrap());
}

#[tokio::test]
async fn reclaim_is_one_way() {
    let pool = setup_pool().await;
    let td = tempdir().unwrap();
    let storage = Storage::new(td.path());
    let src = db::insert_source(&pool, "FS1").await.unwrap();
    let id = db::insert_record(&pool, RecordKind::Submission, Some(src + 1), "1-a-msg.gpg")
        .await
        .unwrap();
    put_file(&storage, "FS1", "1-a-msg.gpg");

    let queue = SqliteEraseQueue::new(pool.clone());
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::Strict);
    job.reclaim_orphans().await.unwrap();

    // The missing source showing up later does not bring the row back, and
    // the erase task stays queued.
    let late = db::insert_source(&pool, "FS2").await.unwrap();
    assert_eq!(late, src + 1);
    assert!(!db::record_exists(&pool, RecordKind::Submission, id).await.unwrap());
    assert_eq!(db::count_pending_erase(&pool).await.unwrap(), 1);
    assert!(job.reclaim_orphans().await.unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_plan_changes_nothing() {
    let pool = setup_pool().await;
    let (_td, storage) = seed_scenario(&pool).await;
    let queue = RecordingQueue::default();
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::Strict);

    let plan = job.plan().await.unwrap();
    let ids: Vec<i64> = plan.iter().map(|o| o.id).collect();
    assert_eq!(ids, vec![11, 12]);
    assert_eq!(db::count_records(&pool, RecordKind::Submission).await.unwrap(), 3);
    assert!(queue.paths().await.is_empty());
}

#[tokio::test]
async fn report_serializes_outcomes() {
    let pool = setup_pool().await;
    let (_td, storage) = seed_scenario(&pool).await;
    let queue = RecordingQueue::default();
    let job = ReclaimJob::new(&pool, &storage, &queue, ExecutionMode::BestEffort);
    let report = job.reclaim_orphans().await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["mode"], "best_effort");
    let rows = json["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["kind"], "submission");
    assert_eq!(rows[0]["id"], 11);
    assert_eq!(rows[0]["outcome"], "deleted_and_queued");
    assert_eq!(rows[1]["source_id"], serde_json::Value::Null);
}

#[tokio::test]
async fn row_deleted_concurrently_is_not_queued_twice() {
    let pool = setup_pool().await;
    let (_td, storage) = seed_scenario(&pool).await;
    let expected_b = storage.path("FS2", "B").unwrap();
    let resolver = RacingResolver {
        inner: storage,
        pool: pool.clone(),
        trigger: "B".to_string(),
        victim: (RecordKind::Submission, 12),
    };
    let queue = RecordingQueue::default();

    let job = ReclaimJob::new(&pool, &resolver, &queue, ExecutionMode::Strict);
    let report = job.reclaim_orphans().await.unwrap();

    assert_eq!(
        report.outcome_for(RecordKind::Submission, 12),
        Some(&RowOutcome::DeletedOnly {
            reason: SkipReason::RowVanished
        })
    );
    // Only row 11's file was handed over; whoever removed row 12 owns its erase.
    assert_eq!(queue.paths().await, vec![expected_b]);
    assert!(!db::record_exists(&pool, RecordKind::Submission, 12).await.unwrap());

    // The vanished row was not removed by this run.
    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.deleted(), 1);
    assert_eq!(report.queued(), 1);
    assert_eq!(report.failed(), 0);
}
