use super::model::{EraseTask, EraseTaskRow};
use crate::model::{OrphanRecord, RecordKind};
use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url)?;
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
pub(crate) fn prepare_sqlite_url(url: &str) -> Result<String> {
    if !url.starts_with("sqlite:") {
        return Ok(url.to_string());
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return Ok(url.to_string());
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return Ok(url.to_string());
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    // Rebuild URL, prefer sqlite:// form. `mode=rwc` lets a fresh install
    // create the database file.
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    Ok(rebuilt)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_source(pool: &Pool, filesystem_id: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO sources (filesystem_id) VALUES (?) RETURNING id")
        .bind(filesystem_id)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn delete_source(pool: &Pool, source_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM sources WHERE id = ?")
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all, fields(kind = %kind))]
pub async fn insert_record(
    pool: &Pool,
    kind: RecordKind,
    source_id: Option<i64>,
    filename: &str,
) -> Result<i64> {
    let sql = format!(
        "INSERT INTO {} (source_id, filename) VALUES (?, ?) RETURNING id",
        kind.table()
    );
    let rec = sqlx::query(&sql)
        .bind(source_id)
        .bind(filename)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Insert a record with an explicit primary key. Used to reproduce legacy
/// rows whose ids matter.
#[instrument(skip_all, fields(kind = %kind))]
pub async fn insert_record_with_id(
    pool: &Pool,
    kind: RecordKind,
    id: i64,
    source_id: Option<i64>,
    filename: &str,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (id, source_id, filename) VALUES (?, ?, ?)",
        kind.table()
    );
    sqlx::query(&sql)
        .bind(id)
        .bind(source_id)
        .bind(filename)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_exists(pool: &Pool, kind: RecordKind, id: i64) -> Result<bool> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", kind.table());
    let cnt: i64 = sqlx::query_scalar(&sql).bind(id).fetch_one(pool).await?;
    Ok(cnt > 0)
}

pub async fn count_records(pool: &Pool, kind: RecordKind) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
    let cnt: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(cnt)
}

/// Rows whose `source_id` names no existing source, plus rows with a NULL
/// `source_id`. `NOT IN` never matches NULL, hence the union.
#[instrument(skip_all, fields(kind = %kind))]
pub async fn find_orphans(pool: &Pool, kind: RecordKind) -> Result<Vec<OrphanRecord>> {
    let table = kind.table();
    let sql = format!(
        "SELECT id, filename, source_id FROM {table} \
         WHERE source_id NOT IN (SELECT id FROM sources) \
         UNION \
         SELECT id, filename, source_id FROM {table} \
         WHERE source_id IS NULL \
         ORDER BY id"
    );
    let rows: Vec<(i64, String, Option<i64>)> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to scan {} for orphans", table))?;
    Ok(rows
        .into_iter()
        .map(|(id, filename, source_id)| OrphanRecord {
            kind,
            id,
            filename,
            source_id,
        })
        .collect())
}

/// Delete one row by primary key. Returns the number of rows removed.
#[instrument(skip_all, fields(kind = %kind, id = id))]
pub async fn delete_record(pool: &Pool, kind: RecordKind, id: i64) -> Result<u64> {
    let sql = format!("DELETE FROM {} WHERE id = ?", kind.table());
    let res = sqlx::query(&sql).bind(id).execute(pool).await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn enqueue_erase(pool: &Pool, path: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO erase_tasks (path, attempt) VALUES (?, 0) RETURNING id")
        .bind(path)
        .fetch_one(pool)
        .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_erase(pool: &Pool) -> Result<Option<EraseTaskRow>> {
    let row = sqlx::query(
        "SELECT id, path, attempt FROM erase_tasks WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| EraseTaskRow {
        id: row.get("id"),
        path: row.get("path"),
        attempt: row.get("attempt"),
    }))
}

pub async fn list_erase_tasks(pool: &Pool) -> Result<Vec<EraseTask>> {
    let rows = sqlx::query("SELECT id, path, attempt, due_at FROM erase_tasks ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| EraseTask {
            id: row.get("id"),
            path: row.get("path"),
            attempt: row.get("attempt"),
            due_at: row.get("due_at"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn delete_erase(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM erase_tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (or 3600s
/// when the cap is not positive).
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    secs.min(cap)
}

#[instrument(skip_all)]
pub async fn backoff_erase_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE erase_tasks SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending_erase(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM erase_tasks")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
