//! Row models returned by the repository.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in `reclaim` and `erase`.

use serde::Serialize;

/// Erase task slice used by the worker to process one item.
#[derive(Debug, Clone)]
pub struct EraseTaskRow {
    pub id: i64,
    pub path: String,
    pub attempt: i32,
}

/// Full erase task row, used for listings.
#[derive(Debug, Clone, Serialize)]
pub struct EraseTask {
    pub id: i64,
    pub path: String,
    pub attempt: i32,
    /// SQLite `CURRENT_TIMESTAMP` text, UTC.
    pub due_at: String,
}
