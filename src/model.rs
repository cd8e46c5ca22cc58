use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The two record collections that hang off a source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Submission,
    Reply,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Submission, RecordKind::Reply];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Submission => "submission",
            RecordKind::Reply => "reply",
        }
    }

    /// Table holding rows of this kind. Only ever interpolated from this
    /// closed set, never from input.
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Submission => "submissions",
            RecordKind::Reply => "replies",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict mode propagates unexpected errors; best-effort absorbs them so one
/// bad row never blocks the rest of the cleanup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Strict,
    BestEffort,
}

impl ExecutionMode {
    /// Production installs run best-effort; every other environment is strict.
    pub fn for_environment(env: &str) -> Self {
        if env.trim().eq_ignore_ascii_case("prod") {
            ExecutionMode::BestEffort
        } else {
            ExecutionMode::Strict
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, ExecutionMode::Strict)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Strict => "strict",
            ExecutionMode::BestEffort => "best_effort",
        }
    }
}

/// Why erasure was skipped for a deleted row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No backing file exists; deleting the row was the whole fix.
    FileMissing,
    /// More than one file matches the handle, so nothing is erased.
    AmbiguousMatch,
    /// The row disappeared between scan and delete; whoever removed it owns
    /// the erase.
    RowVanished,
}

/// What happened to one orphan row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    /// Row deleted and a secure-erase task handed to the queue.
    DeletedAndQueued { path: PathBuf, task_id: i64 },
    /// Row deleted; erasure skipped for a classified reason.
    DeletedOnly { reason: SkipReason },
    /// Row deleted; resolving or queueing its file failed unexpectedly and
    /// best-effort mode absorbed the error.
    Deleted { error: String },
    /// The delete itself failed and best-effort mode moved on. The row is
    /// still present.
    Failed { error: String },
}

impl RowOutcome {
    /// Whether this run removed the row. A row that vanished before our
    /// delete was removed by someone else.
    pub fn deleted_by_run(&self) -> bool {
        !matches!(
            self,
            RowOutcome::Failed { .. }
                | RowOutcome::DeletedOnly {
                    reason: SkipReason::RowVanished
                }
        )
    }

    pub fn failed(&self) -> bool {
        matches!(self, RowOutcome::Failed { .. })
    }

    pub fn queued(&self) -> bool {
        matches!(self, RowOutcome::DeletedAndQueued { .. })
    }
}

/// A submission or reply row whose source is gone or was never set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanRecord {
    pub kind: RecordKind,
    pub id: i64,
    pub filename: String,
    pub source_id: Option<i64>,
}
