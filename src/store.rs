//! On-disk store of encrypted submissions and replies.
//!
//! Files live at `<root>/<filesystem_id>/<filename>`. A record only remembers
//! its filename, so resolving it back to a path means scanning every source
//! directory for that name.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

static VALID_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid filename regex"));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no file found for {filename}")]
    NotFound { filename: String },
    #[error("{count} files match {filename}")]
    TooManyMatches { filename: String, count: usize },
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("I/O error under {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Resolves a record's filename handle to the file backing it.
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn path_without_filesystem_id(&self, filename: &str) -> Result<PathBuf, StoreError>;
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `filename` inside the directory of one source.
    pub fn path(&self, filesystem_id: &str, filename: &str) -> Result<PathBuf, StoreError> {
        validate_component(filesystem_id)?;
        validate_component(filename)?;
        Ok(self.root.join(filesystem_id).join(filename))
    }
}

fn validate_component(name: &str) -> Result<(), StoreError> {
    if name.contains("..") || !VALID_COMPONENT.is_match(name) {
        return Err(StoreError::InvalidFilename(name.to_string()));
    }
    Ok(())
}

#[async_trait]
impl FileResolver for Storage {
    async fn path_without_filesystem_id(&self, filename: &str) -> Result<PathBuf, StoreError> {
        validate_component(filename)?;

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    filename: filename.to_string(),
                })
            }
            Err(err) => return Err(StoreError::io(&self.root, err)),
        };

        let mut matches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(&entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            let candidate = entry.path().join(filename);
            match tokio::fs::symlink_metadata(&candidate).await {
                // A link could point anywhere; it never counts as a stored file.
                Ok(meta) if meta.file_type().is_symlink() => {
                    warn!(path = %candidate.display(), "ignoring symlink in store");
                }
                Ok(_) => matches.push(candidate),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io(&candidate, err)),
            }
        }

        debug!(filename, matches = matches.len(), "resolved store filename");
        match matches.len() {
            0 => Err(StoreError::NotFound {
                filename: filename.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            count => Err(StoreError::TooManyMatches {
                filename: filename.to_string(),
                count,
            }),
        }
    }
}
