use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage root {0} does not exist")]
    MissingRoot(PathBuf),
    #[error("no vaults found {0}")]
    NoVaults(String),
    #[error("no job found with task_id {0}")]
    JobNotFound(String),
    #[error("archive {0} not found")]
    ArchiveNotFound(PathBuf),
    #[error("timestamp {value} is in incorrect format: {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("invalid vault name pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("job database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("job database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Nothing matched, as opposed to something breaking.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MissingRoot(_) | Self::NoVaults(_) | Self::JobNotFound(_) | Self::ArchiveNotFound(_)
        )
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidTimestamp { .. } | Self::InvalidName(_))
    }
}
