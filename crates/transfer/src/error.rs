use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("prefix must not be empty")]
    EmptyPrefix,
    #[error("object {key} in bucket {bucket} is too large for a streamed upload")]
    TooLarge { bucket: String, key: String },
    #[error("failed to upload {key} to bucket {bucket}: {source}")]
    Upload {
        bucket: String,
        key: String,
        #[source]
        source: object_store::Error,
    },
    #[error("object {key} did not become visible in bucket {bucket}")]
    NotVisible { bucket: String, key: String },
    #[error("failed to download {key} from bucket {bucket}: {source}")]
    Download {
        bucket: String,
        key: String,
        #[source]
        source: object_store::Error,
    },
    #[error("failed to list objects under {prefix:?} in bucket {bucket}: {source}")]
    List {
        bucket: String,
        prefix: String,
        #[source]
        source: object_store::Error,
    },
    #[error("failed to delete objects under {prefix:?} in bucket {bucket}: {source}")]
    Delete {
        bucket: String,
        prefix: String,
        #[source]
        source: object_store::Error,
    },
    #[error("failed to sign url for {key}: {source}")]
    Sign {
        key: String,
        #[source]
        source: object_store::Error,
    },
    #[error("object store does not support presigned urls")]
    SigningUnsupported,
    #[error("invalid s3 configuration: {0}")]
    Configure(String),
    #[error("{key} is not under {prefix}")]
    RelativePath { key: String, prefix: String },
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
