use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_daemon_executor::ExecutorError;
use backup_daemon_storage::StorageError;
use backup_daemon_transfer::TransferError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{context} err: {source}")]
    Command {
        context: String,
        #[source]
        source: ExecutorError,
    },

    #[error("{context} err: {source}")]
    Transfer {
        context: String,
        #[source]
        source: TransferError,
    },

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl DaemonError {
    pub(crate) fn command(context: impl Into<String>, source: ExecutorError) -> Self {
        Self::Command {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn transfer(context: impl Into<String>, source: TransferError) -> Self {
        Self::Transfer {
            context: context.into(),
            source,
        }
    }

    /// Classifies a storage failure by what went wrong.
    pub(crate) fn storage(context: impl Into<String>, source: StorageError) -> Self {
        let message = format!("{} err: {source}", context.into());
        if source.is_not_found() {
            Self::NotFound(message)
        } else if source.is_invalid_argument() {
            Self::InvalidArgument(message)
        } else {
            Self::Internal(anyhow::Error::new(source).context(message))
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DaemonError::Conflict(_) => StatusCode::CONFLICT,
            DaemonError::Command { .. } | DaemonError::Transfer { .. } | DaemonError::Internal(_) => {
                tracing::error!("request failed: {self}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_keep_their_class() {
        let err = DaemonError::storage("failed to select job", StorageError::JobNotFound("t1".into()));
        assert!(matches!(err, DaemonError::NotFound(_)));
        assert_eq!(err.to_string(), "failed to select job err: no job found with task_id t1");

        let err = DaemonError::storage(
            "failed to open db",
            StorageError::MissingRoot("/nowhere".into()),
        );
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = DaemonError::storage(
            "failed to remove vault",
            StorageError::Io {
                context: "failed to remove /x".into(),
                source: io,
            },
        );
        assert!(matches!(err, DaemonError::Internal(_)));
        assert!(err.to_string().starts_with("failed to remove vault err: failed to remove /x"));
    }

    #[test]
    fn conflicts_map_to_409() {
        let response = DaemonError::Conflict("vault is locked".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
