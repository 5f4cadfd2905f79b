use backup_daemon_core::Job;

use crate::StorageError;

/// Durable job records keyed by task id.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or update a job. A stored database list is never replaced by an empty one.
    async fn upsert(&self, job: &Job) -> Result<(), StorageError>;

    /// Delete every job recorded against `vault`, returning how many went away.
    async fn delete_by_vault(&self, vault: &str) -> Result<usize, StorageError>;

    async fn select_by_task_id(&self, task_id: &str) -> Result<Job, StorageError>;
}
