use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a request came in on the plain or the incremental routes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcType {
    #[default]
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "backup")]
    Backup,
    #[serde(rename = "incremental backup")]
    IncrementalBackup,
    #[serde(rename = "restore")]
    Restore,
    #[serde(rename = "incremental restore")]
    IncrementalRestore,
}

impl JobType {
    pub fn backup(proc_type: ProcType) -> Self {
        match proc_type {
            ProcType::Full => Self::Backup,
            ProcType::Incremental => Self::IncrementalBackup,
        }
    }

    pub fn restore(proc_type: ProcType) -> Self {
        match proc_type {
            ProcType::Full => Self::Restore,
            ProcType::Incremental => Self::IncrementalRestore,
        }
    }

    pub fn is_restore(self) -> bool {
        matches!(self, Self::Restore | Self::IncrementalRestore)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::IncrementalBackup => "incremental backup",
            Self::Restore => "restore",
            Self::IncrementalRestore => "incremental restore",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backup" => Some(Self::Backup),
            "incremental backup" => Some(Self::IncrementalBackup),
            "restore" => Some(Self::Restore),
            "incremental restore" => Some(Self::IncrementalRestore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Successful,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Processing => "Processing",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Queued" => Some(Self::Queued),
            "Processing" => Some(Self::Processing),
            "Successful" => Some(Self::Successful),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// HTTP-style outcome code reported by job status queries.
    pub fn outcome_code(self) -> u16 {
        match self {
            Self::Successful => 200,
            Self::Failed => 500,
            Self::Queued | Self::Processing => 206,
        }
    }
}

/// Durable record of one backup or restore task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub task_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub vault: String,
    pub err: String,
    pub storage_name: String,
    pub blob_path: String,
    /// JSON array of database names, or empty when none were selected.
    pub databases: String,
    /// Set by the ledger on first insert.
    pub creation_time: Option<DateTime<Utc>>,
}

impl Job {
    pub fn queued(task_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            task_id: task_id.into(),
            job_type,
            status: JobStatus::Queued,
            vault: String::new(),
            err: String::new(),
            storage_name: String::new(),
            blob_path: String::new(),
            databases: String::new(),
            creation_time: None,
        }
    }

    /// Decoded database list; unparsable or empty values yield no names.
    pub fn database_names(&self) -> Vec<String> {
        if self.databases.trim().is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.databases).unwrap_or_default()
    }
}

/// Encodes a database list the way the ledger stores it.
pub fn encode_database_names(names: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }
    serde_json::to_string(names).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_round_trips_through_ledger_strings() {
        for job_type in [
            JobType::Backup,
            JobType::IncrementalBackup,
            JobType::Restore,
            JobType::IncrementalRestore,
        ] {
            assert_eq!(JobType::parse(job_type.as_str()), Some(job_type));
        }
        assert_eq!(JobType::restore(ProcType::Incremental).as_str(), "incremental restore");
        assert!(JobType::IncrementalRestore.is_restore());
        assert!(!JobType::Backup.is_restore());
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(JobStatus::Successful.outcome_code(), 200);
        assert_eq!(JobStatus::Failed.outcome_code(), 500);
        assert_eq!(JobStatus::Queued.outcome_code(), 206);
        assert_eq!(JobStatus::Processing.outcome_code(), 206);
    }

    #[test]
    fn database_names_tolerate_garbage() {
        let mut job = Job::queued("t1", JobType::Backup);
        assert!(job.database_names().is_empty());

        job.databases = "not json".into();
        assert!(job.database_names().is_empty());

        job.databases = encode_database_names(&["a".into(), "b".into()]);
        assert_eq!(job.databases, r#"["a","b"]"#);
        assert_eq!(job.database_names(), vec!["a", "b"]);
        assert_eq!(encode_database_names(&[]), "");
    }
}
