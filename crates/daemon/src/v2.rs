//! Mapping between the camelCase `/api/v1` payloads and the orchestrator.

use std::collections::HashMap;

use backup_daemon_core::request::{
    BackupV2Request, BackupV2Response, DatabaseV2Status, RestoreV2Request, RestoreV2Response,
};
use backup_daemon_core::{BackupRequest, DbEntry, Job, JobStatus, ProcType, RestoreRequest};
use chrono::Utc;

use crate::error::DaemonError;

pub const NOT_STARTED: &str = "notStarted";
pub const IN_PROGRESS: &str = "inProgress";
pub const COMPLETED: &str = "completed";
pub const FAILED: &str = "failed";
pub const UNKNOWN: &str = "unknown";

/// Strips whitespace, quotes and surrounding slashes.
pub fn normalize_blob_path(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .trim_matches('/')
        .to_string()
}

pub fn require_blob_path(raw: &str) -> Result<String, DaemonError> {
    let blob = normalize_blob_path(raw);
    if blob.is_empty() {
        return Err(DaemonError::InvalidArgument(
            "blobPath must be a non-empty string".into(),
        ));
    }
    Ok(blob)
}

pub fn map_job_status(status: &str) -> &'static str {
    match JobStatus::parse(status.trim()) {
        Some(JobStatus::Queued) => NOT_STARTED,
        Some(JobStatus::Processing) => IN_PROGRESS,
        Some(JobStatus::Successful) => COMPLETED,
        Some(JobStatus::Failed) => FAILED,
        None => UNKNOWN,
    }
}

fn status_of(job: &Job) -> &'static str {
    map_job_status(job.status.as_str())
}

fn db_statuses<'a>(names: impl IntoIterator<Item = &'a str>, status: &str) -> Vec<DatabaseV2Status> {
    names
        .into_iter()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| DatabaseV2Status {
            database_name: name.to_string(),
            status: status.to_string(),
        })
        .collect()
}

fn creation_time(job: &Job) -> String {
    job.creation_time.unwrap_or_else(Utc::now).to_rfc3339()
}

pub fn backup_request(req: &BackupV2Request, blob: &str, proc_type: ProcType) -> BackupRequest {
    let custom_vars = HashMap::from([
        ("storageName".to_string(), req.storage_name.clone()),
        ("blob_path".to_string(), blob.to_string()),
    ]);
    BackupRequest {
        dbs: req
            .databases
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(|name| DbEntry::Name(name.to_string()))
            .collect(),
        allow_eviction: true,
        custom_vars,
        proc_type,
        ..BackupRequest::default()
    }
}

/// Every item must name both sides of the mapping.
pub fn restore_request(
    backup_id: &str,
    req: &RestoreV2Request,
    blob: &str,
    proc_type: ProcType,
) -> Result<RestoreRequest, DaemonError> {
    let mut dbs = Vec::with_capacity(req.databases.len());
    let mut dbmap = HashMap::new();
    for item in &req.databases {
        let source = item.previous_database_name.trim();
        let target = item.database_name.trim();
        if source.is_empty() || target.is_empty() {
            return Err(DaemonError::InvalidArgument(
                "each databases item must have previousDatabaseName and databaseName".into(),
            ));
        }
        dbs.push(DbEntry::Name(source.to_string()));
        if source != target {
            dbmap.insert(source.to_string(), target.to_string());
        }
    }

    let custom_vars = HashMap::from([
        ("storageName".to_string(), req.storage_name.clone()),
        ("blob_path".to_string(), blob.to_string()),
        ("dryRun".to_string(), req.dry_run.to_string()),
    ]);
    Ok(RestoreRequest {
        vault: backup_id.to_string(),
        dbs,
        change_db_names: dbmap,
        custom_vars,
        proc_type,
        ..RestoreRequest::default()
    })
}

pub fn backup_response(job: &Job) -> BackupV2Response {
    let status = status_of(job);
    let names = job.database_names();
    BackupV2Response {
        status: status.to_string(),
        backup_id: job.task_id.clone(),
        creation_time: creation_time(job),
        storage_name: job.storage_name.trim().to_string(),
        blob_path: normalize_blob_path(&job.blob_path),
        databases: db_statuses(names.iter().map(String::as_str), status),
    }
}

pub fn restore_response(job: &Job) -> RestoreV2Response {
    let status = status_of(job);
    let names = job.database_names();
    RestoreV2Response {
        status: status.to_string(),
        restore_id: job.task_id.clone(),
        creation_time: creation_time(job),
        storage_name: job.storage_name.trim().to_string(),
        blob_path: normalize_blob_path(&job.blob_path),
        databases: db_statuses(names.iter().map(String::as_str), status),
    }
}
