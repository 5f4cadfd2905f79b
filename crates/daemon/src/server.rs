use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_daemon_core::request::{BackupV2Request, BackupV2Response, RestoreV2Request, RestoreV2Response};
use backup_daemon_core::{
    BackupRequest, BackupResponse, PresignResponse, ProcType, RestoreRequest, RestoreResponse,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::daemon::BackupDaemon;
use crate::error::DaemonError;
use crate::v2;

#[derive(Clone)]
pub struct AppState {
    pub daemon: BackupDaemon,
}

pub fn build_router(state: AppState) -> Router {
    let incremental = Router::new()
        .route("/backup", post(backup))
        .route("/restore", post(restore))
        .route("/evict", post(evict))
        .route("/evict/{vault}", post(evict_vault))
        .route("/jobstatus/{task_id}", get(job_status));

    let api = Router::new()
        .route("/backup", post(backup_v2))
        .route("/backup/{backup_id}", get(backup_v2_status).delete(delete_v2))
        .route("/restore/{id}", post(restore_v2).get(restore_v2_status));

    Router::new()
        .route("/backup", post(backup))
        .route("/restore", post(restore))
        .route("/external/restore", post(external_restore))
        .route("/evict", post(evict))
        .route("/evict/{vault}", post(evict_vault))
        .route("/jobstatus/{task_id}", get(job_status))
        .route("/backup/s3/{backup_id}", get(presigned_urls))
        .route("/backup/{backup_id}/archive/{file}", get(download_archive))
        .route("/health", get(health))
        .nest("/incremental", incremental)
        .nest("/api/v1", api)
        .fallback(not_found)
        .with_state(state)
}

fn proc_type(uri: &OriginalUri) -> ProcType {
    if uri.path().contains("incremental") {
        ProcType::Incremental
    } else {
        ProcType::Full
    }
}

/// Empty bodies decode to the default request.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, DaemonError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| DaemonError::InvalidArgument(format!("failed to unmarshall body err: {err}")))
}

fn ok_message() -> Json<Value> {
    Json(json!({ "message": "OK" }))
}

async fn health() -> Json<Value> {
    ok_message()
}

async fn not_found() -> DaemonError {
    DaemonError::NotFound("Page not found".into())
}

async fn backup(
    State(state): State<AppState>,
    uri: OriginalUri,
    body: Bytes,
) -> Result<Json<BackupResponse>, DaemonError> {
    let mut req: BackupRequest = parse_body(&body)?;
    req.proc_type = proc_type(&uri);
    Ok(Json(state.daemon.enqueue_backup(req).await?))
}

async fn restore(
    State(state): State<AppState>,
    uri: OriginalUri,
    body: Bytes,
) -> Result<Json<RestoreResponse>, DaemonError> {
    let mut req: RestoreRequest = parse_body(&body)?;
    if req.vault.is_empty() && req.timestamp.is_empty() {
        return Err(DaemonError::NotFound(
            "Sorry, wrong JSON string. No 'vault' or 'ts' parameter".into(),
        ));
    }
    req.proc_type = proc_type(&uri);
    Ok(Json(state.daemon.restore(req).await?))
}

/// The whole body is custom variables; `vault`, `ts` and
/// `externalBackupPath` among them select the source.
async fn external_restore(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RestoreResponse>, DaemonError> {
    let custom_vars: HashMap<String, String> = parse_body(&body)?;
    let pick = |key: &str| custom_vars.get(key).cloned().unwrap_or_default();
    let req = RestoreRequest {
        vault: pick("vault"),
        timestamp: pick("ts"),
        external_backup_path: pick("externalBackupPath"),
        custom_vars: custom_vars.clone(),
        proc_type: ProcType::Full,
        ..RestoreRequest::default()
    };
    Ok(Json(state.daemon.restore(req).await?))
}

async fn evict(State(state): State<AppState>) -> Result<Json<Value>, DaemonError> {
    state.daemon.evict_sweep().await?;
    Ok(ok_message())
}

async fn evict_vault(
    State(state): State<AppState>,
    Path(vault): Path<String>,
) -> Result<Json<Value>, DaemonError> {
    state.daemon.evict_by_name(&vault).await?;
    Ok(ok_message())
}

async fn job_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, DaemonError> {
    let resp = state.daemon.job_status(&task_id).await?;
    if resp.status_code == StatusCode::NOT_FOUND.as_u16() {
        return Err(DaemonError::NotFound(format!(
            "Sorry, no job '{task_id}' recorded in database"
        )));
    }
    let code = StatusCode::from_u16(resp.status_code).unwrap_or(StatusCode::PARTIAL_CONTENT);
    Ok((code, Json(resp)).into_response())
}

#[derive(Debug, Deserialize)]
struct PresignQuery {
    #[serde(default)]
    expiration: u64,
    #[serde(default, rename = "blobPath")]
    blob_path: String,
}

async fn presigned_urls(
    State(state): State<AppState>,
    Path(backup_id): Path<String>,
    Query(query): Query<PresignQuery>,
) -> Result<Json<PresignResponse>, DaemonError> {
    let resp = state
        .daemon
        .presigned_urls(&backup_id, query.expiration, &query.blob_path)
        .await?;
    Ok(Json(resp))
}

async fn download_archive(
    State(state): State<AppState>,
    Path((backup_id, file)): Path<(String, String)>,
) -> Result<Response, DaemonError> {
    let path = state.daemon.archive_path(&backup_id, &file).await?;
    let handle = tokio::fs::File::open(&path).await.map_err(|err| {
        DaemonError::Internal(anyhow::Error::new(err).context(format!("failed to open {}", path.display())))
    })?;
    info!(backup_id = %backup_id, file = %file, "streaming archive");

    let disposition = format!("attachment; filename=\"{file}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(handle)),
    )
        .into_response())
}

async fn backup_v2(
    State(state): State<AppState>,
    uri: OriginalUri,
    body: Bytes,
) -> Result<Json<BackupV2Response>, DaemonError> {
    let req: BackupV2Request = parse_body(&body)?;
    let blob = v2::require_blob_path(&req.blob_path)?;
    let internal = v2::backup_request(&req, &blob, proc_type(&uri));
    let created = state.daemon.enqueue_backup(internal).await?;
    let job = state.daemon.job(&created.backup_id).await?;
    Ok(Json(v2::backup_response(&job)))
}

async fn backup_v2_status(
    State(state): State<AppState>,
    Path(backup_id): Path<String>,
) -> Result<Json<BackupV2Response>, DaemonError> {
    let job = state.daemon.job(&backup_id).await.map_err(|err| match err {
        DaemonError::NotFound(_) => {
            DaemonError::NotFound(format!("Sorry, no job '{backup_id}' recorded in database"))
        }
        other => other,
    })?;
    Ok(Json(v2::backup_response(&job)))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default, rename = "blobPath")]
    blob_path: String,
}

async fn delete_v2(
    State(state): State<AppState>,
    Path(backup_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, DaemonError> {
    let backup_id = backup_id.trim();
    if backup_id.is_empty() {
        return Err(DaemonError::InvalidArgument("backup_id is required".into()));
    }
    let blob = v2::normalize_blob_path(&query.blob_path);
    if blob.is_empty() {
        return Err(DaemonError::InvalidArgument("blobPath is required".into()));
    }
    state.daemon.evict_v2(backup_id, &blob).await?;
    Ok(Json(json!({
        "message": "OK",
        "backupId": backup_id,
        "blobPath": blob,
    })))
}

async fn restore_v2(
    State(state): State<AppState>,
    uri: OriginalUri,
    Path(backup_id): Path<String>,
    body: Bytes,
) -> Result<Json<RestoreV2Response>, DaemonError> {
    let req: RestoreV2Request = parse_body(&body)?;
    let blob = v2::require_blob_path(&req.blob_path)?;
    let internal = v2::restore_request(&backup_id, &req, &blob, proc_type(&uri))?;
    let started = state.daemon.restore(internal).await?;
    let job = state.daemon.job(&started.task_id).await?;
    Ok(Json(v2::restore_response(&job)))
}

async fn restore_v2_status(
    State(state): State<AppState>,
    Path(restore_id): Path<String>,
) -> Result<Json<RestoreV2Response>, DaemonError> {
    let restore_id = restore_id.trim();
    if restore_id.is_empty() {
        return Err(DaemonError::InvalidArgument("restore_id is required".into()));
    }
    let job = state.daemon.job(restore_id).await.map_err(|err| match err {
        DaemonError::NotFound(_) => {
            DaemonError::NotFound(format!("Sorry, no job '{restore_id}' recorded in database"))
        }
        other => other,
    })?;
    if !job.job_type.is_restore() {
        return Err(DaemonError::NotFound(format!(
            "job '{restore_id}' is not a restore task"
        )));
    }
    Ok(Json(v2::restore_response(&job)))
}
