use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_daemon_core::vault::RESTORE_LOGS_FOLDER;
use backup_daemon_core::{
    encode_database_names, obsolete_vaults, BackupRequest, BackupResponse, Job, JobStatus,
    JobStatusResponse, JobType, PresignResponse, ProcType, RestoreRequest, RestoreResponse, Vault,
    VaultKind,
};
use backup_daemon_executor::{CommandExecutor, ExecutorError, RestoreRun};
use backup_daemon_storage::{
    is_plain_name, tail_lines, JobStore, NewVault, StorageError, VaultRepository,
};
use backup_daemon_transfer::ObjectTransfer;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DaemonError;
use crate::v2::normalize_blob_path;

const TAIL_LINES: usize = 5;
const ARCHIVE_EXTENSIONS: [&str; 3] = [".zip", ".tar", ".gz"];
const STORAGE_NAME_VAR: &str = "storageName";
const BLOB_PATH_VAR: &str = "blob_path";
const START_TS_VAR: &str = "start_ts";

#[derive(Debug, Clone)]
pub struct EvictionPolicies {
    pub full: String,
    pub granular: String,
}

/// Coordinates the vault tree, the job ledger, the external tooling and the
/// optional object store.
#[derive(Clone)]
pub struct BackupDaemon {
    vaults: Arc<VaultRepository>,
    jobs: Arc<dyn JobStore>,
    executor: Arc<dyn CommandExecutor>,
    transfer: Option<ObjectTransfer>,
    policies: EvictionPolicies,
    scratch_root: PathBuf,
}

impl BackupDaemon {
    pub fn new(
        vaults: VaultRepository,
        jobs: Arc<dyn JobStore>,
        executor: Arc<dyn CommandExecutor>,
        transfer: Option<ObjectTransfer>,
        policies: EvictionPolicies,
    ) -> Self {
        Self {
            vaults: Arc::new(vaults),
            jobs,
            executor,
            transfer,
            policies,
            scratch_root: std::env::temp_dir().join("backup-daemon").join("restore"),
        }
    }

    /// Where blob-path restores are downloaded to.
    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    pub async fn enqueue_backup(&self, mut req: BackupRequest) -> Result<BackupResponse, DaemonError> {
        let external = !req.external_backup_path.is_empty();
        let granular = !req.dbs.is_empty();

        if req.proc_type == ProcType::Incremental {
            let (kind, subpath) = if external {
                let kind = if granular { VaultKind::Granular } else { VaultKind::Full };
                (kind, req.external_backup_path.clone())
            } else {
                (VaultKind::All, String::new())
            };
            let listed = self
                .blocking_vaults(move |vaults| vaults.list_names(true, kind, &subpath))
                .await?;
            let mut stamps: Vec<i64> = match listed {
                Ok(names) => names.iter().filter_map(|name| name.parse().ok()).collect(),
                Err(err) if err.is_not_found() => Vec::new(),
                Err(err) => return Err(DaemonError::storage("failed to list backups", err)),
            };
            stamps.sort_unstable_by(|a, b| b.cmp(a));
            if let Some(newest) = stamps.first() {
                req.custom_vars
                    .insert(START_TS_VAR.to_string(), newest.to_string());
            }
        }

        let raw_blob = raw_blob(&req.custom_vars);
        let blob = normalize_blob_path(&raw_blob);
        let (allow_eviction, sharded) = (req.allow_eviction, req.sharded);
        let subpath = req.external_backup_path.clone();
        let prefix = req.prefix.clone();
        let blob_prefix = blob.clone();
        let vault = self
            .blocking_vaults(move |vaults| {
                let target = if blob_prefix.is_empty() {
                    NewVault {
                        allow_eviction,
                        granular,
                        sharded,
                        external,
                        external_subpath: &subpath,
                        prefix: &prefix,
                        ..NewVault::default()
                    }
                } else {
                    NewVault {
                        allow_eviction,
                        granular,
                        sharded,
                        prefix: &prefix,
                        blob_prefix: &blob_prefix,
                        ..NewVault::default()
                    }
                };
                vaults.open(&target)
            })
            .await?;
        let backup_id = vault.name();

        let names: Vec<String> = req.dbs.iter().map(|db| db.name().to_string()).collect();
        let mut job = Job {
            vault: backup_id.clone(),
            storage_name: req.custom_vars.get(STORAGE_NAME_VAR).cloned().unwrap_or_default(),
            blob_path: raw_blob,
            databases: encode_database_names(&names),
            ..Job::queued(backup_id.clone(), JobType::backup(req.proc_type))
        };
        self.record(&job).await?;
        info!(backup_id = %backup_id, folder = %vault.folder.display(), granular, "backup queued");

        let run_vault = vault.clone();
        let dbs = req.dbs.clone();
        let custom_vars = req.custom_vars.clone();
        let result = self
            .blocking_executor(move |executor| executor.perform_backup(&run_vault, &dbs, &custom_vars))
            .await?;
        if let Err(err) = result {
            job.status = JobStatus::Failed;
            job.err = tail_or(&vault.console_path(), &err);
            if let Err(update) = self.jobs.upsert(&job).await {
                warn!(backup_id = %backup_id, error = %update, "failed to record backup failure");
            }
            return Err(DaemonError::command("failed to perform backup", err));
        }

        if let Some(transfer) = &self.transfer {
            let prefix = (!blob.is_empty()).then(|| format!("{blob}/{backup_id}"));
            transfer
                .upload_folder(&vault.folder, prefix.as_deref())
                .await
                .map_err(|err| DaemonError::transfer("failed to upload folder to s3", err))?;
        }

        job.status = JobStatus::Successful;
        self.record(&job).await?;
        info!(backup_id = %backup_id, "backup finished");
        Ok(BackupResponse { backup_id })
    }

    /// Runs a restore under a fresh task id. Failures after the job is
    /// queued leave it marked Failed.
    pub async fn restore(&self, req: RestoreRequest) -> Result<RestoreResponse, DaemonError> {
        let task_id = Uuid::new_v4().to_string();
        let names: Vec<String> = req
            .dbs
            .iter()
            .map(|db| {
                req.change_db_names
                    .get(db.name())
                    .cloned()
                    .unwrap_or_else(|| db.name().to_string())
            })
            .collect();
        let mut job = Job {
            storage_name: req.custom_vars.get(STORAGE_NAME_VAR).cloned().unwrap_or_default(),
            blob_path: raw_blob(&req.custom_vars),
            databases: encode_database_names(&names),
            ..Job::queued(task_id.clone(), JobType::restore(req.proc_type))
        };
        self.record(&job).await?;

        if let Err(err) = self.run_restore(&mut job, &req).await {
            if job.status != JobStatus::Failed {
                job.status = JobStatus::Failed;
                job.err = err.to_string();
                if let Err(update) = self.jobs.upsert(&job).await {
                    warn!(task_id = %task_id, error = %update, "failed to record restore failure");
                }
            }
            return Err(err);
        }
        Ok(RestoreResponse { task_id })
    }

    async fn run_restore(&self, job: &mut Job, req: &RestoreRequest) -> Result<(), DaemonError> {
        let external = !req.external_backup_path.is_empty();
        let vault_name = if req.vault.trim().is_empty() {
            let ts = req.timestamp.clone();
            self.blocking_vaults(move |vaults| vaults.find_by_timestamp(&ts, VaultKind::All, ""))
                .await?
                .map_err(|err| {
                    DaemonError::storage(format!("failed to find backup by ts {}", req.timestamp), err)
                })?
        } else {
            req.vault.trim().to_string()
        };
        if !is_plain_name(&vault_name) {
            return Err(DaemonError::InvalidArgument(format!(
                "invalid backup vault name {vault_name:?}"
            )));
        }
        job.vault = vault_name.clone();
        let blob = normalize_blob_path(&job.blob_path);

        let folder = match &self.transfer {
            Some(transfer) if !blob.is_empty() => {
                let scratch = self.scratch_root.join(&vault_name);
                reset_dir(&scratch).await?;
                let prefix = format!("{blob}/{vault_name}");
                let downloaded = transfer
                    .download_folder(&prefix, &scratch)
                    .await
                    .map_err(|err| {
                        DaemonError::transfer(format!("failed to download backup from s3 prefix={prefix}"), err)
                    })?;
                if downloaded == 0 {
                    return Err(DaemonError::NotFound(format!(
                        "backup vault {vault_name} not found in s3 prefix={prefix}"
                    )));
                }
                scratch
            }
            Some(transfer) => {
                let vault = self
                    .resolve(&vault_name, external, &req.external_backup_path, "", true)
                    .await?;
                require_vault(&vault, &vault_name)?;
                transfer
                    .download_folder(&vault.folder.to_string_lossy(), Path::new(""))
                    .await
                    .map_err(|err| DaemonError::transfer("failed to download backup", err))?;
                vault.folder
            }
            None => {
                let vault = if external {
                    self.resolve(&vault_name, true, &req.external_backup_path, "", false)
                        .await?
                } else {
                    self.locate(&vault_name, &blob).await?
                };
                require_vault(&vault, &vault_name)?;
                vault.folder
            }
        };
        info!(task_id = %job.task_id, folder = %folder.display(), "restoring backup");

        if !req.dbs.is_empty() {
            let list_folder = folder.clone();
            let backed: HashSet<String> = self
                .blocking_executor(move |executor| executor.backup_databases(&list_folder))
                .await?
                .map_err(|err| DaemonError::command("failed to get backup dbs", err))?
                .into_iter()
                .collect();

            let missing: Vec<&str> = req
                .dbs
                .iter()
                .map(|db| db.name())
                .filter(|name| !backed.contains(*name))
                .collect();
            let unknown_sources: BTreeSet<&str> = req
                .change_db_names
                .keys()
                .map(String::as_str)
                .filter(|name| !backed.contains(*name))
                .collect();
            let problem = if !missing.is_empty() {
                Some(format!(
                    "databases {missing:?} do not exist in backup {}",
                    folder.display()
                ))
            } else {
                unknown_sources.first().map(|name| {
                    format!(
                        "database name {name} from dbmap does not exist in backup {}",
                        folder.display()
                    )
                })
            };
            if let Some(problem) = problem {
                job.status = JobStatus::Failed;
                job.err = problem.clone();
                self.record(job).await?;
                return Err(DaemonError::InvalidArgument(problem));
            }
        }

        job.status = JobStatus::Processing;
        self.record(job).await?;

        let run = RestoreRun {
            vault_folder: folder.clone(),
            dbs: req.dbs.clone(),
            dbmap: req.change_db_names.clone(),
            custom_vars: req.custom_vars.clone(),
            external,
            task_id: job.task_id.clone(),
        };
        let log_path = run.log_path();
        let result = self
            .blocking_executor(move |executor| executor.perform_restore(&run))
            .await?;
        self.upload_restore_logs(&folder, &blob, &vault_name).await;

        if let Err(err) = result {
            job.status = JobStatus::Failed;
            job.err = tail_or(&log_path, &err);
            self.record(job).await?;
            return Err(DaemonError::command("failed to perform restore", err));
        }
        job.status = JobStatus::Successful;
        job.err.clear();
        self.record(job).await?;
        info!(task_id = %job.task_id, vault = %vault_name, "restore finished");
        Ok(())
    }

    async fn upload_restore_logs(&self, folder: &Path, blob: &str, vault_name: &str) {
        let Some(transfer) = &self.transfer else {
            return;
        };
        let logs = folder.join(RESTORE_LOGS_FOLDER);
        let has_logs = tokio::fs::metadata(&logs)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if blob.is_empty() || !has_logs {
            return;
        }
        let prefix = format!("{blob}/{vault_name}/{RESTORE_LOGS_FOLDER}");
        if let Err(err) = transfer.upload_folder(&logs, Some(&prefix)).await {
            warn!(prefix = %prefix, error = %err, "failed to upload restore logs");
        }
    }

    /// Applies both retention policies and evicts everything they mark
    /// obsolete. The first failing step aborts the sweep.
    pub async fn evict_sweep(&self) -> Result<usize, DaemonError> {
        let (excluded, full, granular) = self
            .blocking_vaults(|vaults| -> Result<_, DaemonError> {
                let excluded = vaults.non_evictable(VaultKind::All).map_err(|err| {
                    DaemonError::storage("failed to list all non evictable vaults", err)
                })?;
                let full = vaults
                    .list(VaultKind::Full, "")
                    .map_err(|err| DaemonError::storage("failed to list full vaults", err))?;
                let granular = vaults
                    .list(VaultKind::Granular, "")
                    .map_err(|err| DaemonError::storage("failed to list granular vaults", err))?;
                Ok((excluded, full, granular))
            })
            .await??;

        let now = Utc::now();
        let mut obsolete = obsolete_vaults(&full, &self.policies.full, &excluded, now).map_err(|err| {
            DaemonError::InvalidArgument(format!("failed to evaluate full eviction policy err: {err}"))
        })?;
        obsolete.extend(
            obsolete_vaults(&granular, &self.policies.granular, &excluded, now).map_err(|err| {
                DaemonError::InvalidArgument(format!(
                    "failed to evaluate granular eviction policy err: {err}"
                ))
            })?,
        );

        for vault in &obsolete {
            self.evict_vault(vault).await?;
        }
        info!(evicted = obsolete.len(), "eviction sweep finished");
        Ok(obsolete.len())
    }

    async fn evict_vault(&self, vault: &Vault) -> Result<(), DaemonError> {
        let name = vault.name();
        let target = vault.folder.clone();
        self.blocking_vaults(move |vaults| vaults.evict(&target))
            .await?
            .map_err(|err| {
                DaemonError::storage(format!("failed to evict backup {} from storage", vault.folder.display()), err)
            })?;
        self.forget_vault(&name).await?;

        let folder = vault.folder.clone();
        self.blocking_executor(move |executor| executor.execute_evict(&folder))
            .await?
            .map_err(|err| DaemonError::command("failed to evict backup from executor", err))?;
        info!(vault = %name, "evicted backup");
        Ok(())
    }

    /// Drops the ledger rows of an evicted vault; having none is fine.
    async fn forget_vault(&self, name: &str) -> Result<(), DaemonError> {
        match self.jobs.delete_by_vault(name).await {
            Ok(_) => Ok(()),
            // vaults written by other tooling or before the ledger existed have no rows
            Err(StorageError::NoVaults(_)) => {
                debug!(vault = %name, "no jobs recorded for vault");
                Ok(())
            }
            Err(err) => Err(DaemonError::storage(
                format!("failed to remove backup {name} from database"),
                err,
            )),
        }
    }

    pub async fn evict_by_name(&self, name: &str) -> Result<(), DaemonError> {
        let vault = self.resolve(name, false, "", "", false).await?;
        require_vault(&vault, name)?;
        if vault.locked {
            return Err(DaemonError::Conflict(format!("backup vault {name} is locked")));
        }

        let wanted = name.trim().to_string();
        let listed = self
            .blocking_vaults(|vaults| vaults.list_names(false, VaultKind::All, ""))
            .await?
            .map_err(|err| DaemonError::storage("failed to list all backups", err))?;
        if !listed.contains(&wanted) {
            return Err(DaemonError::NotFound(format!(
                "backup vault {wanted} not found in storage"
            )));
        }
        self.evict_vault(&vault).await
    }

    /// Removes a backup by id, remote copy first. A vault missing locally
    /// still has its ledger row removed.
    pub async fn evict_v2(&self, backup_id: &str, blob_path: &str) -> Result<(), DaemonError> {
        let backup_id = backup_id.trim();
        if backup_id.is_empty() {
            return Err(DaemonError::InvalidArgument("vault is required".into()));
        }
        if !is_plain_name(backup_id) {
            return Err(DaemonError::InvalidArgument(format!(
                "invalid backup vault name {backup_id:?}"
            )));
        }
        let job = self
            .jobs
            .select_by_task_id(backup_id)
            .await
            .map_err(|err| DaemonError::storage(format!("failed to select job {backup_id}"), err))?;

        let mut blob = normalize_blob_path(blob_path);
        if blob.is_empty() {
            blob = normalize_blob_path(&job.blob_path);
        }

        let vault = self.locate(backup_id, &blob).await?;
        if vault.locked {
            return Err(DaemonError::Conflict(format!("backup vault {backup_id} is locked")));
        }

        if let Some(transfer) = self.transfer.as_ref().filter(|_| !blob.is_empty()) {
            let prefix = format!("{blob}/{backup_id}");
            transfer.delete_prefix(&prefix).await.map_err(|err| {
                DaemonError::transfer(format!("failed to delete from s3 prefix={prefix}"), err)
            })?;
        }

        if !vault.is_empty() {
            let target = vault.folder.clone();
            if let Err(err) = self.blocking_vaults(move |vaults| vaults.evict(&target)).await? {
                warn!(vault = %backup_id, error = %err, "failed to remove local backup");
            }
            let folder = vault.folder.clone();
            match self
                .blocking_executor(move |executor| executor.execute_evict(&folder))
                .await?
            {
                Ok(()) => {}
                Err(err) => warn!(vault = %backup_id, error = %err, "evict command failed"),
            }
        }

        self.jobs.delete_by_vault(backup_id).await.map_err(|err| {
            DaemonError::storage(format!("failed to remove backup {backup_id} from database"), err)
        })?;
        info!(vault = %backup_id, blob = %blob, "removed backup");
        Ok(())
    }

    pub async fn job(&self, task_id: &str) -> Result<Job, DaemonError> {
        self.jobs
            .select_by_task_id(task_id)
            .await
            .map_err(|err| DaemonError::storage("failed to select job", err))
    }

    pub async fn job_status(&self, task_id: &str) -> Result<JobStatusResponse, DaemonError> {
        let job = match self.jobs.select_by_task_id(task_id).await {
            Ok(job) => job,
            Err(StorageError::JobNotFound(_)) => return Ok(JobStatusResponse::not_found(task_id)),
            Err(err) => return Err(DaemonError::storage("failed to select job", err)),
        };
        Ok(JobStatusResponse {
            status: job.status.as_str().to_string(),
            vault: job.vault.clone(),
            job_type: job.job_type.as_str().to_string(),
            err: job.err.clone(),
            task_id: job.task_id.clone(),
            storage_name: job.storage_name.clone(),
            blob_path: job.blob_path.clone(),
            databases: job.database_names(),
            status_code: job.status.outcome_code(),
        })
    }

    /// Presigned URLs for the archives of an uploaded backup.
    pub async fn presigned_urls(
        &self,
        backup_id: &str,
        expiration_secs: u64,
        blob_path: &str,
    ) -> Result<PresignResponse, DaemonError> {
        let blob = normalize_blob_path(blob_path);
        let vault = self.locate(backup_id, &blob).await?;
        require_vault(&vault, backup_id)?;
        let transfer = self
            .transfer
            .as_ref()
            .ok_or_else(|| DaemonError::InvalidArgument("object storage is not enabled".into()))?;

        let prefix = if blob.is_empty() {
            vault.folder.to_string_lossy().into_owned()
        } else {
            format!("{blob}/{}", vault.name())
        };
        let files = transfer
            .list_files(&prefix)
            .await
            .map_err(|err| DaemonError::transfer("failed to list files from s3", err))?;

        let mut urls = Vec::new();
        for file in files
            .iter()
            .filter(|file| ARCHIVE_EXTENSIONS.iter().any(|ext| file.ends_with(ext)))
        {
            let url = transfer
                .presigned_url(file, expiration_secs)
                .await
                .map_err(|err| DaemonError::transfer("failed to create presigned url", err))?;
            urls.push(url);
        }
        Ok(PresignResponse { urls })
    }

    pub async fn archive_path(&self, backup_id: &str, file: &str) -> Result<PathBuf, DaemonError> {
        let (backup_id, file) = (backup_id.to_string(), file.to_string());
        self.blocking_vaults(move |vaults| vaults.archive_path(&backup_id, &file))
            .await?
            .map_err(|err| DaemonError::storage("failed to open archive", err))
    }

    async fn resolve(
        &self,
        name: &str,
        external: bool,
        subpath: &str,
        blob: &str,
        skip_fs_check: bool,
    ) -> Result<Vault, DaemonError> {
        let (name, subpath, blob) = (name.to_string(), subpath.to_string(), blob.to_string());
        self.blocking_vaults(move |vaults| vaults.resolve(&name, external, &subpath, &blob, skip_fs_check))
            .await
    }

    /// A managed vault under `blob`, or directly under the root.
    async fn locate(&self, name: &str, blob: &str) -> Result<Vault, DaemonError> {
        let (name, blob) = (name.to_string(), blob.to_string());
        self.blocking_vaults(move |vaults| {
            let vault = vaults.resolve(&name, false, "", &blob, false);
            if vault.is_empty() && !blob.is_empty() {
                return vaults.resolve(&name, false, "", "", false);
            }
            vault
        })
        .await
    }

    async fn record(&self, job: &Job) -> Result<(), DaemonError> {
        self.jobs
            .upsert(job)
            .await
            .map_err(|err| DaemonError::storage("failed to update job", err))
    }

    async fn blocking_vaults<T, F>(&self, f: F) -> Result<T, DaemonError>
    where
        F: FnOnce(&VaultRepository) -> T + Send + 'static,
        T: Send + 'static,
    {
        let vaults = Arc::clone(&self.vaults);
        tokio::task::spawn_blocking(move || f(&vaults))
            .await
            .map_err(|err| DaemonError::Internal(anyhow::Error::new(err).context("vault task failed")))
    }

    async fn blocking_executor<T, F>(&self, f: F) -> Result<T, DaemonError>
    where
        F: FnOnce(&dyn CommandExecutor) -> T + Send + 'static,
        T: Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || f(executor.as_ref()))
            .await
            .map_err(|err| DaemonError::Internal(anyhow::Error::new(err).context("command task failed")))
    }
}

/// The blob path as the caller sent it; keys use the normalized form.
fn raw_blob(custom_vars: &std::collections::HashMap<String, String>) -> String {
    custom_vars.get(BLOB_PATH_VAR).cloned().unwrap_or_default()
}

fn require_vault(vault: &Vault, name: &str) -> Result<(), DaemonError> {
    if vault.is_empty() {
        return Err(DaemonError::NotFound(format!(
            "backup vault {} not found in storage",
            name.trim()
        )));
    }
    Ok(())
}

/// Last lines of a run log, or the error itself when the log is unreadable.
fn tail_or(log: &Path, err: &ExecutorError) -> String {
    match tail_lines(log, TAIL_LINES) {
        Ok(tail) if !tail.trim().is_empty() => tail,
        Ok(_) => err.to_string(),
        Err(tail_err) => {
            debug!(log = %log.display(), error = %tail_err, "no log to tail");
            err.to_string()
        }
    }
}

async fn reset_dir(dir: &Path) -> Result<(), DaemonError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(DaemonError::Internal(
                anyhow::Error::new(err).context(format!("failed to clear restore dir {}", dir.display())),
            ))
        }
    }
    tokio::fs::create_dir_all(dir).await.map_err(|err| {
        DaemonError::Internal(
            anyhow::Error::new(err).context(format!("failed to create restore dir {}", dir.display())),
        )
    })
}
