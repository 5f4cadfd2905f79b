use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Instant;

use backup_daemon_core::vault::{CONSOLE_FILE, CUSTOM_VARS_FILE, METRICS_FILE, RESTORE_LOGS_FOLDER};
use backup_daemon_core::{DbEntry, Vault};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

mod template;

pub use template::{render, tokenize};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0} command template is empty")]
    EmptyTemplate(&'static str),
    #[error("command is empty after rendering")]
    EmptyCommand,
    #[error("failed to parse command template: {0}")]
    TemplateParse(String),
    #[error("failed to render command template: {0}")]
    TemplateRender(String),
    #[error("failed to split command line {0:?}")]
    Quoting(String),
    #[error("failed to encode command arguments: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("command {command:?} failed ({status}){detail}")]
    Failed {
        command: String,
        status: ExitStatus,
        detail: String,
    },
}

/// Everything a restore run needs besides the templates.
#[derive(Debug, Clone, Default)]
pub struct RestoreRun {
    pub vault_folder: PathBuf,
    pub dbs: Vec<DbEntry>,
    pub dbmap: HashMap<String, String>,
    pub custom_vars: HashMap<String, String>,
    pub external: bool,
    pub task_id: String,
}

impl RestoreRun {
    pub fn log_path(&self) -> PathBuf {
        restore_log_path(&self.vault_folder, &self.task_id, self.external)
    }
}

/// Where a restore run writes its combined output.
pub fn restore_log_path(vault_folder: &Path, task_id: &str, external: bool) -> PathBuf {
    if external {
        vault_folder.join(format!("restore_{task_id}.log"))
    } else {
        vault_folder.join(RESTORE_LOGS_FOLDER).join(format!("{task_id}.log"))
    }
}

/// Runs the external backup tooling.
pub trait CommandExecutor: Send + Sync {
    /// Tells the tooling a vault was evicted.
    fn execute_evict(&self, vault_folder: &Path) -> Result<(), ExecutorError>;

    fn perform_backup(
        &self,
        vault: &Vault,
        dbs: &[DbEntry],
        custom_vars: &HashMap<String, String>,
    ) -> Result<(), ExecutorError>;

    fn perform_restore(&self, run: &RestoreRun) -> Result<(), ExecutorError>;

    /// Databases contained in a backup, one per non-blank output line.
    fn backup_databases(&self, vault_folder: &Path) -> Result<Vec<String>, ExecutorError>;
}

#[derive(Debug, Clone, Default)]
pub struct CommandTemplates {
    pub backup: String,
    pub restore: String,
    pub evict: String,
    pub db_list: String,
}

#[derive(Debug, Clone)]
pub struct Executor {
    templates: CommandTemplates,
    custom_vars: Vec<String>,
    databases_key: String,
    dbmap_key: String,
}

#[derive(Serialize)]
struct RunMetrics {
    spent_time: u128,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<String>,
}

impl Executor {
    pub fn new(
        templates: CommandTemplates,
        custom_vars: Vec<String>,
        databases_key: impl Into<String>,
        dbmap_key: impl Into<String>,
    ) -> Self {
        Self {
            templates,
            custom_vars,
            databases_key: databases_key.into(),
            dbmap_key: dbmap_key.into(),
        }
    }

    /// Renders and splits one command line.
    pub fn build_command(
        &self,
        template: &str,
        vault_folder: &Path,
        dbs: &[DbEntry],
        dbmap: &HashMap<String, String>,
        custom_vars: &HashMap<String, String>,
    ) -> Result<Vec<String>, ExecutorError> {
        let mut values = HashMap::from([
            ("data_folder".to_string(), vault_folder.display().to_string()),
            ("dbs".to_string(), String::new()),
            ("dbmap".to_string(), String::new()),
        ]);
        for name in &self.custom_vars {
            let fragment = match custom_vars.get(name) {
                Some(value) if !value.is_empty() => format!("-{name} {value}"),
                _ => String::new(),
            };
            values.insert(name.clone(), fragment);
        }
        if !dbs.is_empty() {
            let encoded = serde_json::to_string(dbs)?;
            values.insert("dbs".into(), format!("{} '{encoded}'", self.databases_key));
        }
        if !dbmap.is_empty() {
            let sorted: BTreeMap<_, _> = dbmap.iter().collect();
            let encoded = serde_json::to_string(&sorted)?;
            values.insert("dbmap".into(), format!("{} '{encoded}'", self.dbmap_key));
        }

        let argv = tokenize(&render(template, &values)?)?;
        if argv.is_empty() {
            return Err(ExecutorError::EmptyCommand);
        }
        Ok(argv)
    }

    fn write_metrics(&self, vault: &Vault, started: Instant, failure: Option<&ExecutorError>) {
        let path = if vault.metrics_path.as_os_str().is_empty() {
            vault.folder.join(METRICS_FILE)
        } else {
            vault.metrics_path.clone()
        };
        let metrics = RunMetrics {
            spent_time: started.elapsed().as_millis(),
            size: dir_size(&vault.folder),
            exception: failure.map(ToString::to_string),
        };
        write_json(&path, &metrics);
    }
}

impl CommandExecutor for Executor {
    fn execute_evict(&self, vault_folder: &Path) -> Result<(), ExecutorError> {
        if self.templates.evict.is_empty() {
            return Err(ExecutorError::EmptyTemplate("evict"));
        }
        let argv = self.build_command(
            &self.templates.evict,
            vault_folder,
            &[],
            &HashMap::new(),
            &HashMap::new(),
        )?;
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .status()
            .map_err(|source| spawn_error(&argv, source))?;
        check_status(&argv, status, String::new())
    }

    fn perform_backup(
        &self,
        vault: &Vault,
        dbs: &[DbEntry],
        custom_vars: &HashMap<String, String>,
    ) -> Result<(), ExecutorError> {
        let started = Instant::now();
        info!(vault = %vault.folder.display(), db_count = dbs.len(), "starting backup");
        fs::create_dir_all(&vault.folder).map_err(|source| ExecutorError::LogFile {
            path: vault.folder.clone(),
            source,
        })?;

        if !custom_vars.is_empty() {
            let path = if vault.custom_vars_path.as_os_str().is_empty() {
                vault.folder.join(CUSTOM_VARS_FILE)
            } else {
                vault.custom_vars_path.clone()
            };
            write_json(&path, custom_vars);
        }

        let result = self
            .build_command(&self.templates.backup, &vault.folder, dbs, &HashMap::new(), custom_vars)
            .and_then(|argv| run_logged(&argv, &vault.folder.join(CONSOLE_FILE)));
        self.write_metrics(vault, started, result.as_ref().err());

        if result.is_ok() {
            info!(vault = %vault.folder.display(), "backup finished");
        }
        result
    }

    fn perform_restore(&self, run: &RestoreRun) -> Result<(), ExecutorError> {
        let argv = self.build_command(
            &self.templates.restore,
            &run.vault_folder,
            &run.dbs,
            &run.dbmap,
            &run.custom_vars,
        )?;
        let log_path = run.log_path();
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir).map_err(|source| ExecutorError::LogFile {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        info!(task_id = %run.task_id, command = ?argv, "starting restore command");
        run_logged(&argv, &log_path)?;
        info!(task_id = %run.task_id, log = %log_path.display(), "restore command finished");
        Ok(())
    }

    fn backup_databases(&self, vault_folder: &Path) -> Result<Vec<String>, ExecutorError> {
        let argv = self.build_command(
            &self.templates.db_list,
            vault_folder,
            &[],
            &HashMap::new(),
            &HashMap::new(),
        )?;
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .map_err(|source| spawn_error(&argv, source))?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            stderr
        } else {
            format!(": {stderr}")
        };
        check_status(&argv, output.status, detail)?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Runs `argv` with stdout and stderr sent to `log_path`.
fn run_logged(argv: &[String], log_path: &Path) -> Result<(), ExecutorError> {
    let log_error = |source| ExecutorError::LogFile {
        path: log_path.to_path_buf(),
        source,
    };
    let stdout = File::create(log_path).map_err(log_error)?;
    let stderr = stdout.try_clone().map_err(log_error)?;

    info!(command = ?argv, log = %log_path.display(), "executing command");
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .map_err(|source| spawn_error(argv, source))?;
    check_status(argv, status, String::new())
}

fn check_status(argv: &[String], status: ExitStatus, detail: String) -> Result<(), ExecutorError> {
    if status.success() {
        return Ok(());
    }
    Err(ExecutorError::Failed {
        command: argv.join(" "),
        status,
        detail,
    })
}

fn spawn_error(argv: &[String], source: io::Error) -> ExecutorError {
    ExecutorError::Spawn {
        program: argv[0].clone(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    let written = serde_json::to_vec(value)
        .map_err(io::Error::other)
        .and_then(|bytes| fs::write(path, bytes));
    if let Err(err) = written {
        warn!(path = %path.display(), error = %err, "failed to write side file");
    }
}

fn dir_size(root: &Path) -> u64 {
    let mut size = 0;
    for entry in WalkDir::new(root) {
        match entry.and_then(|entry| entry.metadata()) {
            Ok(meta) if meta.is_file() => size += meta.len(),
            Ok(_) => {}
            Err(err) => {
                warn!(root = %root.display(), error = %err, "failed to compute backup size");
                return 0;
            }
        }
    }
    size
}
