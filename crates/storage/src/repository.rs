use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use backup_daemon_core::vault::{
    is_granular_name, CUSTOM_VARS_FILE, EVICT_LOCK_FILE, GRANULAR_FOLDER, LOCK_FILE, METRICS_FILE,
    SHARDED_FILE,
};
use backup_daemon_core::{Vault, VaultKind};
use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::StorageError;

const VAULT_NAME_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub root: PathBuf,
    pub external_root: PathBuf,
    pub namespace: String,
    /// Prefix granular vault names with the request prefix and namespace.
    pub allow_prefix: bool,
    /// List locked vaults as well.
    pub skip_lock_check: bool,
}

/// Parameters for [`VaultRepository::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NewVault<'a> {
    pub name: &'a str,
    pub allow_eviction: bool,
    pub granular: bool,
    pub sharded: bool,
    pub external: bool,
    pub external_subpath: &'a str,
    pub prefix: &'a str,
    pub blob_prefix: &'a str,
}

/// Filesystem view of the vault tree.
#[derive(Debug, Clone)]
pub struct VaultRepository {
    root: PathBuf,
    granular_root: PathBuf,
    external_root: PathBuf,
    namespace: String,
    allow_prefix: bool,
    skip_lock_check: bool,
    dirname_matcher: Regex,
}

impl VaultRepository {
    pub fn new(settings: VaultSettings) -> Result<Self, StorageError> {
        Ok(Self {
            granular_root: settings.root.join(GRANULAR_FOLDER),
            root: settings.root,
            external_root: settings.external_root,
            namespace: settings.namespace,
            allow_prefix: settings.allow_prefix,
            skip_lock_check: settings.skip_lock_check,
            dirname_matcher: Regex::new(r"(?i)\d{8}T\d{4,6}")?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Looks up an existing vault by name. Returns the empty vault when the
    /// name is blank or, unless `skip_fs_check` is set, the folder is missing.
    pub fn resolve(
        &self,
        name: &str,
        external: bool,
        external_subpath: &str,
        blob_prefix: &str,
        skip_fs_check: bool,
    ) -> Vault {
        let name = name.trim();
        if !is_plain_name(name) {
            return Vault::default();
        }
        let present = |folder: &Path| skip_fs_check || folder.exists();

        if external {
            if external_subpath.is_empty() {
                return Vault::default();
            }
            let folder = self.external_root.join(external_subpath).join(name);
            if !present(&folder) {
                return Vault::default();
            }
            return Vault {
                external: true,
                ..self.describe(folder, false)
            };
        }

        let blob_prefix = blob_prefix.trim().trim_matches('/');
        if !blob_prefix.is_empty() {
            let folder = self.root.join(blob_prefix).join(name);
            return if present(&folder) {
                self.describe(folder, false)
            } else {
                Vault::default()
            };
        }

        let folder = self.root.join(name);
        if present(&folder) {
            return self.describe(folder, false);
        }
        let folder = self.granular_root.join(name);
        if folder.exists() {
            return self.describe(folder, true);
        }
        Vault::default()
    }

    /// Name of the oldest vault at or after `ts` (milliseconds).
    pub fn find_by_timestamp(
        &self,
        ts: &str,
        kind: VaultKind,
        subpath: &str,
    ) -> Result<String, StorageError> {
        let wanted = ts
            .trim()
            .parse::<i64>()
            .map_err(|source| StorageError::InvalidTimestamp {
                value: ts.to_string(),
                source,
            })?;
        self.list(kind, subpath)?
            .into_iter()
            .find(|vault| vault.timestamp >= wanted)
            .map(|vault| vault.name())
            .ok_or_else(|| StorageError::NoVaults(format!("in timestamp {ts}")))
    }

    /// Returns the existing vault for `target.name`, or describes a new one
    /// without creating it on disk.
    pub fn open(&self, target: &NewVault<'_>) -> Vault {
        let existing = self.resolve(
            target.name,
            target.external,
            target.external_subpath,
            target.blob_prefix,
            false,
        );
        if !existing.is_empty() {
            return existing;
        }

        let blob_prefix = target.blob_prefix.trim().trim_matches('/');
        let parent = if target.granular {
            self.granular_root.clone()
        } else if !blob_prefix.is_empty() {
            self.root.join(blob_prefix)
        } else if !target.external {
            self.root.clone()
        } else {
            self.external_root.join(target.external_subpath)
        };
        let name = if target.name.trim().is_empty() {
            self.generate_name(target.prefix, target.granular)
        } else {
            target.name.trim().to_string()
        };
        let folder = parent.join(&name);

        Vault {
            timestamp: timestamp_from_name(&name),
            metrics_path: folder.join(METRICS_FILE),
            custom_vars_path: folder.join(CUSTOM_VARS_FILE),
            evictable: target.allow_eviction,
            sharded: target.sharded,
            external: target.external,
            granular: target.granular,
            folder,
            ..Vault::default()
        }
    }

    /// Vaults of `kind` sorted oldest first. Locked vaults are left out
    /// unless lock checking is disabled.
    pub fn list(&self, kind: VaultKind, subpath: &str) -> Result<Vec<Vault>, StorageError> {
        let base = if subpath.is_empty() {
            self.root.clone()
        } else {
            self.external_root.join(subpath)
        };
        if !base.exists() {
            return Err(StorageError::MissingRoot(base));
        }

        let mut vaults = Vec::new();
        if matches!(kind, VaultKind::Granular | VaultKind::All | VaultKind::Sharded) {
            for folder in self.vault_dirs(&base.join(GRANULAR_FOLDER), true)? {
                vaults.push(self.describe(folder, true));
            }
        }
        if matches!(kind, VaultKind::Full | VaultKind::All | VaultKind::Sharded) {
            for folder in self.vault_dirs(&base, false)? {
                vaults.push(self.describe(folder, false));
            }
        }
        if !subpath.is_empty() {
            for vault in &mut vaults {
                vault.external = true;
            }
        }

        if kind == VaultKind::Sharded {
            vaults.retain(|vault| vault.sharded);
        }
        if !self.skip_lock_check {
            vaults.retain(|vault| !vault.locked);
        }
        vaults.sort_by_key(|vault| vault.timestamp);
        Ok(vaults)
    }

    /// Vault names, or their timestamps rendered as strings.
    pub fn list_names(
        &self,
        as_timestamps: bool,
        kind: VaultKind,
        subpath: &str,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .list(kind, subpath)?
            .into_iter()
            .map(|vault| {
                if as_timestamps {
                    vault.timestamp.to_string()
                } else {
                    vault.name()
                }
            })
            .collect())
    }

    /// Timestamps of vaults protected by an evict-lock marker.
    pub fn non_evictable(&self, kind: VaultKind) -> Result<HashSet<i64>, StorageError> {
        Ok(self
            .list(kind, "")?
            .into_iter()
            .filter(|vault| vault.has_marker(EVICT_LOCK_FILE))
            .map(|vault| vault.timestamp)
            .collect())
    }

    pub fn evict(&self, folder: &Path) -> Result<(), StorageError> {
        match fs::remove_dir_all(folder) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(folder = %folder.display(), "vault already gone");
                Ok(())
            }
            Err(err) => Err(StorageError::io(
                format!("failed to remove {}", folder.display()),
                err,
            )),
        }
    }

    /// Path of an archive inside a managed vault.
    pub fn archive_path(&self, backup_id: &str, file: &str) -> Result<PathBuf, StorageError> {
        if !is_plain_name(file) {
            return Err(StorageError::InvalidName(file.to_string()));
        }
        let vault = self.resolve(backup_id, false, "", "", false);
        if vault.is_empty() {
            return Err(StorageError::NoVaults(format!("with id {backup_id}")));
        }
        let path = vault.folder.join(file);
        if !path.is_file() {
            return Err(StorageError::ArchiveNotFound(path));
        }
        Ok(path)
    }

    fn vault_dirs(&self, dir: &Path, missing_ok: bool) -> Result<Vec<PathBuf>, StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if missing_ok && err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StorageError::io(
                    format!("failed to read dir {}", dir.display()),
                    err,
                ))
            }
        };

        let mut folders = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| StorageError::io(format!("failed to read dir {}", dir.display()), err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let last = name.rsplit('_').next().unwrap_or(&name);
            if entry.path().is_dir() && self.dirname_matcher.is_match(last) {
                folders.push(entry.path());
            }
        }
        Ok(folders)
    }

    fn describe(&self, folder: PathBuf, in_granular_tree: bool) -> Vault {
        let name = folder
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Vault {
            timestamp: timestamp_from_name(&name),
            metrics_path: folder.join(METRICS_FILE),
            custom_vars_path: folder.join(CUSTOM_VARS_FILE),
            evictable: true,
            sharded: folder.join(SHARDED_FILE).exists(),
            locked: folder.join(LOCK_FILE).exists(),
            granular: in_granular_tree || is_granular_name(&folder),
            folder,
            ..Vault::default()
        }
    }

    fn generate_name(&self, prefix: &str, granular: bool) -> String {
        let stamp = Utc::now().format(VAULT_NAME_FORMAT).to_string();
        if !granular || self.namespace.is_empty() || !self.allow_prefix {
            return stamp;
        }
        if prefix.is_empty() {
            format!("{}_{stamp}", self.namespace)
        } else {
            format!("{prefix}_{}_{stamp}", self.namespace)
        }
    }
}

/// A single path component: no separators, not `.` or `..`.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Milliseconds encoded in the last `_` segment of a vault name. Names
/// without a parseable stamp count as created now.
pub fn timestamp_from_name(name: &str) -> i64 {
    let last = name.rsplit('_').next().unwrap_or(name);
    let stamp = last.rsplit_once('.').map_or(last, |(stem, _)| stem);
    NaiveDateTime::parse_from_str(stamp, VAULT_NAME_FORMAT)
        .map(|parsed| parsed.and_utc().timestamp_millis())
        .unwrap_or_else(|_| Utc::now().timestamp_millis())
}

/// Last `lines` lines of a log file.
pub fn tail_lines(path: &Path, lines: usize) -> Result<String, StorageError> {
    let content = fs::read_to_string(path)
        .map_err(|err| StorageError::io(format!("failed to read {}", path.display()), err))?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}
