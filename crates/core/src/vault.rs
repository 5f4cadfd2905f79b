use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Marker file whose presence means a vault is still being written.
pub const LOCK_FILE: &str = ".lock";
/// Marker file that protects a vault from policy eviction.
pub const EVICT_LOCK_FILE: &str = ".evictlock";
/// Marker file present in sharded backups.
pub const SHARDED_FILE: &str = ".sharded";
pub const METRICS_FILE: &str = ".metrics";
pub const CUSTOM_VARS_FILE: &str = ".custom_vars";
pub const CONSOLE_FILE: &str = ".console";
/// Subtree holding per-database backups.
pub const GRANULAR_FOLDER: &str = "granular";
pub const RESTORE_LOGS_FOLDER: &str = "restore_logs";

/// Which part of the vault tree an operation looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultKind {
    Full,
    Granular,
    All,
    Sharded,
}

/// One backup artifact on disk.
///
/// The default value is the "no such vault" result: it has an empty folder
/// and every flag unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub folder: PathBuf,
    /// Milliseconds since the epoch, derived from the folder name.
    pub timestamp: i64,
    pub metrics_path: PathBuf,
    pub custom_vars_path: PathBuf,
    pub evictable: bool,
    pub sharded: bool,
    pub external: bool,
    pub failed: bool,
    pub locked: bool,
    pub canceled: bool,
    pub granular: bool,
}

impl Vault {
    pub fn is_empty(&self) -> bool {
        self.folder.as_os_str().is_empty()
    }

    /// Base name of the vault folder, which doubles as the backup id.
    pub fn name(&self) -> String {
        self.folder
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn console_path(&self) -> PathBuf {
        self.folder.join(CONSOLE_FILE)
    }

    pub fn has_marker(&self, marker: &str) -> bool {
        !self.is_empty() && self.folder.join(marker).exists()
    }
}

/// True when a folder name carries the granular marker.
pub fn is_granular_name(folder: &Path) -> bool {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().contains(GRANULAR_FOLDER))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_vault_is_empty() {
        let vault = Vault::default();
        assert!(vault.is_empty());
        assert_eq!(vault.name(), "");
        assert!(!vault.has_marker(LOCK_FILE));
    }

    #[test]
    fn name_is_folder_basename() {
        let vault = Vault {
            folder: PathBuf::from("/backup-storage/granular/app_default_20240105T101500"),
            ..Vault::default()
        };
        assert_eq!(vault.name(), "app_default_20240105T101500");
        assert!(!is_granular_name(&vault.folder));
        assert!(is_granular_name(Path::new("/x/granular_20240105T101500")));
    }
}
