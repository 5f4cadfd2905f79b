use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backup_daemon_executor::CommandTemplates;
use backup_daemon_storage::VaultSettings;
use backup_daemon_transfer::S3Settings;
use serde::Deserialize;

use crate::daemon::EvictionPolicies;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_STORAGE: &str = "/backup-storage";
const DEFAULT_EXTERNAL: &str = "/external";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_COMMAND: &str = "ls -la {{.data_folder}}";
const DEFAULT_CUSTOM_VARS: [&str; 4] = ["skip_users_recovery", "clean", "storageName", "blob_path"];
const DEFAULT_POLICY: &str = "0/1h,4h/1d";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub s3: S3Config,
    pub commands: CommandsConfig,
    pub eviction: EvictionConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub root: Option<String>,
    pub external_root: Option<String>,
    pub namespace: Option<String>,
    pub allow_prefix: Option<bool>,
    pub skip_lock_check: Option<bool>,
    pub db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct S3Config {
    pub enabled: Option<bool>,
    pub url: Option<String>,
    pub key_id: Option<String>,
    pub key_secret: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub ssl_verify: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CommandsConfig {
    pub backup: Option<String>,
    pub restore: Option<String>,
    pub evict: Option<String>,
    pub list: Option<String>,
    pub databases_key: Option<String>,
    pub dbmap_key: Option<String>,
    pub custom_vars: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct EvictionConfig {
    pub policy: Option<String>,
    pub granular_policy: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

/// Everything the process needs, after environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: String,
    pub vaults: VaultSettings,
    pub db_path: PathBuf,
    /// Present only when object storage is enabled.
    pub s3: Option<S3Settings>,
    pub templates: CommandTemplates,
    pub custom_vars: Vec<String>,
    pub databases_key: String,
    pub dbmap_key: String,
    pub policies: EvictionPolicies,
}

impl Settings {
    /// Applies `lookup` (normally the process environment) over `cfg`.
    pub fn resolve(cfg: &Config, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |key: &str, file: &Option<String>, default: &str| -> String {
            lookup(key)
                .or_else(|| file.clone())
                .unwrap_or_else(|| default.to_owned())
        };
        let flag = |key: &str, file: Option<bool>, default: bool| -> Result<bool> {
            match lookup(key) {
                Some(raw) => parse_flag(&raw).with_context(|| format!("invalid value for {key}")),
                None => Ok(file.unwrap_or(default)),
            }
        };

        let root = text("STORAGE", &cfg.storage.root, DEFAULT_STORAGE);
        let default_db = Path::new(&root).join("database.db");
        let db_path = lookup("DB_PATH")
            .or_else(|| cfg.storage.db_path.clone())
            .map(PathBuf::from)
            .unwrap_or(default_db);

        let s3 = if flag("S3_ENABLED", cfg.s3.enabled, false)? {
            Some(S3Settings {
                url: text("S3_URL", &cfg.s3.url, ""),
                access_key_id: text("S3_KEY_ID", &cfg.s3.key_id, ""),
                access_key_secret: text("S3_KEY_SECRET", &cfg.s3.key_secret, ""),
                bucket: text("S3_BUCKET", &cfg.s3.bucket, ""),
                region: text("S3_REGION", &cfg.s3.region, DEFAULT_REGION),
                ssl_verify: flag("S3_SSL_VERIFY", cfg.s3.ssl_verify, true)?,
            })
        } else {
            None
        };

        let custom_vars = match lookup("CUSTOM_VARS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect(),
            None => cfg
                .commands
                .custom_vars
                .clone()
                .unwrap_or_else(|| DEFAULT_CUSTOM_VARS.iter().map(|name| name.to_string()).collect()),
        };

        Ok(Self {
            listen: text("BACKUP_DAEMON_LISTEN", &cfg.server.listen, DEFAULT_LISTEN),
            vaults: VaultSettings {
                root: PathBuf::from(&root),
                external_root: PathBuf::from(text(
                    "STORAGE_EXTERNAL",
                    &cfg.storage.external_root,
                    DEFAULT_EXTERNAL,
                )),
                namespace: text("NAMESPACE", &cfg.storage.namespace, DEFAULT_NAMESPACE),
                allow_prefix: flag("ALLOW_PREFIX", cfg.storage.allow_prefix, false)?,
                skip_lock_check: flag("SKIP_LOCK_CHECK", cfg.storage.skip_lock_check, false)?,
            },
            db_path,
            s3,
            templates: CommandTemplates {
                backup: text("BACKUP_COMMAND", &cfg.commands.backup, DEFAULT_COMMAND),
                restore: text("RESTORE_COMMAND", &cfg.commands.restore, DEFAULT_COMMAND),
                evict: text("EVICT_CMD", &cfg.commands.evict, DEFAULT_COMMAND),
                db_list: text("LIST_COMMAND", &cfg.commands.list, DEFAULT_COMMAND),
            },
            custom_vars,
            databases_key: text("DATABASES_KEY", &cfg.commands.databases_key, "--dbs"),
            dbmap_key: text("DBMAP_KEY", &cfg.commands.dbmap_key, "--dbmap"),
            policies: EvictionPolicies {
                full: text("EVICTION_POLICY", &cfg.eviction.policy, DEFAULT_POLICY),
                granular: text(
                    "GRANULAR_EVICTION_POLICY",
                    &cfg.eviction.granular_policy,
                    DEFAULT_POLICY,
                ),
            },
        })
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let settings = Settings::resolve(&Config::default(), env(&[])).unwrap();
        assert_eq!(settings.listen, "0.0.0.0:8080");
        assert_eq!(settings.vaults.root, PathBuf::from("/backup-storage"));
        assert_eq!(settings.db_path, PathBuf::from("/backup-storage/database.db"));
        assert_eq!(settings.vaults.namespace, "default");
        assert!(settings.s3.is_none());
        assert_eq!(settings.templates.backup, "ls -la {{.data_folder}}");
        assert_eq!(settings.custom_vars.len(), 4);
        assert_eq!(settings.databases_key, "--dbs");
        assert_eq!(settings.policies.full, "0/1h,4h/1d");
    }

    #[test]
    fn env_overrides_file() {
        let cfg: Config = toml::from_str(
            r#"
            [storage]
            root = "/data"
            namespace = "file-ns"

            [s3]
            enabled = true
            bucket = "from-file"

            [commands]
            custom_vars = ["clean"]

            [eviction]
            policy = "5"
            "#,
        )
        .unwrap();
        let settings = Settings::resolve(
            &cfg,
            env(&[
                ("NAMESPACE", "env-ns"),
                ("S3_BUCKET", "from-env"),
                ("S3_SSL_VERIFY", "false"),
                ("CUSTOM_VARS", "a, b,,c"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.vaults.root, PathBuf::from("/data"));
        assert_eq!(settings.db_path, PathBuf::from("/data/database.db"));
        assert_eq!(settings.vaults.namespace, "env-ns");
        let s3 = settings.s3.unwrap();
        assert_eq!(s3.bucket, "from-env");
        assert_eq!(s3.region, "us-east-1");
        assert!(!s3.ssl_verify);
        assert_eq!(settings.custom_vars, vec!["a", "b", "c"]);
        assert_eq!(settings.policies.full, "5");
        assert_eq!(settings.policies.granular, "0/1h,4h/1d");
    }

    #[test]
    fn bad_flags_are_rejected() {
        let err = Settings::resolve(&Config::default(), env(&[("S3_ENABLED", "maybe")])).unwrap_err();
        assert!(format!("{err:#}").contains("S3_ENABLED"));
    }

    #[test]
    fn loads_file_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.toml");
        std::fs::write(&path, "[server]\nlisten = \"127.0.0.1:9000\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.listen.as_deref(), Some("127.0.0.1:9000"));
        assert!(load_config(&tmp.path().join("missing.toml")).is_err());
    }
}
