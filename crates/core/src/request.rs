use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::job::ProcType;

/// A requested database: either a bare name or a name with a selection of
/// collections and tables, written on the wire as `{"name": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDbEntry", into = "RawDbEntry")]
pub enum DbEntry {
    Name(String),
    Detailed { name: String, object: DbObject },
}

impl DbEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Detailed { name, .. } => name,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawDbEntry {
    Name(String),
    Object(BTreeMap<String, DbObject>),
}

impl TryFrom<RawDbEntry> for DbEntry {
    type Error = String;

    fn try_from(raw: RawDbEntry) -> Result<Self, Self::Error> {
        match raw {
            RawDbEntry::Name(name) => Ok(Self::Name(name)),
            RawDbEntry::Object(map) => {
                let mut entries = map.into_iter();
                match (entries.next(), entries.next()) {
                    (Some((name, object)), None) => Ok(Self::Detailed { name, object }),
                    _ => Err("database entry must name exactly one database".to_string()),
                }
            }
        }
    }
}

impl From<DbEntry> for RawDbEntry {
    fn from(entry: DbEntry) -> Self {
        match entry {
            DbEntry::Name(name) => RawDbEntry::Name(name),
            DbEntry::Detailed { name, object } => {
                RawDbEntry::Object(BTreeMap::from([(name, object)]))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbObject {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<CollectionItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCollectionItem", into = "RawCollectionItem")]
pub enum CollectionItem {
    Name(String),
    Detailed {
        name: String,
        details: Map<String, Value>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawCollectionItem {
    Name(String),
    Object(BTreeMap<String, Map<String, Value>>),
}

impl TryFrom<RawCollectionItem> for CollectionItem {
    type Error = String;

    fn try_from(raw: RawCollectionItem) -> Result<Self, Self::Error> {
        match raw {
            RawCollectionItem::Name(name) => Ok(Self::Name(name)),
            RawCollectionItem::Object(map) => {
                let mut entries = map.into_iter();
                match (entries.next(), entries.next()) {
                    (Some((name, details)), None) => Ok(Self::Detailed { name, details }),
                    _ => Err("collection entry must name exactly one collection".to_string()),
                }
            }
        }
    }
}

impl From<CollectionItem> for RawCollectionItem {
    fn from(item: CollectionItem) -> Self {
        match item {
            CollectionItem::Name(name) => RawCollectionItem::Name(name),
            CollectionItem::Detailed { name, details } => {
                RawCollectionItem::Object(BTreeMap::from([(name, details)]))
            }
        }
    }
}

/// Accepts `true`, `"true"` and friends.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Text(String),
    }

    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(value) => Ok(value),
        BoolOrString::Text(text) => text
            .trim()
            .parse::<bool>()
            .map_err(|_| serde::de::Error::custom(format!("invalid boolean {text:?}"))),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub dbs: Vec<DbEntry>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub allow_eviction: bool,
    #[serde(default, rename = "externalBackupPath")]
    pub external_backup_path: String,
    #[serde(default)]
    pub sharded: bool,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub custom_vars: HashMap<String, String>,
    #[serde(skip)]
    pub proc_type: ProcType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResponse {
    pub backup_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default, rename = "externalBackupPath")]
    pub external_backup_path: String,
    #[serde(default)]
    pub vault: String,
    #[serde(default, rename = "ts")]
    pub timestamp: String,
    #[serde(default)]
    pub dbs: Vec<DbEntry>,
    #[serde(default, rename = "changeDbNames")]
    pub change_db_names: HashMap<String, String>,
    #[serde(default)]
    pub custom_vars: HashMap<String, String>,
    #[serde(skip)]
    pub proc_type: ProcType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub status: String,
    pub vault: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub err: String,
    pub task_id: String,
    #[serde(rename = "storageName")]
    pub storage_name: String,
    #[serde(rename = "blobPath")]
    pub blob_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,
    /// HTTP code the status maps to; 404 when the task is unknown.
    #[serde(skip)]
    pub status_code: u16,
}

impl JobStatusResponse {
    pub fn not_found(task_id: &str) -> Self {
        Self {
            status: String::new(),
            vault: String::new(),
            job_type: String::new(),
            err: String::new(),
            task_id: task_id.to_string(),
            storage_name: String::new(),
            blob_path: String::new(),
            databases: Vec::new(),
            status_code: 404,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignResponse {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseV2Status {
    pub database_name: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupV2Request {
    #[serde(default)]
    pub storage_name: String,
    #[serde(default)]
    pub blob_path: String,
    #[serde(default)]
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupV2Response {
    pub status: String,
    pub backup_id: String,
    pub creation_time: String,
    pub storage_name: String,
    pub blob_path: String,
    pub databases: Vec<DatabaseV2Status>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDbMap {
    pub previous_database_name: String,
    pub database_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreV2Request {
    #[serde(default)]
    pub storage_name: String,
    #[serde(default)]
    pub blob_path: String,
    #[serde(default)]
    pub databases: Vec<RestoreDbMap>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreV2Response {
    pub status: String,
    pub restore_id: String,
    pub creation_time: String,
    pub storage_name: String,
    pub blob_path: String,
    pub databases: Vec<DatabaseV2Status>,
}
