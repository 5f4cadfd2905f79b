pub mod job;
pub mod request;
pub mod retention;
pub mod rule;
pub mod vault;

pub use job::{encode_database_names, Job, JobStatus, JobType, ProcType};
pub use request::{
    BackupRequest, BackupResponse, CollectionItem, DbEntry, DbObject, JobStatusResponse,
    PresignResponse, RestoreRequest, RestoreResponse,
};
pub use retention::obsolete_vaults;
pub use rule::{parse_rules, Rule, RuleAction, RuleError, RuleKind};
pub use vault::{Vault, VaultKind};
