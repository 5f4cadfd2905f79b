mod error;
mod repository;
pub mod sqlite_store;
pub mod store;

pub use error::StorageError;
pub use repository::{is_plain_name, tail_lines, timestamp_from_name, NewVault, VaultRepository, VaultSettings};
pub use sqlite_store::SqliteJobStore;
pub use store::JobStore;
