pub mod config;
pub mod daemon;
pub mod error;
pub mod server;
pub mod v2;

pub use daemon::{BackupDaemon, EvictionPolicies};
pub use error::DaemonError;
pub use server::{build_router, AppState};
