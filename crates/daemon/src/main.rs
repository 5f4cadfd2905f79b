use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use backup_daemon::config::{self, Config, Settings};
use backup_daemon::{build_router, AppState, BackupDaemon};
use backup_daemon_executor::Executor;
use backup_daemon_storage::{SqliteJobStore, VaultRepository};
use backup_daemon_transfer::ObjectTransfer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = parse_args()?;
    let settings = Settings::resolve(&cfg, |key| env::var(key).ok())?;
    run_service(settings).await
}

/// Parse CLI args, returning the loaded config.
fn parse_args() -> Result<Config> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => bail!("unexpected argument {other:?}"),
        }
        i += 1;
    }

    match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)
        }
        None => Ok(Config::default()),
    }
}

async fn run_service(settings: Settings) -> Result<()> {
    let vaults = VaultRepository::new(settings.vaults.clone()).context("building vault repository")?;
    let jobs = SqliteJobStore::new(&settings.db_path)
        .with_context(|| format!("opening job database {}", settings.db_path.display()))?;
    let executor = Executor::new(
        settings.templates.clone(),
        settings.custom_vars.clone(),
        settings.databases_key.clone(),
        settings.dbmap_key.clone(),
    );
    let transfer = match &settings.s3 {
        Some(s3) => {
            info!(bucket = %s3.bucket, endpoint = %s3.url, "object storage enabled");
            Some(ObjectTransfer::s3(s3).context("configuring object storage")?)
        }
        None => None,
    };

    let daemon = BackupDaemon::new(
        vaults,
        Arc::new(jobs),
        Arc::new(executor),
        transfer,
        settings.policies.clone(),
    );
    let app = build_router(AppState { daemon });

    let addr: SocketAddr = settings
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", settings.listen))?;
    info!(%addr, root = %settings.vaults.root.display(), "starting backup daemon");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("backup daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "failed to listen for SIGTERM"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
