//! The `reins-daemon` binary: per-user agent daemon entrypoint.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use reins_daemon::{
    DaemonRuntime, DaemonRuntimeOptions, ManagedIntegrationService, TracingEventSink,
    DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
};
use reins_service::{
    IntegrationService, IntegrationServiceConfig, CREDENTIAL_ENCRYPTION_KEY_ENV,
};
use reins_store::{FileCredentialStore, FileCredentialStoreOptions};
use reins_tools::ToolRegistry;

const CREDENTIAL_STORE_FILE: &str = "credentials.json";

#[derive(Debug, Parser)]
#[command(
    name = "reins-daemon",
    about = "Per-user agent daemon managing external service integrations"
)]
struct Cli {
    /// Data root holding the credential store and runtime state.
    #[arg(long, env = "REINS_DATA_DIR", default_value = ".reins")]
    data_dir: PathBuf,

    /// Optional passphrase for the credential store's own envelope.
    #[arg(long, env = "REINS_STORE_PASSPHRASE")]
    store_passphrase: Option<String>,

    /// Tracing filter, e.g. `info` or `reins_service=debug`.
    #[arg(long, env = "REINS_LOG_FILTER", default_value = "info")]
    log_filter: String,

    /// Per-service shutdown ceiling in seconds.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECONDS)]
    shutdown_timeout_seconds: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("reins-daemon: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let filter = EnvFilter::try_new(&cli.log_filter)
        .with_context(|| format!("invalid log filter '{}'", cli.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let tool_registry = ToolRegistry::shared();
    let mut config = IntegrationServiceConfig::new(tool_registry);
    if std::env::var(CREDENTIAL_ENCRYPTION_KEY_ENV).is_ok() {
        let store_path = cli.data_dir.join(CREDENTIAL_STORE_FILE);
        tracing::info!(store = %store_path.display(), "using encrypted credential store");
        config.credential_store = Some(Arc::new(FileCredentialStore::new(
            store_path,
            FileCredentialStoreOptions {
                passphrase: cli.store_passphrase.clone(),
            },
        )));
    } else {
        tracing::warn!(
            "{CREDENTIAL_ENCRYPTION_KEY_ENV} is not set; credentials will not survive restarts"
        );
    }
    let service = IntegrationService::new(config).context("failed to build integration service")?;

    let runtime = DaemonRuntime::new(
        DaemonRuntimeOptions {
            shutdown_timeout: std::time::Duration::from_secs(cli.shutdown_timeout_seconds),
        },
        Arc::new(TracingEventSink),
    );
    runtime.register_service(ManagedIntegrationService::new(service))?;

    runtime.start().await.context("daemon failed to start")?;
    let signal = runtime.run_until_signal().await?;
    tracing::info!(signal = %signal, "daemon shut down cleanly");
    Ok(())
}
