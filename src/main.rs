use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use obrigado_worker::config::WorkerConfig;
use obrigado_worker::publish::{ArtifactPublisher, IpfsStore};
use obrigado_worker::queue::{NearQueueClient, QueueClient, Signer};
use obrigado_worker::runtime::{ExecutionEnvironment, TokioCommandRunner};
use obrigado_worker::scheduler::Scheduler;
use obrigado_worker::workspace::WorkspaceStore;

/// Command-line overrides. Anything not given here falls back to the
/// environment and then to built-in defaults.
#[derive(Parser)]
#[command(
    name = "obrigado-worker",
    version,
    about = "Runs Obrigado queue tasks and submits their results"
)]
struct Cli {
    /// NEAR account the worker signs confirmations with.
    #[arg(long, env = "OBRIGADO_ACCOUNT_ID")]
    account_id: Option<String>,

    #[arg(long, env = "OBRIGADO_NETWORK")]
    network: Option<String>,

    #[arg(long, env = "OBRIGADO_NODE_URL")]
    node_url: Option<String>,

    /// Task queue contract account.
    #[arg(long, env = "OBRIGADO_CONTRACT")]
    contract: Option<String>,

    #[arg(long, env = "OBRIGADO_CREDENTIALS_DIR")]
    credentials_dir: Option<String>,

    #[arg(long, env = "OBRIGADO_WORKSPACE_ROOT")]
    workspace_root: Option<String>,

    #[arg(long, env = "OBRIGADO_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<String>,

    /// Kill entry scripts running longer than this.
    #[arg(long, env = "OBRIGADO_EXEC_TIMEOUT_SECS")]
    exec_timeout_secs: Option<String>,

    /// Keep workspaces after a task is confirmed.
    #[arg(long)]
    retain_workspaces: bool,
}

impl Cli {
    fn overrides(self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        let pairs = [
            ("OBRIGADO_ACCOUNT_ID", self.account_id),
            ("OBRIGADO_NETWORK", self.network),
            ("OBRIGADO_NODE_URL", self.node_url),
            ("OBRIGADO_CONTRACT", self.contract),
            ("OBRIGADO_CREDENTIALS_DIR", self.credentials_dir),
            ("OBRIGADO_WORKSPACE_ROOT", self.workspace_root),
            ("OBRIGADO_POLL_INTERVAL_MS", self.poll_interval_ms),
            ("OBRIGADO_EXEC_TIMEOUT_SECS", self.exec_timeout_secs),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                map.insert(key, value);
            }
        }
        if self.retain_workspaces {
            map.insert("OBRIGADO_RETAIN_WORKSPACES", "true".to_string());
        }
        map
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let overrides = Cli::parse().overrides();
    let config = WorkerConfig::from_lookup(|key| {
        overrides
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    })?;

    eprintln!("Obrigado worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Account:   {}", config.identity);
    eprintln!("   Contract:  {} ({})", config.ledger.contract_id, config.ledger.network_id);
    eprintln!("   Node:      {}", config.ledger.node_url);
    eprintln!("   Workspace: {}", config.workspace.root.display());
    eprintln!("   Interval:  {:?}\n", config.poll_interval);

    let signer = Signer::from_credentials(
        &config.ledger.credentials_dir,
        &config.ledger.network_id,
        config.identity.as_str(),
    )?;
    info!(account = signer.account_id(), public_key = %signer.public_key(), "Loaded signing key");

    let queue: Arc<dyn QueueClient> = Arc::new(NearQueueClient::new(&config.ledger, Some(signer)));

    // The only fatal runtime check: the ledger must answer once before we start.
    let snapshot = queue
        .list_pending()
        .await
        .with_context(|| format!("ledger {} is not reachable", config.ledger.node_url))?;
    info!(tasks = snapshot.len(), "Ledger reachable");

    if config.runtime.execution_timeout.is_none() {
        warn!("No execution timeout configured; a hung entry script blocks this worker");
    }

    let workspaces = WorkspaceStore::new(&config.workspace)?;
    let runtime = ExecutionEnvironment::new(Arc::new(TokioCommandRunner::new()), config.runtime.clone());
    let publisher = ArtifactPublisher::new(
        Arc::new(IpfsStore::new(&config.publish)?),
        config.publish.results_dir.clone(),
    );

    let scheduler = Scheduler::new(config.identity.clone(), queue, workspaces, runtime, publisher)
        .with_poll_interval(config.poll_interval)
        .retain_workspaces(config.workspace.retain_after_success);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            ctrl_c.cancel();
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}
