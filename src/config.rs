//! Configuration types.
//!
//! Everything is read through a key lookup so the binary can layer CLI
//! flags over environment variables, and tests can feed a plain map.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::task::WorkerId;

/// Default polling interval between queue reads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 30 Tgas, the near-api-js default for function calls.
pub const DEFAULT_GAS: u64 = 30_000_000_000_000;

/// Ledger (NEAR contract) settings.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub network_id: String,
    pub node_url: String,
    pub contract_id: String,
    /// Directory holding `<network>/<account>.json` key files.
    pub credentials_dir: PathBuf,
    pub gas: u64,
    /// Attached deposit for `submit_result`, in yoctoNEAR.
    pub attached_deposit: u128,
}

/// Workspace Store settings.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    /// Keep workspaces on disk after a confirmed task for inspection.
    pub retain_after_success: bool,
    pub download_timeout: Duration,
}

/// Execution Environment settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub python: String,
    pub entry_script: String,
    pub requirements: String,
    /// Upper bound on entry-script runtime. `None` means unbounded.
    pub execution_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            entry_script: "entry_script.py".to_string(),
            requirements: "requirements.txt".to_string(),
            execution_timeout: None,
        }
    }
}

/// Artifact Publisher settings.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub results_dir: String,
    pub ipfs_api_url: String,
    pub ipfs_gateway_url: String,
    pub ipfs_project_id: Option<String>,
    pub ipfs_project_secret: Option<SecretString>,
    /// Bound on a single artifact upload.
    pub upload_timeout: Duration,
}

/// Full worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub identity: WorkerId,
    pub poll_interval: Duration,
    pub ledger: LedgerConfig,
    pub workspace: WorkspaceConfig,
    pub runtime: RuntimeConfig,
    pub publish: PublishConfig,
}

impl WorkerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let identity = get("OBRIGADO_ACCOUNT_ID")
            .map(WorkerId::new)
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "OBRIGADO_ACCOUNT_ID".to_string(),
                hint: "Pass --account-id=<account> or export OBRIGADO_ACCOUNT_ID".to_string(),
            })?;

        let poll_interval = parse::<u64>(&get, "OBRIGADO_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "OBRIGADO_POLL_INTERVAL_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let network_id = get("OBRIGADO_NETWORK").unwrap_or_else(|| "testnet".to_string());
        let node_url = get("OBRIGADO_NODE_URL")
            .unwrap_or_else(|| format!("https://rpc.{network_id}.near.org"));
        let contract_id =
            get("OBRIGADO_CONTRACT").unwrap_or_else(|| format!("obrigado.{network_id}"));
        let credentials_dir = get("OBRIGADO_CREDENTIALS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".near-credentials")
            });

        let ledger = LedgerConfig {
            network_id,
            node_url,
            contract_id,
            credentials_dir,
            gas: parse(&get, "OBRIGADO_GAS")?.unwrap_or(DEFAULT_GAS),
            attached_deposit: parse(&get, "OBRIGADO_ATTACHED_DEPOSIT")?.unwrap_or(0),
        };

        let workspace = WorkspaceConfig {
            root: get("OBRIGADO_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./workspaces")),
            retain_after_success: parse(&get, "OBRIGADO_RETAIN_WORKSPACES")?.unwrap_or(false),
            download_timeout: parse::<u64>(&get, "OBRIGADO_DOWNLOAD_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
        };

        let defaults = RuntimeConfig::default();
        let runtime = RuntimeConfig {
            python: get("OBRIGADO_PYTHON").unwrap_or(defaults.python),
            entry_script: get("OBRIGADO_ENTRY_SCRIPT").unwrap_or(defaults.entry_script),
            requirements: get("OBRIGADO_REQUIREMENTS").unwrap_or(defaults.requirements),
            execution_timeout: parse::<u64>(&get, "OBRIGADO_EXEC_TIMEOUT_SECS")?
                .map(Duration::from_secs),
        };

        let publish = PublishConfig {
            results_dir: get("OBRIGADO_RESULTS_DIR").unwrap_or_else(|| "results".to_string()),
            ipfs_api_url: get("IPFS_API_URL")
                .unwrap_or_else(|| "https://ipfs.infura.io:5001".to_string()),
            ipfs_gateway_url: get("IPFS_GATEWAY_URL")
                .unwrap_or_else(|| "https://ipfs.infura.io".to_string()),
            ipfs_project_id: get("IPFS_PROJECT_ID"),
            ipfs_project_secret: get("IPFS_PROJECT_SECRET").map(SecretString::from),
            upload_timeout: parse::<u64>(&get, "OBRIGADO_UPLOAD_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
        };

        Ok(Self {
            identity,
            poll_interval,
            ledger,
            workspace,
            runtime,
            publish,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_account_is_an_error() {
        let err = WorkerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn defaults_follow_testnet_deployment() {
        let config =
            WorkerConfig::from_lookup(lookup(&[("OBRIGADO_ACCOUNT_ID", "worker.testnet")])).unwrap();
        assert_eq!(config.identity.as_str(), "worker.testnet");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.ledger.node_url, "https://rpc.testnet.near.org");
        assert_eq!(config.ledger.contract_id, "obrigado.testnet");
        assert_eq!(config.ledger.gas, DEFAULT_GAS);
        assert_eq!(config.ledger.attached_deposit, 0);
        assert_eq!(config.runtime.entry_script, "entry_script.py");
        assert_eq!(config.runtime.requirements, "requirements.txt");
        assert!(config.runtime.execution_timeout.is_none());
        assert_eq!(config.publish.results_dir, "results");
        assert_eq!(config.publish.upload_timeout, Duration::from_secs(300));
        assert!(!config.workspace.retain_after_success);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("OBRIGADO_ACCOUNT_ID", "w.near"),
            ("OBRIGADO_NETWORK", "mainnet"),
            ("OBRIGADO_POLL_INTERVAL_MS", "250"),
            ("OBRIGADO_EXEC_TIMEOUT_SECS", "600"),
            ("OBRIGADO_ATTACHED_DEPOSIT", "1000000000000000000000000"),
            ("OBRIGADO_RETAIN_WORKSPACES", "true"),
            ("OBRIGADO_UPLOAD_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.ledger.node_url, "https://rpc.mainnet.near.org");
        assert_eq!(config.runtime.execution_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.ledger.attached_deposit, 10u128.pow(24));
        assert!(config.workspace.retain_after_success);
        assert_eq!(config.publish.upload_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_number_reports_key() {
        let err = WorkerConfig::from_lookup(lookup(&[
            ("OBRIGADO_ACCOUNT_ID", "w"),
            ("OBRIGADO_GAS", "lots"),
        ]))
        .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "OBRIGADO_GAS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[
            ("OBRIGADO_ACCOUNT_ID", "w"),
            ("OBRIGADO_POLL_INTERVAL_MS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
