//! Configuration management for the wallet relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{EngineError, EngineResult};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default HD path prefix; account `i` lives at `<prefix>/i`
pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/60'/0'/0";

lazy_static! {
    static ref ENV_VAR: regex::Regex = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub executor: ExecutorConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    /// Key into `networks` selecting the network signers are derived for
    pub active_network: String,
    pub networks: HashMap<String, NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Name of the contract handle `execute` calls go to
    pub contract: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_true")]
    pub abort_unless_unconfirmed_rpc_error: bool,
    /// Blocks to wait for inside each attempt; 0 returns right after broadcast
    #[serde(default)]
    pub confirmations: usize,
}

/// Backoff policy for resubmission
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub url: String,
    pub key: Option<String>,
    pub mnemonic: Option<String>,
    #[serde(default = "default_num_accounts")]
    pub num_accounts: u32,
    pub gas_limit: Option<u64>,
    pub chain_id: Option<u64>,
    pub derivation_path: Option<String>,
    #[serde(default)]
    pub contracts: HashMap<String, ContractConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub address: String,
    pub abi_path: PathBuf,
}

/// Where the pool's signing identities come from
#[derive(Debug, Clone, PartialEq)]
pub enum SignerSource<'a> {
    Mnemonic {
        phrase: &'a str,
        path_prefix: &'a str,
        count: u32,
    },
    Key(&'a str),
}

impl NetworkConfig {
    /// Validate and pick the signer source
    pub fn signer_source(&self) -> EngineResult<SignerSource<'_>> {
        if self.url.trim().is_empty() {
            return Err(EngineError::Config("network url is empty".to_string()));
        }

        match (self.mnemonic.as_deref(), self.key.as_deref()) {
            (Some(_), Some(_)) => Err(EngineError::Config(
                "network config sets both mnemonic and key".to_string(),
            )),
            (None, None) => Err(EngineError::Config(
                "network config needs a mnemonic or a key".to_string(),
            )),
            (Some(phrase), None) => {
                if self.num_accounts == 0 {
                    return Err(EngineError::Config(
                        "num_accounts must be at least 1".to_string(),
                    ));
                }
                Ok(SignerSource::Mnemonic {
                    phrase,
                    path_prefix: self
                        .derivation_path
                        .as_deref()
                        .unwrap_or(DEFAULT_DERIVATION_PATH),
                    count: self.num_accounts,
                })
            }
            (None, Some(key)) => Ok(SignerSource::Key(key)),
        }
    }
}

impl Settings {
    /// Load settings from the file named by `RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` first
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let network = self.active_network()?;
        network.signer_source()?;

        if !network.contracts.contains_key(&self.executor.contract) {
            anyhow::bail!(
                "Executor contract {} is not configured for network {}",
                self.executor.contract,
                self.active_network
            );
        }

        if self.executor.retry.max_attempts == 0 {
            anyhow::bail!("executor.retry.max_attempts must be at least 1");
        }

        Ok(())
    }

    /// Get the configuration of the active network
    pub fn active_network(&self) -> EngineResult<&NetworkConfig> {
        self.networks.get(&self.active_network).ok_or_else(|| {
            EngineError::Config(format!(
                "active network {} is not configured",
                self.active_network
            ))
        })
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_num_accounts() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
active_network = "testnet"

[executor]
contract = "wallet"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[networks.testnet]
url = "https://rpc.testnet.example"
mnemonic = "${RELAYER_TEST_MNEMONIC}"
num_accounts = 3

[networks.testnet.contracts.wallet]
address = "0x0000000000000000000000000000000000000001"
abi_path = "abi/wallet.json"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("RELAYER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${RELAYER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        env::set_var("RELAYER_TEST_MNEMONIC", "test test test");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.executor.retry, RetryConfig::default());
        assert!(settings.executor.abort_unless_unconfirmed_rpc_error);
        assert_eq!(settings.executor.confirmations, 0);

        let network = settings.active_network().unwrap();
        assert_eq!(
            network.signer_source().unwrap(),
            SignerSource::Mnemonic {
                phrase: "test test test",
                path_prefix: DEFAULT_DERIVATION_PATH,
                count: 3,
            }
        );
    }

    #[test]
    fn test_rejects_unknown_active_network() {
        let input = SAMPLE.replace("active_network = \"testnet\"", "active_network = \"mainnet\"");
        assert!(Settings::from_toml_str(&input).is_err());
    }

    #[test]
    fn test_rejects_missing_executor_contract() {
        let input = SAMPLE.replace("contract = \"wallet\"", "contract = \"vault\"");
        assert!(Settings::from_toml_str(&input).is_err());
    }

    #[test]
    fn test_signer_source_requires_exactly_one_secret() {
        let mut network = NetworkConfig {
            url: "http://localhost:8545".to_string(),
            key: None,
            mnemonic: None,
            num_accounts: 1,
            gas_limit: None,
            chain_id: None,
            derivation_path: None,
            contracts: HashMap::new(),
        };
        assert!(matches!(network.signer_source(), Err(EngineError::Config(_))));

        network.key = Some("0xabc".to_string());
        assert_eq!(network.signer_source().unwrap(), SignerSource::Key("0xabc"));

        network.mnemonic = Some("words".to_string());
        assert!(matches!(network.signer_source(), Err(EngineError::Config(_))));

        network.key = None;
        network.num_accounts = 0;
        assert!(matches!(network.signer_source(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_ms: 3_000,
        };
        let delays: Vec<u64> = (1..=5).map(|a| retry.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000]);
        assert_eq!(retry.delay_for(200), Duration::from_millis(3_000));
    }
}
