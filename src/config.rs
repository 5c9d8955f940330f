//! Configuration management for the resolver
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::finality::recommended_confirmations;

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub resolver: ResolverConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub instance_id: String,
    /// Interval of the "next action due" scan
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Swaps older than this that are not terminal are swept to EXPIRED
    #[serde(default = "default_swap_timeout_secs")]
    pub swap_timeout_secs: u64,
    #[serde(default = "default_expiry_check_interval_secs")]
    pub expiry_check_interval_secs: u64,
    /// Completed swaps are deleted this many days after completion
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Capacity of the merged watcher event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
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
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub ws_url: Option<String>,
    /// Escrow factory emitting escrow-creation and post-interaction events
    pub factory_address: String,
    /// Limit order protocol emitting order fills
    pub limit_order_protocol_address: String,
    /// Blocks re-scanned on every (re)start
    #[serde(default = "default_catch_up_blocks")]
    pub catch_up_blocks: u64,
    /// Poll interval when no websocket endpoint is configured
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub confirmation_blocks: Option<u64>,
    pub enabled: bool,
}

impl ChainConfig {
    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }

    /// Websocket endpoint, treating an unset substitution as absent
    pub fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref().filter(|url| !url.is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn factory(&self) -> Result<Address> {
        self.factory_address
            .parse()
            .with_context(|| format!("Invalid factory address for chain {}", self.name))
    }

    pub fn limit_order_protocol(&self) -> Result<Address> {
        self.limit_order_protocol_address
            .parse()
            .with_context(|| {
                format!("Invalid limit order protocol address for chain {}", self.name)
            })
    }
}

fn default_scan_interval_ms() -> u64 {
    3_000
}

fn default_swap_timeout_secs() -> u64 {
    3_600
}

fn default_expiry_check_interval_secs() -> u64 {
    60
}

fn default_retention_days() -> u64 {
    7
}

fn default_cleanup_interval_secs() -> u64 {
    3_600
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    10_000
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_catch_up_blocks() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Settings {
    /// Load settings from the file named by `RESOLVER_CONFIG`, or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RESOLVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            chain.factory()?;
            chain.limit_order_protocol()?;
        }

        if self.store.backend == StoreBackend::Postgres && self.store.url.is_none() {
            anyhow::bail!("store.url is required for the postgres backend");
        }

        if self.resolver.scan_interval_ms == 0 {
            anyhow::bail!("resolver.scan_interval_ms must be positive");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[resolver]
instance_id = "resolver-test"
scan_interval_ms = 500

[store]
backend = "memory"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chains.sepolia]
chain_id = 11155111
name = "sepolia"
rpc_urls = ["${BMN_TEST_RPC}"]
factory_address = "0x1111111111111111111111111111111111111111"
limit_order_protocol_address = "0x2222222222222222222222222222222222222222"
enabled = true

[chains.disabled]
chain_id = 10
name = "optimism"
rpc_urls = []
factory_address = ""
limit_order_protocol_address = ""
enabled = false
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("BMN_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${BMN_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        env::set_var("BMN_TEST_RPC", "https://rpc.sepolia.example");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.enabled_chains().len(), 1);
        assert_eq!(settings.resolver.scan_interval_ms, 500);
        assert_eq!(settings.resolver.swap_timeout_secs, 3_600);
        assert_eq!(settings.store.backend, StoreBackend::Memory);

        let chain = settings.get_chain_by_id(11155111).unwrap();
        assert_eq!(chain.rpc_urls, vec!["https://rpc.sepolia.example".to_string()]);
        assert_eq!(chain.catch_up_blocks, 100);
        assert_eq!(chain.confirmation_blocks(), 12);
    }

    #[test]
    fn test_postgres_requires_url() {
        env::set_var("BMN_TEST_RPC", "https://rpc.sepolia.example");
        let config = SAMPLE.replace("backend = \"memory\"", "backend = \"postgres\"");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.as_bytes()).unwrap();

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("store.url"));
    }
}
