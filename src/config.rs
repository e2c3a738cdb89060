//! Configuration file management. One TOML file, four sections, defaults
//! for everything that has a sane one.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bitcoin::Amount;
use serde::Deserialize;

use crate::{driver::AutomationConfig, engine::EngineConfig, error::ConfigError};

/// The whole configuration surface of the disburser.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolSection,
    pub chain: ChainSection,
    #[serde(default)]
    pub automation: AutomationSection,
    #[serde(default)]
    pub journal: JournalSection,
}

/// `[pool]` — where the obligations come from.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    /// Base URL of the pool's admin API.
    pub api_base_url: String,
    /// The pool whose queue this disburser drains.
    pub pool_id: String,
    /// Bearer token for the admin API.
    pub api_key: String,
    #[serde(default = "default_timeout_s")]
    pub request_timeout_s: u64,
}

impl PoolSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }
}

/// `[chain]` — the node, the wallet, and the transaction policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSection {
    /// URL of the node's JSON-RPC server.
    pub rpc_url: String,
    #[serde(default)]
    pub rpc_user: String,
    #[serde(default)]
    pub rpc_password: String,
    #[serde(default = "default_timeout_s")]
    pub rpc_timeout_s: u64,
    /// The wallet payouts are drawn from; must be loaded on the node.
    pub wallet_name: String,
    /// Fixed change address. A fresh wallet address is generated per batch
    /// when unset.
    #[serde(default)]
    pub change_address: Option<String>,
    /// Fee rate in whole coins per byte.
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub fee_per_byte: Amount,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    /// `signrawtransactionwithwallet` when true, the legacy
    /// `signrawtransaction` when false.
    #[serde(default = "default_true")]
    pub use_wallet_signing: bool,
    /// Change at or below this value is surrendered to fee.
    #[serde(
        default = "default_dust_threshold",
        with = "bitcoin::amount::serde::as_btc"
    )]
    pub dust_threshold: Amount,
}

impl ChainSection {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_s)
    }
}

/// `[automation]` — the block-triggered payout loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationSection {
    pub enabled: bool,
    pub batch_size: usize,
    pub block_period: u64,
    pub poll_interval_s: u64,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub min_balance: Amount,
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 50,
            block_period: 10,
            poll_interval_s: 60,
            min_balance: Amount::ZERO,
        }
    }
}

/// `[journal]` — where the durable state lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalSection {
    pub path: PathBuf,
    pub failed_log_path: PathBuf,
}

impl Default for JournalSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("journal.jsonl"),
            failed_log_path: PathBuf::from("failed-payments.log"),
        }
    }
}

impl Config {
    /// Loads and parses the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// The engine's view of this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool_id: self.pool.pool_id.clone(),
            fee_per_byte: self.chain.fee_per_byte,
            dust_threshold: self.chain.dust_threshold,
            min_confirmations: self.chain.min_confirmations,
            change_address: self.chain.change_address.clone(),
            failed_log_path: self.journal.failed_log_path.clone(),
        }
    }

    /// The automated driver's view of this configuration.
    pub fn automation_config(&self) -> AutomationConfig {
        AutomationConfig {
            batch_size: self.automation.batch_size,
            block_period: self.automation.block_period,
            poll_interval: Duration::from_secs(self.automation.poll_interval_s),
            min_balance: self.automation.min_balance,
        }
    }
}

fn default_timeout_s() -> u64 {
    30
}

fn default_min_confirmations() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_dust_threshold() -> Amount {
    Amount::from_sat(100_000)
}
