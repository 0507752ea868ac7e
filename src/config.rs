//! Configuration for the agentgate gateway binary.
//!
//! Values come from a JSON config file (`--config <path>` or `./agentgate.json`),
//! with env-var fallbacks for anything the file omits and hardcoded defaults
//! below those. Secrets (the signing key, custody credentials) are env-only
//! and never read from the file.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::pricing::{PriceEntry, PricingTable, endpoint_key};
use crate::types::{EvmAddress, TokenDescriptor};

/// CLI arguments for the agentgate gateway.
#[derive(Parser, Debug)]
#[command(name = "agentgate")]
#[command(about = "HTTP 402 payment gateway")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long = "config", short = 'c')]
    config: Option<PathBuf>,
}

/// One priced endpoint in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingEntryConfig {
    pub method: String,
    pub path: String,
    /// Display-unit decimal price, e.g. `"0.005"`.
    pub price: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The token a gateway charges in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
}

/// Gateway configuration.
///
/// Fields use serde defaults that fall back to environment variables, then
/// to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default = "config_defaults::default_name")]
    name: String,
    #[serde(default = "config_defaults::default_rpc_url")]
    rpc_url: Option<String>,
    #[serde(default = "config_defaults::default_chain_id")]
    chain_id: u64,
    #[serde(default = "config_defaults::default_chain_name")]
    chain_name: String,
    #[serde(default = "config_defaults::default_recipient")]
    recipient: Option<String>,
    #[serde(default = "config_defaults::default_token")]
    token: TokenConfig,
    #[serde(default = "config_defaults::default_expiry_window")]
    expiry_window_secs: u64,
    #[serde(default)]
    pricing: Vec<PricingEntryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            name: config_defaults::default_name(),
            rpc_url: config_defaults::default_rpc_url(),
            chain_id: config_defaults::default_chain_id(),
            chain_name: config_defaults::default_chain_name(),
            recipient: config_defaults::default_recipient(),
            token: config_defaults::default_token(),
            expiry_window_secs: config_defaults::default_expiry_window(),
            pricing: Vec::new(),
        }
    }
}

mod config_defaults {
    use super::TokenConfig;
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_CHAIN_ID: u64 = 84532;
    pub const DEFAULT_CHAIN_NAME: &str = "base-sepolia";
    pub const DEFAULT_EXPIRY_WINDOW_SECS: u64 = 300;
    /// USDC on Base Sepolia.
    pub const DEFAULT_TOKEN_ADDRESS: &str = "0x036CbD53842c5426634e7929541eC2318f3dCF7e";

    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }

    pub fn default_name() -> String {
        env::var("GATEWAY_NAME").unwrap_or_else(|_| "agentgate".to_string())
    }

    pub fn default_rpc_url() -> Option<String> {
        env::var("RPC_URL").ok()
    }

    pub fn default_chain_id() -> u64 {
        env::var("CHAIN_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHAIN_ID)
    }

    pub fn default_chain_name() -> String {
        env::var("CHAIN_NAME").unwrap_or_else(|_| DEFAULT_CHAIN_NAME.to_string())
    }

    pub fn default_recipient() -> Option<String> {
        env::var("RECIPIENT_ADDRESS").ok()
    }

    pub fn default_token() -> TokenConfig {
        TokenConfig {
            symbol: env::var("TOKEN_SYMBOL").unwrap_or_else(|_| "USDC".to_string()),
            address: env::var("TOKEN_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_TOKEN_ADDRESS.to_string()),
            decimals: env::var("TOKEN_DECIMALS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(6),
        }
    }

    pub fn default_expiry_window() -> u64 {
        env::var("EXPIRY_WINDOW_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_EXPIRY_WINDOW_SECS)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

impl Config {
    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by:
    /// 1. `--config <path>` CLI argument
    /// 2. `./agentgate.json` (if it exists)
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Self::get_config_path(cli_args.config);
        Self::load_from_path(config_path)
    }

    fn load_from_path(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let content = fs::read_to_string(&p)?;
                let config: Config = serde_json::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    fn get_config_path(cli_config: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(path) = cli_config {
            return Some(path);
        }
        let default_path = PathBuf::from("agentgate.json");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    pub fn expiry_window_secs(&self) -> u64 {
        self.expiry_window_secs
    }

    /// The ledger RPC endpoint. Required; no default makes sense here.
    pub fn rpc_url(&self) -> Result<&str, ConfigError> {
        self.rpc_url
            .as_deref()
            .ok_or(ConfigError::Missing("rpcUrl (or RPC_URL)"))
    }

    /// The address payments are collected at.
    pub fn recipient(&self) -> Result<EvmAddress, ConfigError> {
        let raw = self
            .recipient
            .as_deref()
            .ok_or(ConfigError::Missing("recipient (or RECIPIENT_ADDRESS)"))?;
        raw.parse().map_err(|_| ConfigError::Invalid {
            field: "recipient",
            value: raw.to_string(),
        })
    }

    pub fn token(&self) -> Result<TokenDescriptor, ConfigError> {
        let address = self
            .token
            .address
            .parse()
            .map_err(|_| ConfigError::Invalid {
                field: "token.address",
                value: self.token.address.clone(),
            })?;
        Ok(TokenDescriptor {
            symbol: self.token.symbol.clone(),
            address,
            decimals: self.token.decimals,
        })
    }

    /// Builds the pricing table from the configured entries.
    pub fn pricing_table(&self) -> Result<PricingTable, ConfigError> {
        let mut table = PricingTable::new();
        for entry in &self.pricing {
            let mut price_entry = PriceEntry::new(entry.price.clone());
            if let Some(description) = &entry.description {
                price_entry = price_entry.with_description(description.clone());
            }
            table = table.with_price(endpoint_key(&entry.method, &entry.path), price_entry);
        }
        table.validate().map_err(|e| ConfigError::Invalid {
            field: "pricing",
            value: e.to_string(),
        })?;
        Ok(table)
    }
}
