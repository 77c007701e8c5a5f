//! SDK configuration: YAML file, environment overrides and network presets.
//!
//! ```yaml
//! network:
//!   rpc_url: https://rpc.v1.dev.pod.network
//!   ws_url: wss://rpc.v1.dev.pod.network
//! polling:
//!   timeout_ms: 60000
//! reconnect:
//!   type: exponential_backoff
//!   max_attempts: null
//! gas:
//!   strategy:
//!     mode: fetched_with_multiplier
//!     multiplier_percent: 120
//! ws:
//!   max_subscriptions: 4
//! log:
//!   level: debug
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{PollingConfig, ReconnectPolicy};
use crate::telemetry::LogConfig;

pub const DEV_RPC_URL: &str = "https://rpc.v1.dev.pod.network";
pub const DEV_WS_URL: &str = "wss://rpc.v1.dev.pod.network";
pub const LOCAL_RPC_URL: &str = "http://127.0.0.1:10600";
pub const LOCAL_WS_URL: &str = "ws://127.0.0.1:9002";

/// 100 gwei.
pub const DEFAULT_GAS_PRICE_WEI: u64 = 100_000_000_000;

pub const ENV_RPC_URL: &str = "PODKIT_RPC_URL";
pub const ENV_WS_URL: &str = "PODKIT_WS_URL";
pub const ENV_LOG: &str = "PODKIT_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

fn default_rpc_url() -> String {
    DEV_RPC_URL.into()
}
fn default_ws_url() -> String {
    DEV_WS_URL.into()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            ws_url: default_ws_url(),
        }
    }
}

/// How gas prices are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GasMode {
    #[default]
    Fetched,
    Fixed { price_wei: u64 },
    FetchedWithMultiplier { multiplier_percent: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasSettings {
    #[serde(default)]
    pub strategy: GasMode,
    /// Cache TTL; 0 fetches on every call.
    #[serde(default = "default_gas_refresh_ms")]
    pub refresh_interval_ms: u64,
    /// Oldest snapshot still served when a refresh fails.
    #[serde(default = "default_gas_staleness_ms")]
    pub max_staleness_ms: u64,
    /// Served when no usable snapshot exists and the source fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_price_wei: Option<u64>,
}

fn default_gas_refresh_ms() -> u64 {
    12_000
}
fn default_gas_staleness_ms() -> u64 {
    60_000
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            strategy: GasMode::default(),
            refresh_interval_ms: default_gas_refresh_ms(),
            max_staleness_ms: default_gas_staleness_ms(),
            fallback_price_wei: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsSettings {
    /// Distinct server-side subscriptions allowed at once.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// Per-consumer buffer; excess items are dropped.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// How long a subscribe waits for the server's acknowledgement.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_subscriptions() -> usize {
    10
}
fn default_buffer_size() -> usize {
    100
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            max_subscriptions: default_max_subscriptions(),
            buffer_size: default_buffer_size(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Top-level SDK configuration. Every section is optional in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub gas: GasSettings,
    #[serde(default)]
    pub ws: WsSettings,
    #[serde(default)]
    pub log: LogConfig,
    /// HTTP request timeout for the JSON-RPC transport.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            polling: PollingConfig::default(),
            reconnect: ReconnectPolicy::default(),
            gas: GasSettings::default(),
            ws: WsSettings::default(),
            log: LogConfig::default(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl SdkConfig {
    /// The public dev network.
    pub fn dev() -> Self {
        Self::default()
    }

    /// A node running on localhost with default ports.
    pub fn local() -> Self {
        Self {
            network: NetworkConfig {
                rpc_url: LOCAL_RPC_URL.into(),
                ws_url: LOCAL_WS_URL.into(),
            },
            ..Self::default()
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `PODKIT_RPC_URL`, `PODKIT_WS_URL` and `PODKIT_LOG` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup; empty values are ignored.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(ENV_RPC_URL) {
            self.network.rpc_url = url;
        }
        if let Some(url) = get(ENV_WS_URL) {
            self.network.ws_url = url;
        }
        if let Some(level) = get(ENV_LOG) {
            self.log.level = level;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("network.rpc_url", &self.network.rpc_url, &["http://", "https://"])?;
        check_scheme("network.ws_url", &self.network.ws_url, &["ws://", "wss://"])?;
        self.reconnect.validate()?;

        match self.gas.strategy {
            GasMode::Fixed { price_wei: 0 } => {
                return Err(ConfigError::invalid("gas.strategy.price_wei", "must be greater than 0"))
            }
            GasMode::FetchedWithMultiplier { multiplier_percent: 0 } => {
                return Err(ConfigError::invalid(
                    "gas.strategy.multiplier_percent",
                    "must be greater than 0",
                ))
            }
            _ => {}
        }
        if self.gas.max_staleness_ms < self.gas.refresh_interval_ms {
            return Err(ConfigError::invalid(
                "gas.max_staleness_ms",
                "must be at least refresh_interval_ms",
            ));
        }
        if self.ws.max_subscriptions == 0 {
            return Err(ConfigError::invalid("ws.max_subscriptions", "must be greater than 0"));
        }
        if self.ws.buffer_size == 0 {
            return Err(ConfigError::invalid("ws.buffer_size", "must be greater than 0"));
        }
        if self.ws.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("ws.request_timeout_ms", "must be greater than 0"));
        }
        if self.http_timeout_ms == 0 {
            return Err(ConfigError::invalid("http_timeout_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

fn check_scheme(field: &'static str, url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    if schemes.iter().any(|s| url.starts_with(s)) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{url:?} must start with one of {schemes:?}"),
        ))
    }
}
