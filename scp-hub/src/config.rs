//! Hub server configuration.
//!
//! Loaded from a TOML file with `$VAR` / `${VAR}` expansion, then overridden
//! by environment variables.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4021
//! hub_name = "pay.eth"
//! network = "sepolia"
//! private_key = "$HUB_PRIVATE_KEY"
//!
//! [fee]
//! base = "10"
//! bps = 30
//! gasSurcharge = "0"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `hub.toml`)
//! - `HOST`, `PORT` - Bind address and port
//! - `HUB_NAME`, `NETWORK`, `CHAIN_ID`, `HUB_PRIVATE_KEY`, `DEFAULT_ASSET`
//! - `FEE_BASE`, `FEE_BPS`, `GAS_SURCHARGE`
//! - `RPC_URL`, `CONTRACT_ADDRESS` - enable on-chain verification of new channels
//! - `HUB_ADMIN_TOKEN` - enables the webhook and event admin endpoints
//! - `QUOTE_SWEEP_INTERVAL_SEC`, `STORE_PATH`

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use alloy_primitives::Address;
use scp::config::{ConfigError, EnvLookup, ProcessEnv, load_file};
use scp::fee::FeePolicy;
use scp::networks::{ChainId, SEPOLIA, USDC_BASE, resolve_asset, resolve_chain_id};
use serde::{Deserialize, Serialize};

/// Top-level hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Server bind address (default: `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4021`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Name advertised in `/.well-known/x402`.
    #[serde(default = "default_hub_name")]
    pub hub_name: String,

    /// Network alias, chain id or CAIP-2 id (default: Sepolia).
    #[serde(default)]
    pub network: Option<String>,

    /// Explicit chain id; wins over `network`.
    #[serde(default)]
    pub chain_id: Option<ChainId>,

    /// Hub signing key, hex with or without `0x`.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Primary asset. Defaults to the chain's USDC.
    #[serde(default)]
    pub default_asset: Option<Address>,

    /// Fee charged on every ticket.
    #[serde(default)]
    pub fee: FeePolicy,

    /// RPC endpoint for on-chain channel lookups.
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Settlement contract for on-chain channel lookups.
    #[serde(default)]
    pub contract_address: Option<Address>,

    /// Token guarding webhook and event endpoints.
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Minimum seconds between expired-quote sweeps.
    #[serde(default = "default_sweep_interval")]
    pub quote_sweep_interval_sec: u64,

    /// JSON file for durable state; in-memory when unset.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    4021
}

fn default_hub_name() -> String {
    "pay.eth".to_owned()
}

const fn default_sweep_interval() -> u64 {
    30
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hub_name: default_hub_name(),
            network: None,
            chain_id: None,
            private_key: None,
            default_asset: None,
            fee: FeePolicy::default(),
            rpc_url: None,
            contract_address: None,
            admin_token: None,
            quote_sweep_interval_sec: default_sweep_interval(),
            store_path: None,
        }
    }
}

impl HubConfig {
    /// Loads from `CONFIG` (default `hub.toml`) and the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = ProcessEnv
            .non_empty("CONFIG")
            .unwrap_or_else(|| "hub.toml".to_owned());
        Self::load_with(&path, &ProcessEnv)
    }

    /// Loads from `path`, resolving variables through `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with(path: &str, env: &impl EnvLookup) -> Result<Self, ConfigError> {
        let mut config: Self = load_file(path, env, toml::from_str)?;
        config.apply_env(env);
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl EnvLookup) {
        if let Some(host) = env.parsed("HOST") {
            self.host = host;
        }
        if let Some(port) = env.parsed("PORT") {
            self.port = port;
        }
        if let Some(name) = env.non_empty("HUB_NAME") {
            self.hub_name = name;
        }
        if let Some(network) = env.non_empty("NETWORK") {
            self.network = Some(network);
        }
        if let Some(chain_id) = env.parsed("CHAIN_ID") {
            self.chain_id = Some(chain_id);
        }
        if let Some(key) = env.non_empty("HUB_PRIVATE_KEY") {
            self.private_key = Some(key);
        }
        if let Some(asset) = env.non_empty("DEFAULT_ASSET") {
            self.default_asset = asset.parse().ok().or_else(|| {
                resolve_asset(self.chain_id(), &asset).map(|a| a.address)
            });
        }
        if let Some(base) = env.parsed("FEE_BASE") {
            self.fee.base = base;
        }
        if let Some(bps) = env.parsed("FEE_BPS") {
            self.fee.bps = bps;
        }
        if let Some(surcharge) = env.parsed("GAS_SURCHARGE") {
            self.fee.gas_surcharge = surcharge;
        }
        if let Some(url) = env.non_empty("RPC_URL") {
            self.rpc_url = Some(url);
        }
        if let Some(contract) = env.parsed("CONTRACT_ADDRESS") {
            self.contract_address = Some(contract);
        }
        if let Some(token) = env.non_empty("HUB_ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }
        if let Some(secs) = env.parsed::<u64>("QUOTE_SWEEP_INTERVAL_SEC") {
            self.quote_sweep_interval_sec = secs.max(1);
        }
        if let Some(path) = env.non_empty("STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }
    }

    /// Effective chain id: `chain_id`, else the resolved `network`, else Sepolia.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
            .or_else(|| self.network.as_deref().and_then(resolve_chain_id))
            .unwrap_or(SEPOLIA)
    }

    /// Effective default asset: configured, else the chain's USDC.
    #[must_use]
    pub fn default_asset(&self) -> Address {
        self.default_asset
            .or_else(|| resolve_asset(self.chain_id(), "usdc").map(|a| a.address))
            .unwrap_or(USDC_BASE)
    }

    /// The signing key, if present and resolved.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no key is configured or the
    /// variable reference was never expanded.
    pub fn private_key(&self) -> Result<&str, ConfigError> {
        match self.private_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() && !key.starts_with('$') => Ok(key),
            _ => Err(ConfigError::Invalid(
                "HUB_PRIVATE_KEY is required".to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp::amount::TokenAmount;
    use scp::networks::{BASE_MAINNET, USDC_SEPOLIA};
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_file() {
        let config = HubConfig::load_with("/nonexistent/hub.toml", &no_env).unwrap();
        assert_eq!(config.port, 4021);
        assert_eq!(config.hub_name, "pay.eth");
        assert_eq!(config.chain_id(), SEPOLIA);
        assert_eq!(config.default_asset(), USDC_SEPOLIA);
        assert_eq!(config.fee, FeePolicy::default());
        assert_eq!(config.quote_sweep_interval_sec, 30);
        assert!(config.private_key().is_err());
    }

    #[test]
    fn file_values_expand_and_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 5000\nnetwork = \"base\"\nprivate_key = \"${{KEY}}\"\n[fee]\nbase = \"20\"\nbps = 10"
        )
        .unwrap();
        let env = |name: &str| match name {
            "KEY" => Some("0x01".to_owned()),
            "FEE_BPS" => Some("45".to_owned()),
            "HUB_ADMIN_TOKEN" => Some("secret".to_owned()),
            _ => None,
        };
        let config = HubConfig::load_with(file.path().to_str().unwrap(), &env).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.chain_id(), BASE_MAINNET);
        assert_eq!(config.private_key().unwrap(), "0x01");
        assert_eq!(config.fee.base, TokenAmount::from(20));
        assert_eq!(config.fee.bps, 45);
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
    }

    #[test]
    fn unresolved_key_is_rejected() {
        let config = HubConfig {
            private_key: Some("$HUB_PRIVATE_KEY".to_owned()),
            ..HubConfig::default()
        };
        assert!(config.private_key().is_err());
    }

    #[test]
    fn chain_id_beats_network() {
        let env = |name: &str| match name {
            "NETWORK" => Some("base".to_owned()),
            "CHAIN_ID" => Some("84532".to_owned()),
            "DEFAULT_ASSET" => Some("usdc".to_owned()),
            _ => None,
        };
        let config = HubConfig::load_with("/nonexistent/hub.toml", &env).unwrap();
        assert_eq!(config.chain_id(), 84_532);
        assert_eq!(
            config.default_asset(),
            scp::networks::USDC_BASE_SEPOLIA
        );
    }
}
