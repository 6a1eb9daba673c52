//! Agent configuration.
//!
//! A plain serde struct: every field has a default, so an empty TOML file
//! (or none at all) yields a usable Sepolia agent. Environment variables
//! override the file.
//!
//! # Environment Variables
//!
//! - `AGENT_PRIVATE_KEY` - signing key of the payer
//! - `NETWORK` - network alias, chain id or CAIP-2 id (default `sepolia`)
//! - `MAX_AMOUNT`, `MAX_FEE` - per-payment caps in base units
//! - `ROUTE` - `auto` | `hub` | `direct`
//! - `TOPUP_PAYMENTS`, `LOW_WATER_PAYMENTS` - channel funding policy
//! - `CONTRACT_ADDRESS`, `RPC_URL` - settlement contract and RPC override
//! - `AGENT_STATE_PATH` - JSON file for channel state and payment history

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use alloy_primitives::Address;
use scp::amount::TokenAmount;
use scp::config::{ConfigError, EnvLookup, ProcessEnv, load_file};
use scp::networks::{ChainId, SEPOLIA, resolve_chain_id, settlement_contract};
use serde::{Deserialize, Serialize};

/// Which scheme the agent pays with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePreference {
    /// A direct channel that already covers the price, else a hub.
    #[default]
    Auto,
    /// Hub offers only.
    Hub,
    /// Direct offers only.
    Direct,
}

impl FromStr for RoutePreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "hub" => Ok(Self::Hub),
            "direct" => Ok(Self::Direct),
            _ => Err(ConfigError::Invalid(
                "invalid route; use auto, hub or direct".to_owned(),
            )),
        }
    }
}

impl fmt::Display for RoutePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Hub => "hub",
            Self::Direct => "direct",
        })
    }
}

/// Agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Payer key, hex.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Network alias, chain id or CAIP-2 id offers must be on.
    #[serde(default = "default_network")]
    pub network: String,
    /// Largest price the agent pays for one request.
    #[serde(default = "default_max_amount")]
    pub max_amount: TokenAmount,
    /// Largest hub fee accepted per payment.
    #[serde(default = "default_max_fee")]
    pub max_fee: TokenAmount,
    /// Hub, direct or whichever is ready.
    #[serde(default)]
    pub route: RoutePreference,
    /// Assets the agent pays in; empty means any.
    #[serde(default)]
    pub asset_allowlist: Vec<Address>,
    /// Payments a fresh top-up should cover.
    #[serde(default = "default_topup_payments")]
    pub topup_payments: u64,
    /// Top up once fewer than this many payments remain.
    #[serde(default = "default_low_water_payments")]
    pub low_water_payments: u64,
    /// Settlement contract; the canonical one when unset.
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Preferred RPC endpoint, tried before the network defaults.
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Dispute window of channels the agent opens.
    #[serde(default = "default_challenge_period")]
    pub challenge_period_sec: u64,
    /// Lifetime of channels the agent opens.
    #[serde(default = "default_channel_expiry")]
    pub channel_expiry_sec: u64,
    /// Lifetime of quotes, signed states and direct payments.
    #[serde(default = "default_quote_ttl")]
    pub quote_ttl_sec: u64,
    /// Timeout for requests to payees.
    #[serde(default = "default_timeout")]
    pub timeout_sec: u64,
    /// Where channel state and history are kept; in memory when unset.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

fn default_network() -> String {
    "sepolia".to_owned()
}

fn default_max_amount() -> TokenAmount {
    TokenAmount::from(5_000_000_000_000)
}

fn default_max_fee() -> TokenAmount {
    TokenAmount::from(5_000)
}

const fn default_topup_payments() -> u64 {
    100
}

const fn default_low_water_payments() -> u64 {
    10
}

const fn default_challenge_period() -> u64 {
    86_400
}

const fn default_channel_expiry() -> u64 {
    30 * 86_400
}

const fn default_quote_ttl() -> u64 {
    120
}

const fn default_timeout() -> u64 {
    8
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            network: default_network(),
            max_amount: default_max_amount(),
            max_fee: default_max_fee(),
            route: RoutePreference::default(),
            asset_allowlist: Vec::new(),
            topup_payments: default_topup_payments(),
            low_water_payments: default_low_water_payments(),
            contract_address: None,
            rpc_url: None,
            challenge_period_sec: default_challenge_period(),
            channel_expiry_sec: default_channel_expiry(),
            quote_ttl_sec: default_quote_ttl(),
            timeout_sec: default_timeout(),
            state_path: None,
        }
    }
}

impl AgentConfig {
    /// Loads from `CONFIG` (default `agent.toml`) and the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// fails [`Self::validate`].
    pub fn load() -> Result<Self, ConfigError> {
        let path = ProcessEnv
            .non_empty("CONFIG")
            .unwrap_or_else(|| "agent.toml".to_owned());
        Self::load_with(&path, &ProcessEnv)
    }

    /// Loads from `path`, resolving variables through `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// fails [`Self::validate`].
    pub fn load_with(path: &str, env: &impl EnvLookup) -> Result<Self, ConfigError> {
        let mut config: Self = load_file(path, env, toml::from_str)?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl EnvLookup) -> Result<(), ConfigError> {
        if let Some(key) = env.non_empty("AGENT_PRIVATE_KEY") {
            self.private_key = Some(key);
        }
        if let Some(network) = env.non_empty("NETWORK") {
            self.network = network;
        }
        if let Some(max) = env.parsed("MAX_AMOUNT") {
            self.max_amount = max;
        }
        if let Some(max) = env.parsed("MAX_FEE") {
            self.max_fee = max;
        }
        if let Some(route) = env.non_empty("ROUTE") {
            self.route = route.parse()?;
        }
        if let Some(n) = env.parsed("TOPUP_PAYMENTS") {
            self.topup_payments = n;
        }
        if let Some(n) = env.parsed("LOW_WATER_PAYMENTS") {
            self.low_water_payments = n;
        }
        if let Some(contract) = env.parsed("CONTRACT_ADDRESS") {
            self.contract_address = Some(contract);
        }
        if let Some(url) = env.non_empty("RPC_URL") {
            self.rpc_url = Some(url);
        }
        if let Some(path) = env.non_empty("AGENT_STATE_PATH") {
            self.state_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Rejects settings the agent must not run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if resolve_chain_id(&self.network).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown network: {}",
                self.network
            )));
        }
        if self.topup_payments == 0 {
            return Err(ConfigError::Invalid(
                "topup_payments must be at least 1".to_owned(),
            ));
        }
        if self.quote_ttl_sec == 0 {
            return Err(ConfigError::Invalid(
                "quote_ttl_sec must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// The signing key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no key is configured.
    pub fn private_key(&self) -> Result<&str, ConfigError> {
        match self.private_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() && !key.starts_with('$') => Ok(key),
            _ => Err(ConfigError::Invalid(
                "AGENT_PRIVATE_KEY env var is required".to_owned(),
            )),
        }
    }

    /// Chain of the configured network.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        resolve_chain_id(&self.network).unwrap_or(SEPOLIA)
    }

    /// Settlement contract channels are opened on and states are signed for.
    #[must_use]
    pub fn contract(&self) -> Address {
        settlement_contract(self.chain_id(), self.contract_address)
    }

    /// Whether `asset` passes the allowlist.
    #[must_use]
    pub fn allows_asset(&self, asset: Address) -> bool {
        self.asset_allowlist.is_empty() || self.asset_allowlist.contains(&asset)
    }
}
