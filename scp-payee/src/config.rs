//! Payee gateway configuration.
//!
//! Loaded from a TOML file with `$VAR` / `${VAR}` expansion, then overridden
//! by environment variables.
//!
//! # Example Configuration
//!
//! ```toml
//! network = "base"
//! private_key = "$PAYEE_PRIVATE_KEY"
//! payment_mode = "pay_once"
//!
//! [routes."/v1/data"]
//! price = "1000000"
//!
//! [routes."/v1/premium"]
//! price = "5000000"
//!
//! [[routes."/v1/premium".accepts]]
//! network = "sepolia"
//! hub = "http://127.0.0.1:4021"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `payee.toml`)
//! - `HOST`, `PORT` - Bind address and port (default `127.0.0.1:4042`)
//! - `PAYEE_PRIVATE_KEY` - required; startup aborts without it
//! - `HUB_URL`, `HUB_NAME`, `NETWORK`, `ASSET`, `PRICE`, `RESOURCE_PATH`
//! - `PAYMENT_MODE` (`per_request` | `pay_once`), `PAY_ONCE_TTL_SEC`
//! - `REPLAY_STORE_PATH`, `REPLAY_TTL_SEC`, `REPLAY_MAX_ENTRIES`
//! - `PRODUCTION` - refuse to start with an in-memory replay cache
//! - `HUB_ADMIN_TOKEN` - sent when registering the webhook with the hub
//! - `PERF_MODE` - skip confirming hub payments with the hub
//! - `CONTRACT_ADDRESS` - settlement contract of the state signing domain
//! - `PUBLIC_URL` - base URL the hub should deliver webhooks to

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use alloy_primitives::Address;
use scp::amount::TokenAmount;
use scp::config::{ConfigError, EnvLookup, ProcessEnv, load_file};
use scp::networks::{
    BASE_MAINNET, ChainId, USDC_BASE, caip2, hub_endpoint, resolve_asset, resolve_chain_id,
    settlement_contract,
};
use serde::{Deserialize, Serialize};

/// How a successful payment is honoured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    /// Every request pays.
    #[default]
    PerRequest,
    /// One payment buys a time-boxed grant for the route.
    PayOnce,
}

impl FromStr for PaymentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_request" => Ok(Self::PerRequest),
            "pay_once" => Ok(Self::PayOnce),
            _ => Err(ConfigError::Invalid(
                "invalid payment mode; use per_request or pay_once".to_owned(),
            )),
        }
    }
}

/// One accepted payment option for a route. Unset fields inherit the
/// top-level values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptConfig {
    /// Network alias, chain id or CAIP-2 id.
    #[serde(default)]
    pub network: Option<String>,
    /// Token address.
    #[serde(default)]
    pub asset: Option<Address>,
    /// Hub endpoint.
    #[serde(default)]
    pub hub: Option<String>,
    /// Hub display name.
    #[serde(default)]
    pub hub_name: Option<String>,
    /// Price in base units.
    #[serde(default)]
    pub price: Option<TokenAmount>,
}

/// A priced route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route price; the top-level price when unset.
    #[serde(default)]
    pub price: Option<TokenAmount>,
    /// Payment options; one default option when empty.
    #[serde(default)]
    pub accepts: Vec<AcceptConfig>,
}

/// A fully resolved payment option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept {
    /// CAIP-2 network id.
    pub network: String,
    /// Numeric chain id.
    pub chain_id: ChainId,
    /// Token address.
    pub asset: Address,
    /// Hub base URL.
    pub hub_endpoint: String,
    /// Hub display name.
    pub hub_name: String,
    /// Price in base units.
    pub price: TokenAmount,
}

/// Top-level payee configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayeeConfig {
    /// Listen address (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Listen port (default 4042).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Signing key; only its address is used.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Default hub. Defaults to the public hub for `network`.
    #[serde(default)]
    pub hub_url: Option<String>,
    /// Display name of the default hub.
    #[serde(default = "default_hub_name")]
    pub hub_name: String,
    /// Network alias, chain id or CAIP-2 id (default: Base).
    #[serde(default = "default_network")]
    pub network: String,
    /// Default asset. Defaults to the network's USDC.
    #[serde(default)]
    pub asset: Option<Address>,
    /// Default price in base units.
    #[serde(default = "default_price")]
    pub price: TokenAmount,
    /// Route served when `routes` is empty.
    #[serde(default = "default_resource_path")]
    pub resource_path: String,
    /// Priced routes by path.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
    /// Per-request or pay-once.
    #[serde(default)]
    pub payment_mode: PaymentMode,
    /// Lifetime of pay-once grants.
    #[serde(default = "default_pay_once_ttl")]
    pub pay_once_ttl_sec: u64,
    /// Replay cache file; in-memory when unset.
    #[serde(default)]
    pub replay_store_path: Option<PathBuf>,
    /// How long accepted payments are remembered.
    #[serde(default = "default_replay_ttl")]
    pub replay_ttl_sec: u64,
    /// Replay cache capacity.
    #[serde(default = "default_replay_max_entries")]
    pub replay_max_entries: usize,
    /// Refuse to start without a persistent replay cache.
    #[serde(default)]
    pub production: bool,
    /// Sent when registering webhooks with hubs.
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Skip confirming hub payments with the hub.
    #[serde(default)]
    pub perf_mode: bool,
    /// Settlement contract; the canonical one when unset.
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Base URL hubs deliver webhooks to.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    4042
}

fn default_hub_name() -> String {
    "pay.eth".to_owned()
}

fn default_network() -> String {
    caip2(BASE_MAINNET)
}

fn default_price() -> TokenAmount {
    TokenAmount::from(1_000_000)
}

fn default_resource_path() -> String {
    "/v1/data".to_owned()
}

const fn default_pay_once_ttl() -> u64 {
    86_400
}

const fn default_replay_ttl() -> u64 {
    2_592_000
}

const fn default_replay_max_entries() -> usize {
    50_000
}

impl Default for PayeeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            private_key: None,
            hub_url: None,
            hub_name: default_hub_name(),
            network: default_network(),
            asset: None,
            price: default_price(),
            resource_path: default_resource_path(),
            routes: BTreeMap::new(),
            payment_mode: PaymentMode::default(),
            pay_once_ttl_sec: default_pay_once_ttl(),
            replay_store_path: None,
            replay_ttl_sec: default_replay_ttl(),
            replay_max_entries: default_replay_max_entries(),
            production: false,
            admin_token: None,
            perf_mode: false,
            contract_address: None,
            public_url: None,
        }
    }
}

fn truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl PayeeConfig {
    /// Loads from `CONFIG` (default `payee.toml`) and the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// fails [`Self::validate`].
    pub fn load() -> Result<Self, ConfigError> {
        let path = ProcessEnv
            .non_empty("CONFIG")
            .unwrap_or_else(|| "payee.toml".to_owned());
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
        if let Some(host) = env.parsed("HOST") {
            self.host = host;
        }
        if let Some(port) = env.parsed("PORT") {
            self.port = port;
        }
        if let Some(key) = env.non_empty("PAYEE_PRIVATE_KEY") {
            self.private_key = Some(key);
        }
        if let Some(url) = env.non_empty("HUB_URL") {
            self.hub_url = Some(url);
        }
        if let Some(name) = env.non_empty("HUB_NAME") {
            self.hub_name = name;
        }
        if let Some(network) = env.non_empty("NETWORK") {
            self.network = network;
        }
        if let Some(asset) = env.non_empty("ASSET") {
            self.asset = asset
                .parse()
                .ok()
                .or_else(|| resolve_asset(self.chain_id(), &asset).map(|a| a.address));
        }
        if let Some(price) = env.parsed("PRICE") {
            self.price = price;
        }
        if let Some(path) = env.non_empty("RESOURCE_PATH") {
            self.resource_path = path;
        }
        if let Some(mode) = env.non_empty("PAYMENT_MODE") {
            self.payment_mode = mode.parse()?;
        }
        if let Some(ttl) = env.parsed("PAY_ONCE_TTL_SEC") {
            self.pay_once_ttl_sec = ttl;
        }
        if let Some(path) = env.non_empty("REPLAY_STORE_PATH") {
            self.replay_store_path = Some(PathBuf::from(path));
        }
        if let Some(ttl) = env.parsed("REPLAY_TTL_SEC") {
            self.replay_ttl_sec = ttl;
        }
        if let Some(max) = env.parsed("REPLAY_MAX_ENTRIES") {
            self.replay_max_entries = max;
        }
        if let Some(flag) = env.non_empty("PRODUCTION") {
            self.production = truthy(&flag);
        }
        if let Some(token) = env.non_empty("HUB_ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }
        if let Some(flag) = env.non_empty("PERF_MODE") {
            self.perf_mode = truthy(&flag);
        }
        if let Some(contract) = env.parsed("CONTRACT_ADDRESS") {
            self.contract_address = Some(contract);
        }
        if let Some(url) = env.non_empty("PUBLIC_URL") {
            self.public_url = Some(url);
        }
        Ok(())
    }

    /// Rejects settings the gateway must not run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if resolve_chain_id(&self.network).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown network: {}",
                self.network
            )));
        }
        if self.pay_once_ttl_sec == 0 {
            return invalid("invalid pay-once TTL; expected positive integer seconds");
        }
        if self.replay_ttl_sec == 0 {
            return invalid("invalid replay TTL; expected positive integer seconds");
        }
        if self.replay_max_entries == 0 {
            return invalid("invalid replay max entries; expected positive integer");
        }
        if let Some(path) = self.routes.keys().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "route \"{path}\" must start with /"
            )));
        }
        if self.production && self.replay_store_path.is_none() {
            return invalid(
                "production requires a persistent replay cache; set REPLAY_STORE_PATH",
            );
        }
        Ok(())
    }

    /// The signing key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no key is configured or the
    /// variable reference was never expanded.
    pub fn private_key(&self) -> Result<&str, ConfigError> {
        match self.private_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() && !key.starts_with('$') => Ok(key),
            _ => Err(ConfigError::Invalid(
                "PAYEE_PRIVATE_KEY env var is required".to_owned(),
            )),
        }
    }

    /// Chain of the default network.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        resolve_chain_id(&self.network).unwrap_or(BASE_MAINNET)
    }

    /// Default hub endpoint.
    #[must_use]
    pub fn hub_url(&self) -> String {
        self.hub_url
            .clone()
            .unwrap_or_else(|| hub_endpoint(self.chain_id(), None))
    }

    /// Settlement contract of the state signing domain.
    #[must_use]
    pub fn contract(&self) -> Address {
        settlement_contract(self.chain_id(), self.contract_address)
    }

    fn default_asset(&self, chain_id: ChainId) -> Address {
        self.asset
            .or_else(|| resolve_asset(chain_id, "usdc").map(|a| a.address))
            .unwrap_or(USDC_BASE)
    }

    /// Every priced route with its resolved payment options. With no
    /// `routes` table, `resource_path` at `price`.
    #[must_use]
    pub fn routes(&self) -> BTreeMap<String, Vec<Accept>> {
        if self.routes.is_empty() {
            let default = RouteConfig::default();
            return BTreeMap::from([(
                self.resource_path.clone(),
                self.resolve_route(&default),
            )]);
        }
        self.routes
            .iter()
            .map(|(path, route)| (path.clone(), self.resolve_route(route)))
            .collect()
    }

    fn resolve_route(&self, route: &RouteConfig) -> Vec<Accept> {
        let fallback = [AcceptConfig::default()];
        let entries = if route.accepts.is_empty() {
            &fallback[..]
        } else {
            &route.accepts[..]
        };
        entries
            .iter()
            .map(|entry| {
                let chain_id = entry
                    .network
                    .as_deref()
                    .and_then(resolve_chain_id)
                    .unwrap_or_else(|| self.chain_id());
                Accept {
                    network: caip2(chain_id),
                    chain_id,
                    asset: entry.asset.unwrap_or_else(|| self.default_asset(chain_id)),
                    hub_endpoint: entry.hub.clone().unwrap_or_else(|| self.hub_url()),
                    hub_name: entry
                        .hub_name
                        .clone()
                        .unwrap_or_else(|| self.hub_name.clone()),
                    price: entry.price.or(route.price).unwrap_or(self.price),
                }
            })
            .collect()
    }

    /// Distinct hub endpoints across all routes, default hub first.
    #[must_use]
    pub fn hub_urls(&self) -> Vec<String> {
        let mut urls = vec![self.hub_url()];
        for accept in self.routes().values().flatten() {
            if !urls.contains(&accept.hub_endpoint) {
                urls.push(accept.hub_endpoint.clone());
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp::networks::{SEPOLIA, USDC_SEPOLIA};
    use std::io::Write;

    fn env_of(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_owned())
        }
    }

    #[test]
    fn defaults_serve_one_route() {
        let config = PayeeConfig::load_with("/nonexistent/payee.toml", &env_of(&[])).unwrap();
        assert_eq!(config.port, 4042);
        assert_eq!(config.network, "eip155:8453");
        assert_eq!(config.payment_mode, PaymentMode::PerRequest);
        assert!(config.private_key().is_err());

        let routes = config.routes();
        let accepts = &routes["/v1/data"];
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].price, TokenAmount::from(1_000_000));
        assert_eq!(accepts[0].asset, USDC_BASE);
        assert_eq!(accepts[0].hub_endpoint, "https://159.223.150.70/hub/base");
    }

    #[test]
    fn production_needs_replay_store() {
        let err = PayeeConfig::load_with(
            "/nonexistent/payee.toml",
            &env_of(&[("PRODUCTION", "true")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("REPLAY_STORE_PATH"));

        let ok = PayeeConfig::load_with(
            "/nonexistent/payee.toml",
            &env_of(&[("PRODUCTION", "1"), ("REPLAY_STORE_PATH", "/tmp/replay.json")]),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn bad_payment_mode_is_rejected() {
        let err = PayeeConfig::load_with(
            "/nonexistent/payee.toml",
            &env_of(&[("PAYMENT_MODE", "monthly")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("per_request or pay_once"));
    }

    #[test]
    fn routes_inherit_and_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
network = "base"
hub_url = "http://hub.local"
private_key = "${{KEY}}"

[routes."/v1/data"]
price = "1000000"

[routes."/v1/premium"]
price = "5000000"

[[routes."/v1/premium".accepts]]
network = "sepolia"
hub = "http://sepolia-hub.local"
"#
        )
        .unwrap();
        let config = PayeeConfig::load_with(
            file.path().to_str().unwrap(),
            &env_of(&[("KEY", "0xabc"), ("PAYMENT_MODE", "pay_once")]),
        )
        .unwrap();
        assert_eq!(config.private_key().unwrap(), "0xabc");
        assert_eq!(config.payment_mode, PaymentMode::PayOnce);

        let routes = config.routes();
        assert_eq!(routes.len(), 2);
        let premium = &routes["/v1/premium"][0];
        assert_eq!(premium.chain_id, SEPOLIA);
        assert_eq!(premium.network, "eip155:11155111");
        assert_eq!(premium.asset, USDC_SEPOLIA);
        assert_eq!(premium.price, TokenAmount::from(5_000_000));
        assert_eq!(routes["/v1/data"][0].hub_endpoint, "http://hub.local");

        assert_eq!(
            config.hub_urls(),
            vec!["http://hub.local".to_owned(), "http://sepolia-hub.local".to_owned()]
        );
    }
}
