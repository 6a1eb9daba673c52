//! Known EVM networks, assets and settlement deployments.
//!
//! Networks are addressed three ways: a human alias (`"base"`, `"sepolia"`),
//! a bare chain id (`"8453"`) or a CAIP-2 identifier (`"eip155:8453"`).
//! [`resolve_chain_id`] accepts all three.

use std::collections::HashMap;

use alloy_primitives::{Address, address};

/// An EIP-155 chain ID (e.g., 8453 for Base).
pub type ChainId = u64;

/// Ethereum mainnet chain ID.
pub const ETHEREUM_MAINNET: ChainId = 1;
/// Base mainnet chain ID.
pub const BASE_MAINNET: ChainId = 8453;
/// Sepolia chain ID.
pub const SEPOLIA: ChainId = 11_155_111;
/// Base Sepolia chain ID.
pub const BASE_SEPOLIA: ChainId = 84532;

/// Settlement contract deployed at the same CREATE2 address on every chain.
pub const CANONICAL_CONTRACT: Address = address!("07ECA6701062Db12eDD04bEa391eD226C95aaD4b");

/// Default public hub host; per-network hubs live under [`Network::hub_path`].
pub const DEFAULT_HUB_BASE_URL: &str = "https://159.223.150.70";

/// Native ETH is represented by the zero address.
pub const NATIVE_ASSET: Address = Address::ZERO;

/// USDC on Ethereum mainnet.
pub const USDC_ETHEREUM: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
/// USDT on Ethereum mainnet.
pub const USDT_ETHEREUM: Address = address!("dAC17F958D2ee523a2206206994597C13D831ec7");
/// USDC on Base.
pub const USDC_BASE: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
/// USDT on Base.
pub const USDT_BASE: Address = address!("fde4C96c8593536E31F229EA8f37b2ADa2699bb2");
/// USDC on Sepolia.
pub const USDC_SEPOLIA: Address = address!("1c7D4B196Cb0C7B01d743Fbc6116a902379C7238");
/// USDC on Base Sepolia.
pub const USDC_BASE_SEPOLIA: Address = address!("036CbD53842c5426634e7929541eC2318f3dCF7e");

/// A known network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    /// Canonical short name.
    pub name: &'static str,
    /// Display name.
    pub display_name: &'static str,
    /// Alternative names accepted by [`resolve_chain_id`].
    pub aliases: &'static [&'static str],
    /// EIP-155 chain ID.
    pub chain_id: ChainId,
    /// Public RPC endpoints, tried in order.
    pub rpc_urls: &'static [&'static str],
    /// Path of this network's hub under [`DEFAULT_HUB_BASE_URL`].
    pub hub_path: &'static str,
}

impl Network {
    /// CAIP-2 identifier of this network.
    #[must_use]
    pub fn caip2(&self) -> String {
        caip2(self.chain_id)
    }
}

/// A token known on a given chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetInfo {
    /// Chain the token lives on.
    pub chain_id: ChainId,
    /// Ticker.
    pub symbol: &'static str,
    /// Contract address, or [`NATIVE_ASSET`].
    pub address: Address,
    /// Token decimals.
    pub decimals: u8,
}

impl AssetInfo {
    /// Whether this is the chain's native currency.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.address == NATIVE_ASSET
    }
}

/// All networks this crate knows about.
pub const NETWORKS: &[Network] = &[
    Network {
        name: "mainnet",
        display_name: "Ethereum",
        aliases: &["ethereum", "eth"],
        chain_id: ETHEREUM_MAINNET,
        rpc_urls: &[
            "https://rpc.ankr.com/eth",
            "https://eth.public.blastapi.io",
            "https://1rpc.io/eth",
            "https://eth.drpc.org",
        ],
        hub_path: "/hub/eth",
    },
    Network {
        name: "base",
        display_name: "Base",
        aliases: &[],
        chain_id: BASE_MAINNET,
        rpc_urls: &[
            "https://mainnet.base.org",
            "https://rpc.ankr.com/base",
            "https://base.public.blastapi.io",
            "https://1rpc.io/base",
        ],
        hub_path: "/hub/base",
    },
    Network {
        name: "sepolia",
        display_name: "Sepolia",
        aliases: &[],
        chain_id: SEPOLIA,
        rpc_urls: &[
            "https://rpc.ankr.com/eth_sepolia",
            "https://eth-sepolia.public.blastapi.io",
            "https://1rpc.io/sepolia",
            "https://sepolia.drpc.org",
        ],
        hub_path: "/hub/sepolia",
    },
    Network {
        name: "base-sepolia",
        display_name: "Base Sepolia",
        aliases: &[],
        chain_id: BASE_SEPOLIA,
        rpc_urls: &[
            "https://sepolia.base.org",
            "https://base-sepolia.public.blastapi.io",
            "https://rpc.ankr.com/base_sepolia",
        ],
        hub_path: "/hub/base-sepolia",
    },
];

/// All assets this crate knows about.
pub const ASSETS: &[AssetInfo] = &[
    asset(ETHEREUM_MAINNET, "USDC", USDC_ETHEREUM, 6),
    asset(ETHEREUM_MAINNET, "USDT", USDT_ETHEREUM, 6),
    asset(ETHEREUM_MAINNET, "ETH", NATIVE_ASSET, 18),
    asset(BASE_MAINNET, "USDC", USDC_BASE, 6),
    asset(BASE_MAINNET, "USDT", USDT_BASE, 6),
    asset(BASE_MAINNET, "ETH", NATIVE_ASSET, 18),
    asset(SEPOLIA, "USDC", USDC_SEPOLIA, 6),
    asset(SEPOLIA, "ETH", NATIVE_ASSET, 18),
    asset(BASE_SEPOLIA, "USDC", USDC_BASE_SEPOLIA, 6),
    asset(BASE_SEPOLIA, "ETH", NATIVE_ASSET, 18),
];

const fn asset(chain_id: ChainId, symbol: &'static str, address: Address, decimals: u8) -> AssetInfo {
    AssetInfo {
        chain_id,
        symbol,
        address,
        decimals,
    }
}

/// Formats a chain ID as a CAIP-2 identifier.
#[must_use]
pub fn caip2(chain_id: ChainId) -> String {
    format!("eip155:{chain_id}")
}

/// Parses a CAIP-2 identifier into an EIP-155 chain ID.
#[must_use]
pub fn parse_caip2(caip: &str) -> Option<ChainId> {
    caip.strip_prefix("eip155:")
        .and_then(|s| s.parse().ok())
        .filter(|id| *id > 0)
}

/// Looks up a network by alias. Case-insensitive; whitespace becomes `-`.
#[must_use]
pub fn network_by_name(name: &str) -> Option<&'static Network> {
    let key = normalize_name(name);
    NETWORKS
        .iter()
        .find(|n| n.name == key || n.aliases.contains(&key.as_str()))
}

/// Looks up a network by chain ID.
#[must_use]
pub fn network_by_chain_id(chain_id: ChainId) -> Option<&'static Network> {
    NETWORKS.iter().find(|n| n.chain_id == chain_id)
}

/// Resolves an alias, bare chain id or CAIP-2 identifier to a chain ID.
///
/// Numeric forms are accepted even for chains absent from [`NETWORKS`].
#[must_use]
pub fn resolve_chain_id(input: &str) -> Option<ChainId> {
    let raw = input.trim().to_ascii_lowercase();
    if raw.is_empty() {
        return None;
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().ok().filter(|id| *id > 0);
    }
    if raw.starts_with("eip155:") {
        return parse_caip2(&raw);
    }
    network_by_name(&raw).map(|n| n.chain_id)
}

/// Whether two network strings refer to the same chain.
///
/// Unresolvable inputs only match when textually identical.
#[must_use]
pub fn same_network(a: &str, b: &str) -> bool {
    match (resolve_chain_id(a), resolve_chain_id(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

/// Default public RPC endpoints for a chain; empty when unknown.
#[must_use]
pub fn default_rpc_urls(chain_id: ChainId) -> &'static [&'static str] {
    network_by_chain_id(chain_id).map_or(&[], |n| n.rpc_urls)
}

/// Settlement contract for a chain, honouring an explicit override.
#[must_use]
pub fn settlement_contract(_chain_id: ChainId, override_address: Option<Address>) -> Address {
    override_address.unwrap_or(CANONICAL_CONTRACT)
}

/// Looks up an asset by ticker on a chain. Case-insensitive.
#[must_use]
pub fn resolve_asset(chain_id: ChainId, symbol: &str) -> Option<&'static AssetInfo> {
    ASSETS
        .iter()
        .find(|a| a.chain_id == chain_id && a.symbol.eq_ignore_ascii_case(symbol))
}

/// Looks up an asset by contract address on a chain.
#[must_use]
pub fn asset_by_address(chain_id: ChainId, address: Address) -> Option<&'static AssetInfo> {
    ASSETS
        .iter()
        .find(|a| a.chain_id == chain_id && a.address == address)
}

/// Hub endpoint for a network under `base_url` (defaults to [`DEFAULT_HUB_BASE_URL`]).
///
/// Unknown networks fall back to the Sepolia hub.
#[must_use]
pub fn hub_endpoint(chain_id: ChainId, base_url: Option<&str>) -> String {
    let base = base_url.unwrap_or(DEFAULT_HUB_BASE_URL).trim_end_matches('/');
    let path = network_by_chain_id(chain_id).map_or("/hub/sepolia", |n| n.hub_path);
    format!("{base}{path}")
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Name <-> chain ID lookups over a set of networks.
///
/// Built from [`NETWORKS`] by default; callers may register extra entries
/// for private deployments.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    name_to_chain_id: HashMap<String, ChainId>,
    chain_id_to_name: HashMap<ChainId, String>,
}

impl NetworkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name_to_chain_id: HashMap::new(),
            chain_id_to_name: HashMap::new(),
        }
    }

    /// Creates a registry pre-populated from a network slice, aliases included.
    #[must_use]
    pub fn from_networks(networks: &[Network]) -> Self {
        let mut registry = Self::new();
        for n in networks {
            registry.register(n.name, n.chain_id);
            for alias in n.aliases {
                registry.name_to_chain_id.insert((*alias).to_owned(), n.chain_id);
            }
        }
        registry
    }

    /// Registers a name for a chain. The first name registered for a chain
    /// stays its canonical name.
    pub fn register(&mut self, name: &str, chain_id: ChainId) {
        let key = normalize_name(name);
        self.name_to_chain_id.insert(key.clone(), chain_id);
        self.chain_id_to_name.entry(chain_id).or_insert(key);
    }

    /// Looks up a chain ID by name, or by numeric / CAIP-2 form.
    #[must_use]
    pub fn chain_id(&self, input: &str) -> Option<ChainId> {
        self.name_to_chain_id
            .get(&normalize_name(input))
            .copied()
            .or_else(|| {
                let raw = input.trim().to_ascii_lowercase();
                if raw.starts_with("eip155:") {
                    parse_caip2(&raw)
                } else {
                    raw.parse().ok().filter(|id| *id > 0)
                }
            })
    }

    /// Canonical name of a chain.
    #[must_use]
    pub fn name(&self, chain_id: ChainId) -> Option<&str> {
        self.chain_id_to_name.get(&chain_id).map(String::as_str)
    }

    /// Number of distinct chains registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain_id_to_name.len()
    }

    /// Returns `true` if no networks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain_id_to_name.is_empty()
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::from_networks(NETWORKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_every_form() {
        assert_eq!(resolve_chain_id("base"), Some(8453));
        assert_eq!(resolve_chain_id("Base Sepolia"), Some(84532));
        assert_eq!(resolve_chain_id("ETH"), Some(1));
        assert_eq!(resolve_chain_id("eip155:11155111"), Some(SEPOLIA));
        assert_eq!(resolve_chain_id("137"), Some(137));
        assert_eq!(resolve_chain_id("eip155:0"), None);
        assert_eq!(resolve_chain_id("dogechain"), None);
        assert_eq!(resolve_chain_id("  "), None);
    }

    #[test]
    fn network_equivalence() {
        assert!(same_network("base", "eip155:8453"));
        assert!(!same_network("base", "sepolia"));
        assert!(same_network("custom", "CUSTOM"));
    }

    #[test]
    fn assets_and_hubs() {
        let usdc = resolve_asset(BASE_MAINNET, "usdc").unwrap();
        assert_eq!(usdc.address, USDC_BASE);
        assert_eq!(usdc.decimals, 6);
        assert!(resolve_asset(SEPOLIA, "eth").unwrap().is_native());
        assert!(resolve_asset(SEPOLIA, "usdt").is_none());
        assert_eq!(
            hub_endpoint(BASE_SEPOLIA, Some("https://hub.example/")),
            "https://hub.example/hub/base-sepolia"
        );
        assert_eq!(hub_endpoint(999, None), "https://159.223.150.70/hub/sepolia");
    }

    #[test]
    fn registry_lookups() {
        let registry = NetworkRegistry::default();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.chain_id("ethereum"), Some(1));
        assert_eq!(registry.name(1), Some("mainnet"));
        assert_eq!(registry.chain_id("eip155:84532"), Some(84532));

        let mut custom = NetworkRegistry::new();
        custom.register("Local Dev", 31337);
        assert_eq!(custom.chain_id("local dev"), Some(31337));
        assert_eq!(custom.name(31337), Some("local-dev"));
    }
}
