//! RPC endpoint selection.
//!
//! Candidates are tried in order (a configured endpoint first, then the
//! network defaults). Each one must answer `eth_blockNumber` with a positive
//! block and `eth_chainId` with the expected chain within the probe timeout.
//! The first endpoint that passes is cached for [`DEFAULT_CACHE_TTL`].

use std::future::Future;
use std::time::{Duration, Instant};

use alloy_provider::{Provider, ProviderBuilder};
use scp::networks::{ChainId, default_rpc_urls};
use tokio::sync::Mutex;
use url::Url;

/// How long a validated endpoint is reused.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
/// Timeout for each liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(8);

const REASON_MAX_CHARS: usize = 80;

/// No candidate endpoint passed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No responsive RPC for chain {chain_id}. Tried: {}", render_attempts(.attempts))]
pub struct NoResponsiveRpc {
    /// Chain that was being resolved.
    pub chain_id: ChainId,
    /// `(url, reason)` for every candidate, in the order tried.
    pub attempts: Vec<(String, String)>,
}

fn render_attempts(attempts: &[(String, String)]) -> String {
    if attempts.is_empty() {
        return "none".to_owned();
    }
    attempts
        .iter()
        .map(|(url, reason)| format!("{url}: {reason}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(REASON_MAX_CHARS).collect()
}

/// Candidate list: `custom` first, then the defaults, without duplicates.
#[must_use]
pub fn candidate_urls(chain_id: ChainId, custom: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let custom = custom.map(str::trim).filter(|s| !s.is_empty());
    for url in custom.into_iter().chain(default_rpc_urls(chain_id).iter().copied()) {
        if !out.iter().any(|u| u == url) {
            out.push(url.to_owned());
        }
    }
    out
}

/// Returns the first candidate for which `probe` succeeds.
///
/// # Errors
///
/// Returns [`NoResponsiveRpc`] listing each candidate with its failure
/// reason, truncated to 80 characters.
pub async fn select_rpc<F, Fut>(
    chain_id: ChainId,
    candidates: &[String],
    probe: F,
) -> Result<String, NoResponsiveRpc>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut attempts = Vec::with_capacity(candidates.len());
    for url in candidates {
        match probe(url.clone()).await {
            Ok(()) => return Ok(url.clone()),
            Err(reason) => {
                #[cfg(feature = "telemetry")]
                tracing::debug!(chain_id, rpc_url = %url, %reason, "RPC candidate rejected");
                attempts.push((url.clone(), truncate_reason(&reason)));
            }
        }
    }
    Err(NoResponsiveRpc { chain_id, attempts })
}

/// Probes `url` over HTTP JSON-RPC.
///
/// # Errors
///
/// Returns a human-readable reason when the endpoint is unusable.
pub async fn probe_http(url: String, chain_id: ChainId, timeout: Duration) -> Result<(), String> {
    let parsed: Url = url.parse().map_err(|e| format!("invalid url: {e}"))?;
    let provider = ProviderBuilder::new().connect_http(parsed);
    let block = tokio::time::timeout(timeout, provider.get_block_number())
        .await
        .map_err(|_| "timeout".to_owned())?
        .map_err(|e| e.to_string())?;
    if block < 1 {
        return Err(format!("invalid block number {block}"));
    }
    let remote = tokio::time::timeout(timeout, provider.get_chain_id())
        .await
        .map_err(|_| "timeout".to_owned())?
        .map_err(|e| e.to_string())?;
    if remote != chain_id {
        return Err(format!("chain id {remote}, expected {chain_id}"));
    }
    Ok(())
}

#[derive(Debug)]
struct Selected {
    url: String,
    at: Instant,
}

/// Caches the validated RPC endpoint of one chain.
#[derive(Debug)]
pub struct RpcSelector {
    chain_id: ChainId,
    candidates: Vec<String>,
    ttl: Duration,
    probe_timeout: Duration,
    selected: Mutex<Option<Selected>>,
}

impl RpcSelector {
    /// Creates a selector for `chain_id`, preferring `custom` when given.
    #[must_use]
    pub fn new(chain_id: ChainId, custom: Option<String>) -> Self {
        Self::with_candidates(chain_id, candidate_urls(chain_id, custom.as_deref()))
    }

    /// Creates a selector that tries exactly `candidates`, in order.
    #[must_use]
    pub const fn with_candidates(chain_id: ChainId, candidates: Vec<String>) -> Self {
        Self {
            chain_id,
            candidates,
            ttl: DEFAULT_CACHE_TTL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            selected: Mutex::const_new(None),
        }
    }

    /// Overrides the cache lifetime.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Overrides the per-probe timeout.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Chain this selector resolves.
    #[must_use]
    pub const fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Returns a validated endpoint URL, probing again once the cache lapses.
    ///
    /// # Errors
    ///
    /// Returns [`NoResponsiveRpc`] when every candidate fails.
    pub async fn url(&self) -> Result<String, NoResponsiveRpc> {
        let mut selected = self.selected.lock().await;
        if let Some(s) = selected.as_ref()
            && s.at.elapsed() < self.ttl
        {
            return Ok(s.url.clone());
        }
        let chain_id = self.chain_id;
        let timeout = self.probe_timeout;
        let url = select_rpc(chain_id, &self.candidates, |u| probe_http(u, chain_id, timeout)).await?;
        #[cfg(feature = "telemetry")]
        tracing::info!(chain_id, rpc_url = %url, "Selected RPC endpoint");
        *selected = Some(Selected {
            url: url.clone(),
            at: Instant::now(),
        });
        Ok(url)
    }

    /// Drops the cached endpoint so the next call probes again.
    pub async fn invalidate(&self) {
        *self.selected.lock().await = None;
    }
}
