//! Local channel cache and payment history.
//!
//! Channels are keyed by counterparty: `hub:<endpoint>` for hub channels and
//! `direct:<payee>` for direct ones. Only confirmed transitions are written
//! here; a payment that fails part-way leaves the cached state untouched.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use scp::UnixTimestamp;
use scp::amount::TokenAmount;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Payment history entries kept.
pub const HISTORY_LIMIT: usize = 200;

/// Cache key of the channel with a hub.
#[must_use]
pub fn hub_key(endpoint: &str) -> String {
    format!("hub:{}", endpoint.trim().trim_end_matches('/'))
}

/// Cache key of the direct channel with a payee.
#[must_use]
pub fn direct_key(payee: Address) -> String {
    format!("direct:{}", payee.to_string().to_lowercase())
}

/// The agent's copy of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    /// On-chain channel id.
    pub channel_id: B256,
    /// Hub or payee address.
    #[serde(default)]
    pub counterparty: Option<Address>,
    /// Token the channel holds; unknown for channels recovered from a hub
    /// listing.
    #[serde(default)]
    pub asset: Option<Address>,
    /// Nonce of the last confirmed state; zero before the first payment.
    pub nonce: u64,
    /// Payer side.
    pub bal_a: TokenAmount,
    /// Counterparty side.
    pub bal_b: TokenAmount,
    /// Hub endpoint for hub channels.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ChannelRecord {
    /// A freshly funded channel.
    #[must_use]
    pub const fn opened(
        channel_id: B256,
        counterparty: Address,
        asset: Address,
        deposit: TokenAmount,
    ) -> Self {
        Self {
            channel_id,
            counterparty: Some(counterparty),
            asset: Some(asset),
            nonce: 0,
            bal_a: deposit,
            bal_b: TokenAmount::ZERO,
            endpoint: None,
        }
    }
}

/// One attempted payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEntry {
    /// Agent-minted payment id.
    pub payment_id: String,
    /// `hub` or `direct`.
    pub route: String,
    /// URL paid for, or the recipient of a transfer.
    pub resource: String,
    /// Invoice paid.
    pub invoice_id: String,
    /// Payee signing address.
    pub payee: Address,
    /// Price, excluding the fee.
    pub amount: TokenAmount,
    /// Hub fee; zero for direct payments.
    pub fee: TokenAmount,
    /// Whether the payment went through.
    pub ok: bool,
    /// Failure message when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Payee receipt id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    /// Hub ticket id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    /// When the attempt finished.
    pub paid_at: UnixTimestamp,
}

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the state file failed.
    #[error("agent state I/O: {0}")]
    Io(#[from] std::io::Error),
    /// The state could not be encoded.
    #[error("agent state encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistence for channels and history.
#[async_trait]
pub trait ChannelStore: Send + Sync + std::fmt::Debug {
    /// Channel stored under `key`.
    async fn get(&self, key: &str) -> Option<ChannelRecord>;

    /// Stores `record` under `key`.
    async fn put(&self, key: &str, record: ChannelRecord) -> Result<(), StoreError>;

    /// Every cached channel.
    async fn all(&self) -> Vec<(String, ChannelRecord)>;

    /// Prepends `entry` to the history.
    async fn record_payment(&self, entry: PaymentEntry) -> Result<(), StoreError>;

    /// Up to `limit` history entries, newest first.
    async fn history(&self, limit: usize) -> Vec<PaymentEntry>;
}

/// Everything the agent persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Channels by store key (`hub:<endpoint>` or `direct:<payee>`).
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelRecord>,
    /// Payment attempts, newest first.
    #[serde(default)]
    pub history: VecDeque<PaymentEntry>,
}

impl AgentState {
    fn push(&mut self, entry: PaymentEntry) {
        self.history.push_front(entry);
        self.history.truncate(HISTORY_LIMIT);
    }

    fn history(&self, limit: usize) -> Vec<PaymentEntry> {
        self.history.iter().take(limit).cloned().collect()
    }

    fn all(&self) -> Vec<(String, ChannelRecord)> {
        self.channels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// In-process store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    state: RwLock<AgentState>,
}

impl MemoryChannelStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn get(&self, key: &str) -> Option<ChannelRecord> {
        self.state.read().await.channels.get(key).cloned()
    }

    async fn put(&self, key: &str, record: ChannelRecord) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .channels
            .insert(key.to_owned(), record);
        Ok(())
    }

    async fn all(&self) -> Vec<(String, ChannelRecord)> {
        self.state.read().await.all()
    }

    async fn record_payment(&self, entry: PaymentEntry) -> Result<(), StoreError> {
        self.state.write().await.push(entry);
        Ok(())
    }

    async fn history(&self, limit: usize) -> Vec<PaymentEntry> {
        self.state.read().await.history(limit)
    }
}

/// JSON file store. The file is rewritten through a temp file and rename
/// after every change.
#[derive(Debug)]
pub struct FileChannelStore {
    state: RwLock<AgentState>,
    path: PathBuf,
}

impl FileChannelStore {
    /// Opens `path`, creating parent directories. A corrupt file starts
    /// empty; channels are then rediscovered from the hub or the chain.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory or file cannot be read.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let state = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable agent state");
                AgentState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentState::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            path = %path.display(),
            channels = state.channels.len(),
            history = state.history.len(),
            "Opened agent state"
        );
        Ok(Self {
            state: RwLock::new(state),
            path,
        })
    }

    async fn update(&self, f: impl FnOnce(&mut AgentState) + Send) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        f(&mut state);
        write_atomic(&self.path, &serde_json::to_vec_pretty(&*state)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for FileChannelStore {
    async fn get(&self, key: &str) -> Option<ChannelRecord> {
        self.state.read().await.channels.get(key).cloned()
    }

    async fn put(&self, key: &str, record: ChannelRecord) -> Result<(), StoreError> {
        self.update(|s| {
            s.channels.insert(key.to_owned(), record);
        })
        .await
    }

    async fn all(&self) -> Vec<(String, ChannelRecord)> {
        self.state.read().await.all()
    }

    async fn record_payment(&self, entry: PaymentEntry) -> Result<(), StoreError> {
        self.update(|s| s.push(entry)).await
    }

    async fn history(&self, limit: usize) -> Vec<PaymentEntry> {
        self.state.read().await.history(limit)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
