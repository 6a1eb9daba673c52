//! Hub state: open quotes, payment records and channel heads.
//!
//! All mutations go through [`HubStore::tx`], which holds one lock for the
//! closure and the optional write-back, so concurrent requests observe a
//! serial history. With a file path the whole state is rewritten after every
//! transaction via a temp file and rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use alloy_primitives::{Address, B256, Bytes};
use scp::UnixTimestamp;
use scp::proto::{ChannelState, ChannelView, PaymentRecord, Quote};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A quote awaiting issue, keyed by `invoiceId:paymentId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQuote {
    /// The quote as returned to the payer.
    pub quote: Quote,
    /// Channel the payer will debit.
    pub channel_id: B256,
    /// Context the issued state must carry.
    pub context_hash: B256,
    /// When the quote was issued.
    pub created_at: UnixTimestamp,
}

/// The latest co-signed state of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    /// Channel id.
    pub channel_id: B256,
    /// Nonce of `latest_state`.
    pub latest_nonce: u64,
    /// `"open"` while payments are accepted.
    pub status: String,
    /// Newest state both sides signed.
    pub latest_state: ChannelState,
    /// The payer, recovered from the first signed state.
    pub participant_a: Address,
    /// Payer signature over `latest_state`.
    pub sig_a: Bytes,
    /// Hub countersignature over `latest_state`.
    pub sig_b: Bytes,
}

impl ChannelRecord {
    /// Public view with signatures stripped.
    #[must_use]
    pub fn view(&self) -> ChannelView {
        ChannelView {
            channel_id: self.channel_id,
            latest_nonce: self.latest_nonce,
            status: self.status.clone(),
            latest_state: Some(self.latest_state.clone()),
            participant_a: Some(self.participant_a),
            has_signed_state: !self.sig_a.is_empty() || !self.sig_b.is_empty(),
        }
    }
}

/// Everything the hub persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubState {
    /// Open quotes by [`quote_key`].
    #[serde(default)]
    pub quotes: BTreeMap<String, StoredQuote>,
    /// Payment records by payment id.
    #[serde(default)]
    pub payments: BTreeMap<String, PaymentRecord>,
    /// Channel heads by channel id.
    #[serde(default)]
    pub channels: BTreeMap<B256, ChannelRecord>,
}

/// Key of a stored quote.
#[must_use]
pub fn quote_key(invoice_id: &str, payment_id: &str) -> String {
    format!("{invoice_id}:{payment_id}")
}

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the state file failed.
    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),
    /// The state could not be encoded.
    #[error("state encoding: {0}")]
    Encode(#[from] serde_json::Error),
    /// The state file exists but does not hold hub state.
    #[error("corrupt state file {}: {source}", path.display())]
    Corrupt {
        /// The offending file.
        path: PathBuf,
        /// Why it did not parse.
        source: serde_json::Error,
    },
}

/// Shared hub state with optional JSON persistence.
#[derive(Debug)]
pub struct HubStore {
    state: Mutex<HubState>,
    path: Option<PathBuf>,
}

impl Default for HubStore {
    fn default() -> Self {
        Self::memory()
    }
}

impl HubStore {
    /// A store that lives only in memory.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            path: None,
        }
    }

    /// Opens a file-backed store, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created or the
    /// file cannot be read, and [`StoreError::Corrupt`] if the file does not
    /// parse. The file is left untouched in that case.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let state = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(state) => state,
                Err(source) => return Err(StoreError::Corrupt { path, source }),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HubState::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            path = %path.display(),
            quotes = state.quotes.len(),
            payments = state.payments.len(),
            channels = state.channels.len(),
            "Opened hub store"
        );
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Runs a read-only closure against the current state.
    pub async fn read<R>(&self, f: impl FnOnce(&HubState) -> R) -> R {
        f(&*self.state.lock().await)
    }

    /// Runs a mutation and persists the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write-back fails. The in-memory change
    /// is kept either way.
    pub async fn tx<R>(&self, f: impl FnOnce(&mut HubState) -> R) -> Result<R, StoreError> {
        let mut state = self.state.lock().await;
        let out = f(&mut state);
        if let Some(path) = &self.path {
            write_atomic(path, &serde_json::to_vec(&*state)?).await?;
        }
        Ok(out)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
