//! The on-chain settlement ledger.
//!
//! [`SettlementLedger`] is the seam between protocol logic and the chain.
//! Hubs use it to read channel terms the first time they see a channel;
//! agents use it to open and top up channels and to rediscover channel ids
//! from `ChannelOpened` logs. [`EvmLedger`] implements it with alloy.

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use alloy_network::EthereumWallet;
use alloy_primitives::{Address, B256, TxHash, U256};
use alloy_provider::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{Filter, TransactionReceipt};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use scp::UnixTimestamp;
use scp::amount::TokenAmount;
use scp::networks::ChainId;
use tokio::sync::Mutex;
use url::Url;

use crate::contract::{IERC20, IScpChannel};
use crate::logs::{LogQueryError, LogScan, LogSource};
use crate::provider::{NoResponsiveRpc, RpcSelector};

/// Timeout for view calls and log queries.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for submitting a transaction.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for a transaction receipt.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(120);

const NATIVE_OPEN_GAS: u64 = 350_000;
const NATIVE_DEPOSIT_GAS: u64 = 200_000;

/// Channel terms as recorded by the settlement contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainChannel {
    /// Payer side.
    pub participant_a: Address,
    /// Payee or hub side.
    pub participant_b: Address,
    /// Token, or the zero address for the native asset.
    pub asset: Address,
    /// Dispute window in seconds.
    pub challenge_period_sec: u64,
    /// Hard expiry of the channel.
    pub channel_expiry: UnixTimestamp,
    /// Total deposited balance.
    pub total_balance: TokenAmount,
    /// A unilateral close has started.
    pub is_closing: bool,
    /// Close deadline, zero when not closing.
    pub close_deadline: u64,
    /// Highest nonce submitted on-chain.
    pub latest_nonce: u64,
}

impl OnChainChannel {
    /// The contract returns an all-zero record for unknown ids.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.participant_a != Address::ZERO
    }
}

impl From<IScpChannel::ChannelParams> for OnChainChannel {
    fn from(p: IScpChannel::ChannelParams) -> Self {
        Self {
            participant_a: p.participantA,
            participant_b: p.participantB,
            asset: p.asset,
            challenge_period_sec: p.challengePeriodSec,
            channel_expiry: UnixTimestamp::from_secs(p.channelExpiry),
            total_balance: TokenAmount(p.totalBalance),
            is_closing: p.isClosing,
            close_deadline: p.closeDeadline,
            latest_nonce: p.latestNonce,
        }
    }
}

/// Arguments of `openChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenChannelParams {
    /// Counterparty (hub or payee).
    pub peer: Address,
    /// Token, or the zero address for the native asset.
    pub asset: Address,
    /// Initial deposit.
    pub amount: U256,
    /// Dispute window in seconds.
    pub challenge_period_sec: u64,
    /// Unix time after which the channel can be closed unilaterally.
    pub channel_expiry: u64,
    /// Uniqueness salt for the channel id.
    pub salt: B256,
}

/// Ledger failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// No RPC endpoint could be validated.
    #[error(transparent)]
    NoRpc(#[from] NoResponsiveRpc),
    /// A contract call or submission failed.
    #[error("contract call failed: {0}")]
    Contract(#[from] alloy_contract::Error),
    /// Waiting for a receipt failed.
    #[error("transaction not confirmed: {0}")]
    Pending(#[from] alloy_provider::PendingTransactionError),
    /// Raw RPC failure.
    #[error("rpc error: {0}")]
    Transport(#[from] alloy_transport::TransportError),
    /// A log scan failed.
    #[error(transparent)]
    Logs(#[from] LogQueryError),
    /// An operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The transaction was mined but reverted.
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
    /// `openChannel` succeeded but emitted no `ChannelOpened`.
    #[error("ChannelOpened event not found in receipt")]
    MissingChannelOpened,
}

impl LedgerError {
    /// Whether the endpoint, rather than the chain, is at fault.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout(_)
                | Self::Logs(_)
                | Self::Contract(alloy_contract::Error::TransportError(_))
        )
    }
}

async fn with_timeout<F, T, E>(what: &'static str, limit: Duration, fut: F) -> Result<T, LedgerError>
where
    F: IntoFuture<Output = Result<T, E>>,
    LedgerError: From<E>,
{
    tokio::time::timeout(limit, fut.into_future())
        .await
        .map_err(|_| LedgerError::Timeout(what))?
        .map_err(LedgerError::from)
}

/// On-chain operations needed by hubs and agents.
#[async_trait]
pub trait SettlementLedger: Send + Sync + std::fmt::Debug {
    /// Chain this ledger settles on.
    fn chain_id(&self) -> ChainId;

    /// Settlement contract address.
    fn contract(&self) -> Address;

    /// Reads a channel's terms.
    async fn get_channel(&self, channel_id: B256) -> Result<OnChainChannel, LedgerError>;

    /// Approves the settlement contract to pull `amount` of `asset`, if the
    /// current allowance is lower. A no-op for the native asset.
    async fn ensure_allowance(&self, asset: Address, amount: U256) -> Result<(), LedgerError>;

    /// Opens a channel and returns its id once the transaction is confirmed.
    async fn open_channel(&self, params: OpenChannelParams) -> Result<B256, LedgerError>;

    /// Adds `amount` to an existing channel and waits for confirmation.
    async fn deposit(&self, channel_id: B256, asset: Address, amount: U256)
    -> Result<TxHash, LedgerError>;

    /// Finds the newest channel `payer` opened with `peer`.
    async fn find_channel_opened(
        &self,
        payer: Address,
        peer: Address,
    ) -> Result<Option<B256>, LedgerError>;

    /// What `owner` holds of `asset` outside any channel. The zero address
    /// reads the native balance.
    async fn wallet_balance(&self, owner: Address, asset: Address) -> Result<U256, LedgerError>;
}

/// Where an [`EvmLedger`] gets its provider.
#[derive(Debug, Clone)]
enum Rpc {
    /// One endpoint for the ledger's lifetime.
    Fixed(DynProvider),
    /// Resolved through the selector on first use and again after an
    /// endpoint fails.
    Selected {
        selector: Arc<RpcSelector>,
        wallet: EthereumWallet,
        current: Arc<Mutex<Option<(String, DynProvider)>>>,
    },
}

/// [`SettlementLedger`] backed by an alloy provider with a local wallet.
///
/// Built with [`EvmLedger::with_selector`], a transport failure drops the
/// endpoint: reads are retried once on the next validated candidate, writes
/// are not repeated since the transaction may already have been broadcast.
#[derive(Debug, Clone)]
pub struct EvmLedger {
    rpc: Rpc,
    chain_id: ChainId,
    contract: Address,
    owner: Address,
    scan: LogScan,
}

impl EvmLedger {
    /// Wraps an existing provider. `owner` is the address transactions are
    /// sent from.
    #[must_use]
    pub fn new(provider: DynProvider, chain_id: ChainId, contract: Address, owner: Address) -> Self {
        Self {
            rpc: Rpc::Fixed(provider),
            chain_id,
            contract,
            owner,
            scan: LogScan::default(),
        }
    }

    /// A ledger on whichever endpoint `selector` validates. Nothing is
    /// probed until the first call, so a ledger built while every endpoint
    /// is down starts working once one comes back.
    #[must_use]
    pub fn with_selector(
        selector: Arc<RpcSelector>,
        signer: PrivateKeySigner,
        chain_id: ChainId,
        contract: Address,
    ) -> Self {
        let owner = signer.address();
        Self {
            rpc: Rpc::Selected {
                selector,
                wallet: EthereumWallet::from(signer),
                current: Arc::default(),
            },
            chain_id,
            contract,
            owner,
            scan: LogScan::default(),
        }
    }

    /// Overrides the log scan windows.
    #[must_use]
    pub const fn with_log_scan(mut self, scan: LogScan) -> Self {
        self.scan = scan;
        self
    }

    async fn provider(&self) -> Result<DynProvider, LedgerError> {
        let (selector, wallet, current) = match &self.rpc {
            Rpc::Fixed(provider) => return Ok(provider.clone()),
            Rpc::Selected {
                selector,
                wallet,
                current,
            } => (selector, wallet, current),
        };
        let url = selector.url().await?;
        let mut current = current.lock().await;
        if let Some((cached, provider)) = current.as_ref()
            && *cached == url
        {
            return Ok(provider.clone());
        }
        let parsed: Url = url.parse().map_err(|e| NoResponsiveRpc {
            chain_id: self.chain_id,
            attempts: vec![(url.clone(), format!("invalid url: {e}"))],
        })?;
        let provider = ProviderBuilder::new()
            .wallet(wallet.clone())
            .connect_http(parsed)
            .erased();
        *current = Some((url, provider.clone()));
        Ok(provider)
    }

    /// Drops the selected endpoint if `err` says it is unusable. Returns
    /// whether it did.
    async fn rotate(&self, err: &LedgerError) -> bool {
        let Rpc::Selected { selector, .. } = &self.rpc else {
            return false;
        };
        if !err.is_transport() {
            return false;
        }
        #[cfg(feature = "telemetry")]
        tracing::warn!(chain_id = self.chain_id, error = %err, "RPC endpoint failed; reselecting");
        selector.invalidate().await;
        true
    }

    async fn read<T, F, Fut>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Fn(DynProvider) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, LedgerError>> + Send,
        T: Send,
    {
        match op(self.provider().await?).await {
            Err(e) if self.rotate(&e).await => op(self.provider().await?).await,
            other => other,
        }
    }

    async fn write<T, F, Fut>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(DynProvider) -> Fut + Send,
        Fut: Future<Output = Result<T, LedgerError>> + Send,
        T: Send,
    {
        let result = op(self.provider().await?).await;
        if let Err(e) = &result {
            self.rotate(e).await;
        }
        result
    }
}

async fn confirm(
    what: &'static str,
    pending: PendingTransactionBuilder<alloy_network::Ethereum>,
) -> Result<TransactionReceipt, LedgerError> {
    let receipt = pending
        .with_timeout(Some(CONFIRM_TIMEOUT))
        .get_receipt()
        .await?;
    if !receipt.status() {
        #[cfg(feature = "telemetry")]
        tracing::warn!(tx = %receipt.transaction_hash, what, "transaction reverted");
        return Err(LedgerError::Reverted(receipt.transaction_hash));
    }
    #[cfg(feature = "telemetry")]
    tracing::info!(tx = %receipt.transaction_hash, what, "transaction confirmed");
    #[cfg(not(feature = "telemetry"))]
    let _ = what;
    Ok(receipt)
}

#[async_trait]
impl SettlementLedger for EvmLedger {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn contract(&self) -> Address {
        self.contract
    }

    async fn get_channel(&self, channel_id: B256) -> Result<OnChainChannel, LedgerError> {
        let contract = self.contract;
        self.read(|provider| async move {
            let channel = IScpChannel::new(contract, provider);
            let call = channel.getChannel(channel_id);
            let params = with_timeout("getChannel", READ_TIMEOUT, call.call()).await?;
            Ok(params.into())
        })
        .await
    }

    async fn ensure_allowance(&self, asset: Address, amount: U256) -> Result<(), LedgerError> {
        if asset == Address::ZERO {
            return Ok(());
        }
        let (owner, spender) = (self.owner, self.contract);
        let allowance = self
            .read(|provider| async move {
                let token = IERC20::new(asset, provider);
                let call = token.allowance(owner, spender);
                with_timeout("allowance", READ_TIMEOUT, call.call()).await
            })
            .await?;
        if allowance >= amount {
            return Ok(());
        }
        #[cfg(feature = "telemetry")]
        tracing::info!(%asset, %allowance, "approving settlement contract");
        self.write(|provider| async move {
            let token = IERC20::new(asset, provider);
            let approve = token.approve(spender, U256::MAX);
            let pending = with_timeout("approve", SEND_TIMEOUT, approve.send()).await?;
            confirm("approve", pending).await
        })
        .await?;
        Ok(())
    }

    async fn open_channel(&self, params: OpenChannelParams) -> Result<B256, LedgerError> {
        let native = params.asset == Address::ZERO;
        if !native {
            self.ensure_allowance(params.asset, params.amount).await?;
        }
        let contract = self.contract;
        self.write(|provider| async move {
            let channel = IScpChannel::new(contract, provider);
            let mut call = channel.openChannel(
                params.peer,
                params.asset,
                params.amount,
                params.challenge_period_sec,
                params.channel_expiry,
                params.salt,
            );
            if native {
                call = call.value(params.amount).gas(NATIVE_OPEN_GAS);
            }
            let pending = with_timeout("openChannel", SEND_TIMEOUT, call.send()).await?;
            let receipt = confirm("openChannel", pending).await?;
            receipt
                .inner
                .logs()
                .iter()
                .filter(|log| log.address() == contract)
                .find_map(|log| log.log_decode::<IScpChannel::ChannelOpened>().ok())
                .map(|log| log.inner.data.channelId)
                .ok_or(LedgerError::MissingChannelOpened)
        })
        .await
    }

    async fn deposit(
        &self,
        channel_id: B256,
        asset: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError> {
        let native = asset == Address::ZERO;
        if !native {
            self.ensure_allowance(asset, amount).await?;
        }
        let contract = self.contract;
        self.write(|provider| async move {
            let channel = IScpChannel::new(contract, provider);
            let mut call = channel.deposit(channel_id, amount);
            if native {
                call = call.value(amount).gas(NATIVE_DEPOSIT_GAS);
            }
            let pending = with_timeout("deposit", SEND_TIMEOUT, call.send()).await?;
            let receipt = confirm("deposit", pending).await?;
            Ok(receipt.transaction_hash)
        })
        .await
    }

    async fn find_channel_opened(
        &self,
        payer: Address,
        peer: Address,
    ) -> Result<Option<B256>, LedgerError> {
        let (contract, scan) = (self.contract, self.scan);
        self.read(|provider| async move {
            let latest =
                with_timeout("eth_blockNumber", READ_TIMEOUT, provider.get_block_number()).await?;
            let source = ChannelOpenedLogs {
                provider: &provider,
                base: Filter::new()
                    .address(contract)
                    .event_signature(IScpChannel::ChannelOpened::SIGNATURE_HASH)
                    .topic2(payer.into_word())
                    .topic3(peer.into_word()),
            };
            Ok(scan.find_last(&source, latest).await?)
        })
        .await
    }

    async fn wallet_balance(&self, owner: Address, asset: Address) -> Result<U256, LedgerError> {
        self.read(|provider| async move {
            if asset == Address::ZERO {
                with_timeout("eth_getBalance", READ_TIMEOUT, provider.get_balance(owner)).await
            } else {
                let token = IERC20::new(asset, provider);
                let call = token.balanceOf(owner);
                with_timeout("balanceOf", READ_TIMEOUT, call.call()).await
            }
        })
        .await
    }
}

/// `ChannelOpened(_, payer, peer)` logs, yielding channel ids.
struct ChannelOpenedLogs<'a> {
    provider: &'a DynProvider,
    base: Filter,
}

#[async_trait]
impl LogSource for ChannelOpenedLogs<'_> {
    type Item = B256;

    async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<B256>, String> {
        let filter = self.base.clone().from_block(from).to_block(to);
        let logs = tokio::time::timeout(READ_TIMEOUT, self.provider.get_logs(&filter))
            .await
            .map_err(|_| "eth_getLogs timed out".to_owned())?
            .map_err(|e| e.to_string())?;
        Ok(logs
            .iter()
            .filter_map(|log| log.topics().get(1).copied())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use serde_json::{Value, json};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const CHAIN: ChainId = 31_337;

    fn node(balance: u64) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync + 'static {
        move |req: &Request| {
            let call: Value = serde_json::from_slice(&req.body).unwrap();
            let result = match call["method"].as_str() {
                Some("eth_blockNumber") => json!("0x10"),
                Some("eth_chainId") => json!(format!("{CHAIN:#x}")),
                Some("eth_getBalance") => json!(format!("{balance:#x}")),
                other => panic!("unexpected call {other:?}"),
            };
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": call["id"],
                "result": result,
            }))
        }
    }

    fn ledger(selector: &Arc<RpcSelector>) -> EvmLedger {
        EvmLedger::with_selector(Arc::clone(selector), PrivateKeySigner::random(), CHAIN, Address::ZERO)
    }

    #[tokio::test]
    async fn reads_move_to_the_next_endpoint_after_a_transport_failure() {
        let flaky = MockServer::start().await;
        // Passes the liveness probe, then goes down.
        Mock::given(method("POST"))
            .respond_with(node(1))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&flaky)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&flaky)
            .await;
        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(node(100))
            .mount(&healthy)
            .await;

        let selector = Arc::new(RpcSelector::with_candidates(CHAIN, vec![flaky.uri(), healthy.uri()]));
        let ledger = ledger(&selector);
        let balance = ledger
            .wallet_balance(Address::repeat_byte(1), Address::ZERO)
            .await
            .unwrap();
        assert_eq!(balance, U256::from(100));
        assert_eq!(selector.url().await.unwrap(), healthy.uri());
    }

    #[tokio::test]
    async fn ledger_built_without_a_live_endpoint_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(node(7))
            .mount(&server)
            .await;

        let selector = Arc::new(RpcSelector::with_candidates(CHAIN, vec![server.uri()]));
        let ledger = ledger(&selector);
        let err = ledger
            .wallet_balance(Address::repeat_byte(1), Address::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NoRpc(_)));
        let balance = ledger
            .wallet_balance(Address::repeat_byte(1), Address::ZERO)
            .await
            .unwrap();
        assert_eq!(balance, U256::from(7));
    }

    #[tokio::test]
    async fn fixed_provider_reports_failures_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let provider = ProviderBuilder::new()
            .connect_http(server.uri().parse().unwrap())
            .erased();
        let ledger = EvmLedger::new(provider, CHAIN, Address::ZERO, Address::repeat_byte(2));
        let err = ledger
            .wallet_balance(Address::repeat_byte(1), Address::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn only_endpoint_failures_rotate() {
        assert!(LedgerError::Timeout("getChannel").is_transport());
        assert!(!LedgerError::Reverted(TxHash::ZERO).is_transport());
        assert!(!LedgerError::MissingChannelOpened.is_transport());
    }

    #[test]
    fn zeroed_params_mean_missing_channel() {
        let params = IScpChannel::ChannelParams {
            participantA: Address::ZERO,
            participantB: Address::ZERO,
            asset: Address::ZERO,
            challengePeriodSec: 0,
            channelExpiry: 0,
            totalBalance: U256::ZERO,
            isClosing: false,
            closeDeadline: 0,
            latestNonce: 0,
        };
        assert!(!OnChainChannel::from(params.clone()).exists());

        let open = IScpChannel::ChannelParams {
            participantA: address!("0x00000000000000000000000000000000000000a1"),
            totalBalance: U256::from(5_000u64),
            channelExpiry: 1_800_000_000,
            ..params
        };
        let channel = OnChainChannel::from(open);
        assert!(channel.exists());
        assert_eq!(channel.total_balance, TokenAmount::from(5_000));
        assert_eq!(channel.channel_expiry.as_secs(), 1_800_000_000);
    }
}
