//! Quote and ticket issuance.
//!
//! A payment moves through `quoted -> issued` (or `quoted -> expired`). A
//! quote fixes the fee and the ticket draft; issuing binds it to a channel
//! state the payer has signed. The hub countersigns that state and signs
//! the ticket. Issue requests for one channel are serialized so that two
//! states can never be accepted at the same nonce.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::{Address, B256, U256};
use alloy_signer_local::PrivateKeySigner;
use axum::http::StatusCode;
use dashmap::DashMap;
use scp::amount::TokenAmount;
use scp::fee::FeePolicy;
use scp::ids;
use scp::networks::{ChainId, NATIVE_ASSET};
use scp::proto::{
    ChannelAck, ChannelState, ChannelView, EventKind, HUB_SCHEME, HubInfo, IssueRequest,
    IssueResponse, PaymentRecord, PaymentStatus, Quote, QuoteRequest, TicketDraft,
};
use scp::timestamp::{Clock, SystemClock};
use scp::{ScpErrorCode, UnixTimestamp};
use scp_evm::ChannelDomain;
use scp_evm::ledger::{OnChainChannel, SettlementLedger};
use scp_evm::signer::SignerLike;
use scp_evm::ticket::{policy_hash, sign_ticket};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::HubError;
use crate::store::{ChannelRecord, HubStore, StoredQuote, quote_key};
use crate::webhooks::WebhookManager;

/// Longest lifetime of a quote, whatever the payer asks for.
pub const MAX_QUOTE_TTL_SECS: u64 = 120;

/// Default minimum spacing of expired-quote sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Hub payment modes advertised in `/.well-known/x402`.
pub const MODES: [&str; 2] = ["proxy_hold", "peer_simple"];

fn rejected(code: ScpErrorCode, message: impl Into<String>) -> HubError {
    HubError::conflict(code, message)
}

fn policy(message: impl Into<String>) -> HubError {
    rejected(ScpErrorCode::PolicyViolation, message)
}

fn duplicate_payment() -> HubError {
    policy("paymentId already exists")
}

/// The hub's ticketing engine.
#[derive(Debug)]
pub struct HubService {
    signer: Arc<PrivateKeySigner>,
    hub_name: String,
    domain: ChannelDomain,
    default_asset: Address,
    fee: FeePolicy,
    store: Arc<HubStore>,
    ledger: Option<Arc<dyn SettlementLedger>>,
    webhooks: Arc<WebhookManager>,
    clock: Arc<dyn Clock>,
    channel_locks: DashMap<B256, Arc<Mutex<()>>>,
    sweep_interval: u64,
    last_sweep: AtomicU64,
    admin_token: Option<String>,
}

impl HubService {
    /// Creates a hub signing with `signer` on the settlement contract
    /// `contract` of `chain_id`. Storage is in memory until replaced.
    #[must_use]
    pub fn new(signer: PrivateKeySigner, chain_id: ChainId, contract: Address) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            signer: Arc::new(signer),
            hub_name: "pay.eth".to_owned(),
            domain: ChannelDomain::new(chain_id, contract),
            default_asset: NATIVE_ASSET,
            fee: FeePolicy::default(),
            store: Arc::new(HubStore::memory()),
            ledger: None,
            webhooks: Arc::new(WebhookManager::new(Arc::clone(&clock))),
            clock,
            channel_locks: DashMap::new(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            last_sweep: AtomicU64::new(0),
            admin_token: None,
        }
    }

    /// Sets the advertised hub name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.hub_name = name.into();
        self
    }

    /// Sets the primary asset. The native asset is always accepted too.
    #[must_use]
    pub fn with_default_asset(mut self, asset: Address) -> Self {
        self.default_asset = asset;
        self
    }

    /// Sets the fee policy.
    #[must_use]
    pub fn with_fee(mut self, fee: FeePolicy) -> Self {
        self.fee = fee;
        self
    }

    /// Uses `store` for quotes, payments and channels.
    #[must_use]
    pub fn with_store(mut self, store: Arc<HubStore>) -> Self {
        self.store = store;
        self
    }

    /// Enables on-chain verification of first-seen channels.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn SettlementLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Replaces the clock. Also rebuilds the webhook manager on that clock,
    /// so call this before [`Self::with_webhooks`].
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.webhooks = Arc::new(WebhookManager::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    /// Uses a prepared webhook manager.
    #[must_use]
    pub fn with_webhooks(mut self, webhooks: Arc<WebhookManager>) -> Self {
        self.webhooks = webhooks;
        self
    }

    /// Sets the minimum spacing of expired-quote sweeps, in seconds.
    #[must_use]
    pub fn with_sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval = secs.max(1);
        self
    }

    /// Enables the webhook and event endpoints behind `token`.
    #[must_use]
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into()).filter(|t| !t.is_empty());
        self
    }

    /// Checks a presented admin token.
    ///
    /// # Errors
    ///
    /// 403 when no admin token is configured, 401 when `presented` is
    /// missing or wrong.
    pub fn authorize_admin(&self, presented: Option<&str>) -> Result<(), HubError> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Err(HubError::rejected(
                StatusCode::FORBIDDEN,
                ScpErrorCode::Unauthorized,
                "admin endpoints disabled (set HUB_ADMIN_TOKEN)",
            ));
        };
        if presented != Some(expected) {
            return Err(HubError::rejected(
                StatusCode::UNAUTHORIZED,
                ScpErrorCode::Unauthorized,
                "admin auth required",
            ));
        }
        Ok(())
    }

    /// Hub signing address.
    #[must_use]
    pub fn address(&self) -> Address {
        SignerLike::address(&self.signer)
    }

    /// The webhook manager events are emitted through.
    #[must_use]
    pub const fn webhooks(&self) -> &Arc<WebhookManager> {
        &self.webhooks
    }

    /// `GET /.well-known/x402`.
    #[must_use]
    pub fn info(&self) -> HubInfo {
        HubInfo {
            hub_name: self.hub_name.clone(),
            address: self.address(),
            chain_id: self.domain.chain_id,
            schemes: vec![HUB_SCHEME.to_owned()],
            supported_assets: self.supported_assets(),
            modes: MODES.iter().map(|m| (*m).to_owned()).collect(),
            fee_policy: self.fee,
        }
    }

    fn supported_assets(&self) -> Vec<Address> {
        if self.default_asset == NATIVE_ASSET {
            vec![NATIVE_ASSET]
        } else {
            vec![self.default_asset, NATIVE_ASSET]
        }
    }

    /// Prices a payment and stores the quote.
    ///
    /// # Errors
    ///
    /// Rejects past expiries, unsupported assets, reused payment ids and
    /// fees above `maxFee`.
    pub async fn quote(&self, request: QuoteRequest) -> Result<Quote, HubError> {
        let now = self.clock.now();
        if request.quote_expiry <= now {
            return Err(HubError::bad_request("quoteExpiry must be future unix ts"));
        }
        if !self.supported_assets().contains(&request.asset) {
            return Err(HubError::rejected(
                StatusCode::BAD_REQUEST,
                ScpErrorCode::UnsupportedAsset,
                format!("unsupported asset {}", request.asset),
            ));
        }
        self.sweep_expired_quotes().await?;
        if self
            .store
            .read(|s| s.payments.contains_key(&request.payment_id))
            .await
        {
            return Err(duplicate_payment());
        }

        let fee = self
            .fee
            .compute(request.amount)
            .ok_or_else(|| HubError::bad_request("amount out of range"))?;
        if fee.fee > request.max_fee {
            return Err(HubError::rejected(
                StatusCode::BAD_REQUEST,
                ScpErrorCode::FeeExceedsMax,
                "fee > maxFee",
            ));
        }

        let expiry = request.quote_expiry.min(now + MAX_QUOTE_TTL_SECS);
        let draft = TicketDraft {
            ticket_id: ids::ticket_id(),
            hub: self.address(),
            payee: request.payee,
            invoice_id: request.invoice_id.clone(),
            payment_id: request.payment_id.clone(),
            asset: request.asset,
            amount: request.amount,
            fee_charged: fee.fee,
            total_debit: fee.total_debit,
            expiry,
            policy_hash: policy_hash(
                request.channel_id,
                self.domain.chain_id,
                request.payment_memo.as_deref().unwrap_or_default(),
            ),
        };
        let quote = Quote {
            invoice_id: request.invoice_id.clone(),
            payment_id: request.payment_id.clone(),
            ticket_draft: draft,
            fee: fee.fee,
            total_debit: fee.total_debit,
            expiry,
            fee_breakdown: fee.breakdown,
        };

        let stored = StoredQuote {
            quote: quote.clone(),
            channel_id: request.channel_id,
            context_hash: request.context_hash.unwrap_or_default(),
            created_at: now,
        };
        let payment_id = request.payment_id.clone();
        let inserted = self
            .store
            .tx(move |s| {
                if s.payments.contains_key(&payment_id) {
                    return false;
                }
                s.quotes.insert(
                    quote_key(&stored.quote.invoice_id, &payment_id),
                    stored,
                );
                s.payments.insert(
                    payment_id.clone(),
                    PaymentRecord::with_status(payment_id, PaymentStatus::Quoted),
                );
                true
            })
            .await?;
        if !inserted {
            return Err(duplicate_payment());
        }

        tracing::info!(
            payment_id = %request.payment_id,
            invoice_id = %request.invoice_id,
            channel_id = %request.channel_id,
            amount = %request.amount,
            fee = %quote.fee,
            "Quoted payment"
        );
        Ok(quote)
    }

    /// Validates a payer-signed state against its quote and issues the ticket.
    ///
    /// # Errors
    ///
    /// Returns a 409 [`HubError`] for any mismatch; 503 when a first-seen
    /// channel cannot be verified on-chain.
    pub async fn issue(&self, request: IssueRequest) -> Result<IssueResponse, HubError> {
        let IssueRequest {
            quote: submitted,
            channel_state: state,
            sig_a,
        } = request;
        let key = quote_key(&submitted.invoice_id, &submitted.payment_id);

        let lock = self.channel_lock(state.channel_id);
        let _guard = lock.lock().await;

        let stored = self
            .store
            .read(|s| s.quotes.get(&key).cloned())
            .await
            .ok_or_else(|| rejected(ScpErrorCode::QuoteExpired, "quote not found"))?;
        let quote = stored.quote;
        if submitted != quote {
            return Err(policy("quote mismatch"));
        }
        let now = self.clock.now();
        if quote.expiry < now {
            return Err(rejected(ScpErrorCode::QuoteExpired, "quote expired"));
        }
        if state.channel_id != stored.channel_id {
            return Err(policy("channel mismatch"));
        }
        if state.context_hash != stored.context_hash {
            return Err(policy("context hash mismatch"));
        }
        if state.state_expiry <= now {
            return Err(rejected(ScpErrorCode::StateExpired, "state expired"));
        }
        let payer = self
            .domain
            .recover_state_signer(&state, &sig_a)
            .map_err(|_| policy("invalid sigA"))?;
        let total = state
            .total()
            .ok_or_else(|| policy("channel balance overflow"))?;
        let debit = quote.total_debit.0;

        let existing = self
            .store
            .read(|s| s.channels.get(&state.channel_id).cloned())
            .await;
        match existing {
            Some(channel) => {
                let deposited = if channel.latest_state.total() == Some(total) {
                    None
                } else {
                    self.on_chain_total(state.channel_id).await
                };
                check_successor(&channel, &state, payer, total, debit, deposited)?;
            }
            None => {
                self.check_first_state(&state, payer, total, debit, now)
                    .await?;
            }
        }

        let ticket = sign_ticket(quote.ticket_draft.clone(), &self.signer).await?;
        let sig_b = self.domain.sign_state(&state, &self.signer).await?;
        let channel_ack = ChannelAck {
            state_nonce: state.state_nonce,
            state_hash: self.domain.state_hash(&state),
            sig_b: sig_b.clone(),
        };

        let issued = PaymentRecord {
            created_at: Some(now),
            invoice_id: Some(quote.invoice_id.clone()),
            ticket_id: Some(ticket.draft.ticket_id.clone()),
            state_nonce: Some(state.state_nonce),
            channel_id: Some(state.channel_id),
            payee: Some(ticket.draft.payee),
            asset: Some(ticket.draft.asset),
            amount: Some(ticket.draft.amount),
            fee: Some(ticket.draft.fee_charged),
            total_debit: Some(ticket.draft.total_debit),
            ..PaymentRecord::with_status(quote.payment_id.clone(), PaymentStatus::Issued)
        };
        let record = ChannelRecord {
            channel_id: state.channel_id,
            latest_nonce: state.state_nonce,
            status: "open".to_owned(),
            latest_state: state.clone(),
            participant_a: payer,
            sig_a,
            sig_b,
        };
        self.store
            .tx(|s| {
                s.quotes.remove(&key);
                s.payments.insert(quote.payment_id.clone(), issued);
                s.channels.insert(record.channel_id, record);
            })
            .await?;

        tracing::info!(
            payment_id = %quote.payment_id,
            ticket_id = %ticket.draft.ticket_id,
            channel_id = %state.channel_id,
            state_nonce = state.state_nonce,
            "Issued ticket"
        );
        self.emit_issue_events(&state, &ticket.draft).await;

        Ok(IssueResponse {
            ticket,
            channel_ack,
        })
    }

    async fn check_first_state(
        &self,
        state: &ChannelState,
        payer: Address,
        total: TokenAmount,
        debit: U256,
        now: UnixTimestamp,
    ) -> Result<(), HubError> {
        if state.state_nonce < 1 {
            return Err(rejected(
                ScpErrorCode::NonceConflict,
                "first stateNonce must be >= 1",
            ));
        }
        let Some(ledger) = &self.ledger else {
            return Err(HubError::rejected(
                StatusCode::SERVICE_UNAVAILABLE,
                ScpErrorCode::SettlementUnavailable,
                "on-chain verification required for first payment on a channel (set RPC_URL, CONTRACT_ADDRESS)",
            ));
        };
        let on_chain = ledger.get_channel(state.channel_id).await.map_err(|e| {
            rejected(
                ScpErrorCode::ChannelNotFound,
                format!("on-chain channel lookup failed: {e}"),
            )
        })?;
        check_against_chain(&on_chain, self.address(), state, payer, total, debit, now)
    }

    /// Deposited total of a channel, when a ledger can tell.
    async fn on_chain_total(&self, channel_id: B256) -> Option<TokenAmount> {
        let ledger = self.ledger.as_ref()?;
        match ledger.get_channel(channel_id).await {
            Ok(channel) if channel.exists() => Some(channel.total_balance),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(channel_id = %channel_id, error = %e, "On-chain total lookup failed");
                None
            }
        }
    }

    async fn emit_issue_events(&self, state: &ChannelState, draft: &TicketDraft) {
        self.webhooks
            .emit(
                EventKind::PaymentReceived,
                json!({
                    "channelId": state.channel_id,
                    "paymentId": draft.payment_id,
                    "ticketId": draft.ticket_id,
                    "payee": draft.payee,
                    "amount": draft.amount,
                    "asset": draft.asset,
                }),
            )
            .await;

        let bal_a = state.bal_a.0;
        let Some(total) = state.total().map(|t| t.0) else {
            return;
        };
        if total.is_zero() || bal_a.saturating_mul(U256::from(10)) >= total {
            return;
        }
        let pct = bal_a.saturating_mul(U256::from(100)) / total;
        self.webhooks
            .emit(
                EventKind::BalanceLow,
                json!({
                    "channelId": state.channel_id,
                    "balA": state.bal_a,
                    "totalBalance": TokenAmount(total),
                    "pctRemaining": u64::try_from(pct).unwrap_or(0),
                }),
            )
            .await;
    }

    /// `GET /v1/payments/{id}`.
    ///
    /// # Errors
    ///
    /// 404 when the payment id is unknown.
    pub async fn payment(&self, payment_id: &str) -> Result<PaymentRecord, HubError> {
        self.store
            .read(|s| s.payments.get(payment_id).cloned())
            .await
            .ok_or_else(|| HubError::not_found(ScpErrorCode::ChannelNotFound, "payment not found"))
    }

    /// `GET /v1/channels/{id}`. Unknown channels read as open at nonce 0.
    pub async fn channel(&self, channel_id: B256) -> ChannelView {
        self.store
            .read(|s| s.channels.get(&channel_id).map(ChannelRecord::view))
            .await
            .unwrap_or_else(|| ChannelView::unknown(channel_id))
    }

    /// `GET /v1/channels?payer=`: every channel whose payer is `payer`.
    pub async fn channels_by_payer(&self, payer: Address) -> Vec<ChannelView> {
        self.store
            .read(|s| {
                s.channels
                    .values()
                    .filter(|c| c.participant_a == payer)
                    .map(ChannelRecord::view)
                    .collect()
            })
            .await
    }

    /// Drops quotes past expiry and marks their payments expired. Runs at
    /// most once per sweep interval; returns how many quotes were dropped.
    ///
    /// # Errors
    ///
    /// Returns a store error if persisting fails.
    pub async fn sweep_expired_quotes(&self) -> Result<usize, HubError> {
        let now = self.clock.now().as_secs();
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.sweep_interval {
            return Ok(0);
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(0);
        }
        let pruned = self
            .store
            .tx(|s| {
                let expired: Vec<String> = s
                    .quotes
                    .iter()
                    .filter(|(_, q)| q.quote.expiry.as_secs() < now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &expired {
                    let Some(entry) = s.quotes.remove(key) else {
                        continue;
                    };
                    if let Some(payment) = s.payments.get_mut(&entry.quote.payment_id)
                        && payment.status == PaymentStatus::Quoted
                    {
                        payment.status = PaymentStatus::Expired;
                    }
                }
                expired.len()
            })
            .await?;
        if pruned > 0 {
            tracing::debug!(pruned, "Swept expired quotes");
        }
        Ok(pruned)
    }

    fn channel_lock(&self, channel_id: B256) -> Arc<Mutex<()>> {
        Arc::clone(&self.channel_locks.entry(channel_id).or_default())
    }
}

/// Checks a state against the hub's current head of a known channel.
///
/// The total may only grow, and only to the on-chain `deposited` total; the
/// growth is credited to the payer before the debit is applied.
fn check_successor(
    channel: &ChannelRecord,
    state: &ChannelState,
    payer: Address,
    total: TokenAmount,
    debit: U256,
    deposited: Option<TokenAmount>,
) -> Result<(), HubError> {
    if state.state_nonce != channel.latest_nonce.saturating_add(1) {
        return Err(rejected(
            ScpErrorCode::NonceConflict,
            "stateNonce must increase by 1",
        ));
    }
    if channel.participant_a != payer {
        return Err(policy("participantA mismatch"));
    }
    let prev = &channel.latest_state;
    let prev_total = prev
        .total()
        .ok_or_else(|| policy("channel balance overflow"))?;
    let topped_up = match deposited {
        _ if total == prev_total => U256::ZERO,
        Some(on_chain) if on_chain == total && total > prev_total => total.0 - prev_total.0,
        _ => return Err(policy("channel balance invariant violated")),
    };
    let paid = prev
        .bal_a
        .0
        .checked_add(topped_up)
        .and_then(|a| a.checked_sub(state.bal_a.0));
    let received = state.bal_b.0.checked_sub(prev.bal_b.0);
    if paid != Some(debit) || received != Some(debit) {
        return Err(policy("state delta must equal quote totalDebit"));
    }
    Ok(())
}

/// Checks the first state the hub sees on a channel against on-chain terms.
fn check_against_chain(
    on_chain: &OnChainChannel,
    hub: Address,
    state: &ChannelState,
    payer: Address,
    total: TokenAmount,
    debit: U256,
    now: UnixTimestamp,
) -> Result<(), HubError> {
    if !on_chain.exists() {
        return Err(rejected(
            ScpErrorCode::ChannelNotFound,
            "channel does not exist on-chain",
        ));
    }
    let expected_payer = if on_chain.participant_a == hub {
        on_chain.participant_b
    } else if on_chain.participant_b == hub {
        on_chain.participant_a
    } else {
        return Err(policy("hub is not a participant in this channel"));
    };
    if payer != expected_payer {
        return Err(policy(
            "sigA must recover to the non-hub channel participant",
        ));
    }
    if on_chain.is_closing {
        return Err(policy("channel is closing"));
    }
    let expiry = on_chain.channel_expiry;
    if expiry.as_secs() > 0 && expiry <= now {
        return Err(policy("channel expired on-chain"));
    }
    if total != on_chain.total_balance {
        return Err(policy(format!(
            "state balance total ({total}) != on-chain totalBalance ({})",
            on_chain.total_balance
        )));
    }
    let paid = on_chain.total_balance.0.checked_sub(state.bal_a.0);
    if paid != Some(debit) || state.bal_b.0 != debit {
        return Err(policy(
            "first state delta must equal quote totalDebit from full payer balance",
        ));
    }
    Ok(())
}
