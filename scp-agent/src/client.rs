//! The paying agent.
//!
//! [`AgentClient`] turns a 402 into a paid response:
//!
//! 1. discover offers and pick one ([`crate::offers`])
//! 2. find or fund the channel it is paid from ([`crate::funding`])
//! 3. sign the next channel state, through a hub quote/issue round trip
//!    for hub offers or directly for direct offers
//! 4. retry the request with a `PAYMENT-SIGNATURE` header
//!
//! Nonces advance one at a time per channel. The local copy of a channel is
//! only updated once the payee accepts; a hub that accepted a state the
//! payee then refused is caught up with before the next payment.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use alloy_signer_local::PrivateKeySigner;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use scp::UnixTimestamp;
use scp::amount::TokenAmount;
use scp::config::ConfigError;
use scp::hub_client::HubClient;
use scp::ids;
use scp::proto::{
    AccessGrant, ChannelProof, ChannelState, DirectEnvelope, DirectPayment, DirectTerms,
    HubPayment, HubTerms, IssueRequest, Offer, OfferTerms, PAYMENT_SIGNATURE_HEADER, PaidResponse,
    PaymentPayload, QuoteRequest, Receipt, Ticket,
};
use scp::timestamp::{Clock, SystemClock};
use scp_evm::ChannelDomain;
use scp_evm::ledger::{EvmLedger, OpenChannelParams, SettlementLedger};
use scp_evm::provider::RpcSelector;
use scp_evm::ticket::context_hash;
use tokio::sync::Mutex;

use crate::config::{AgentConfig, RoutePreference};
use crate::error::AgentError;
use crate::funding::FundingPlan;
use crate::offers::{self, Discovery, channel_key, score_offers};
use crate::store::{
    ChannelRecord, ChannelStore, FileChannelStore, HISTORY_LIMIT, MemoryChannelStore,
    PaymentEntry, direct_key, hub_key,
};

/// HTTP method bound into every state's context hash.
const PAID_METHOD: &str = "GET";

fn is_direct(offer: &Offer) -> bool {
    matches!(offer.terms, OfferTerms::Direct(_))
}

/// How a payment was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Through a hub ticket.
    Hub,
    /// Over a channel with the payee.
    Direct,
}

impl Route {
    /// Name used in the payment history.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Direct => "direct",
        }
    }
}

/// A payment the payee accepted.
#[derive(Debug, Clone)]
pub struct Payment {
    /// How it was routed.
    pub route: Route,
    /// Agent-minted payment id.
    pub payment_id: String,
    /// Invoice from the offer.
    pub invoice_id: String,
    /// Payee signing address.
    pub payee: Address,
    /// Price paid to the payee.
    pub amount: TokenAmount,
    /// Hub fee; zero for direct payments.
    pub fee: TokenAmount,
    /// The committed channel state.
    pub state: ChannelState,
    /// Hub ticket, for hub payments.
    pub ticket: Option<Ticket>,
    /// Status of the paid response.
    pub status: StatusCode,
    /// Raw response body.
    pub body: String,
}

impl Payment {
    /// The body as a paid response, if it is one.
    #[must_use]
    pub fn paid_response(&self) -> Option<PaidResponse> {
        serde_json::from_str(&self.body).ok()
    }

    /// The payee's receipt.
    #[must_use]
    pub fn receipt(&self) -> Option<Receipt> {
        self.paid_response().and_then(|r| r.receipt)
    }

    /// Pay-once grant minted with this payment.
    #[must_use]
    pub fn access(&self) -> Option<AccessGrant> {
        self.paid_response().and_then(|r| r.access)
    }
}

/// Result of [`AgentClient::pay_url`].
#[derive(Debug, Clone)]
pub enum PayOutcome {
    /// The resource was served without payment.
    NotRequired {
        /// Response status.
        status: StatusCode,
        /// Response body.
        body: String,
    },
    /// The payee accepted a payment.
    Paid(Box<Payment>),
}

/// A hub transfer made with [`AgentClient::pay_address`].
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Agent-minted payment id.
    pub payment_id: String,
    /// Hub-signed ticket naming the recipient.
    pub ticket: Ticket,
    /// The committed channel state.
    pub state: ChannelState,
}

/// The other side of a channel.
#[derive(Debug, Clone, Copy)]
enum Peer<'a> {
    Hub { client: &'a HubClient, address: Address },
    Direct { payee: Address },
}

impl Peer<'_> {
    fn key(&self) -> String {
        match self {
            Self::Hub { client, .. } => hub_key(client.endpoint()),
            Self::Direct { payee } => direct_key(*payee),
        }
    }

    const fn address(&self) -> Address {
        match self {
            Self::Hub { address, .. } => *address,
            Self::Direct { payee } => *payee,
        }
    }

    fn endpoint(&self) -> Option<String> {
        match self {
            Self::Hub { client, .. } => Some(client.endpoint().to_owned()),
            Self::Direct { .. } => None,
        }
    }
}

/// One priced request, independent of route.
#[derive(Debug)]
struct Order<'a> {
    url: &'a str,
    payment_id: String,
    invoice_id: &'a str,
    payee: Address,
    asset: Address,
    amount: TokenAmount,
}

/// A payer identity with its channels.
#[derive(Debug)]
pub struct AgentClient {
    signer: PrivateKeySigner,
    config: AgentConfig,
    domain: ChannelDomain,
    http: Client,
    store: Arc<dyn ChannelStore>,
    ledger: Option<Arc<dyn SettlementLedger>>,
    hubs: DashMap<String, Arc<HubClient>>,
    channel_locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl AgentClient {
    /// An agent with an in-memory store and no ledger.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Http`] if the HTTP client cannot be built.
    pub fn new(signer: PrivateKeySigner, config: AgentConfig) -> Result<Self, AgentError> {
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .map_err(|e| AgentError::Http {
                context: "Failed to build HTTP client",
                source: e,
            })?;
        let domain = ChannelDomain::new(config.chain_id(), config.contract());
        Ok(Self {
            signer,
            config,
            domain,
            http,
            store: Arc::new(MemoryChannelStore::new()),
            ledger: None,
            hubs: DashMap::new(),
            channel_locks: DashMap::new(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Builds an agent from its configuration: signing key, state file and
    /// an on-chain ledger on the first responsive RPC endpoint. The endpoint
    /// is re-selected whenever it fails, and while none answers the agent
    /// can still pay from funded channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or invalid or the state file
    /// cannot be opened.
    pub async fn from_config(config: AgentConfig) -> Result<Self, AgentError> {
        let signer: PrivateKeySigner = config
            .private_key()?
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid AGENT_PRIVATE_KEY: {e}")))?;
        let store: Arc<dyn ChannelStore> = match &config.state_path {
            Some(path) => Arc::new(FileChannelStore::open(path).await?),
            None => Arc::new(MemoryChannelStore::new()),
        };
        let selector = Arc::new(RpcSelector::new(config.chain_id(), config.rpc_url.clone()));
        if let Err(e) = selector.url().await {
            tracing::warn!(error = %e, "No responsive RPC yet; funding retries on first use");
        }
        let ledger: Arc<dyn SettlementLedger> = Arc::new(EvmLedger::with_selector(
            selector,
            signer.clone(),
            config.chain_id(),
            config.contract(),
        ));
        let mut agent = Self::new(signer, config)?.with_store(store);
        agent.ledger = Some(ledger);
        Ok(agent)
    }

    /// Replaces the channel store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ChannelStore>) -> Self {
        self.store = store;
        self
    }

    /// Enables opening and topping up channels.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn SettlementLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Replaces the clock used for expiries.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Payer address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Every cached channel with its key.
    pub async fn channels(&self) -> Vec<(String, ChannelRecord)> {
        self.store.all().await
    }

    /// Payment history, newest first.
    pub async fn history(&self, limit: usize) -> Vec<PaymentEntry> {
        self.store.history(limit.min(HISTORY_LIMIT)).await
    }

    fn hub(&self, endpoint: &str) -> Result<Arc<HubClient>, AgentError> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if let Some(hub) = self.hubs.get(endpoint) {
            return Ok(Arc::clone(hub.value()));
        }
        let hub = Arc::new(HubClient::new(endpoint)?.with_client(self.http.clone()));
        self.hubs.insert(endpoint.to_owned(), Arc::clone(&hub));
        Ok(hub)
    }

    /// Lock for a store key (`hub:`/`direct:`) or a channel id. Payments
    /// hold the key lock while resolving and funding the channel, then the
    /// channel lock while signing and committing the next state.
    fn channel_lock(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.channel_locks.entry(key.to_owned()).or_default().value())
    }

    /// Unpaid GET of `url`; see [`offers::discover`].
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] on transport failure or an unusable 402.
    pub async fn discover_offers(&self, url: &str) -> Result<Discovery, AgentError> {
        offers::discover(&self.http, url).await
    }

    /// Picks the offer to pay under the configured network, asset allowlist
    /// and route preference.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NoCompatibleOffer`] when nothing qualifies, or
    /// [`AgentError::NoAffordableOffer`] when competing hubs were offered
    /// and the wallet can fund none of them.
    pub async fn choose_offer(&self, offers: &[Offer]) -> Result<Offer, AgentError> {
        let eligible: Vec<Offer> = offers
            .iter()
            .filter(|o| self.config.allows_asset(o.asset))
            .cloned()
            .collect();
        let eligible = self.affordable(eligible).await?;
        let mut balances = Vec::with_capacity(eligible.len());
        for offer in &eligible {
            balances.push(self.store.get(&channel_key(offer)).await.map(|r| r.bal_a));
        }
        let scored = score_offers(&eligible, &self.config.network, &balances);
        offers::choose_offer(&scored, self.config.route)
            .cloned()
            .ok_or_else(|| AgentError::NoCompatibleOffer {
                network: self.config.network.clone(),
                route: self.config.route.to_string(),
            })
    }

    /// With two or more hub offers and no channel to any of them yet, drops
    /// the hubs whose first funding the wallet cannot cover. Direct offers
    /// are kept; if they are all that remain under a hub-only route, or
    /// there are none, the payment fails here instead of at funding time.
    async fn affordable(&self, eligible: Vec<Offer>) -> Result<Vec<Offer>, AgentError> {
        if self.config.route == RoutePreference::Direct {
            return Ok(eligible);
        }
        let Some(ledger) = self.ledger.as_deref() else {
            return Ok(eligible);
        };
        let hubs: Vec<&Offer> = eligible.iter().filter(|o| !is_direct(o)).collect();
        if hubs.len() < 2 {
            return Ok(eligible);
        }
        for offer in &hubs {
            if self.store.get(&channel_key(offer)).await.is_some() {
                return Ok(eligible);
            }
        }

        let mut affordable = Vec::new();
        let mut reasons = Vec::new();
        for offer in hubs {
            match self.hub_shortfall(ledger, offer).await {
                Ok(()) => affordable.push(channel_key(offer)),
                Err(reason) => {
                    tracing::debug!(key = %channel_key(offer), %reason, "Hub offer not affordable");
                    reasons.push(reason);
                }
            }
        }
        if affordable.is_empty()
            && (self.config.route == RoutePreference::Hub || !eligible.iter().any(is_direct))
        {
            let reason = reasons
                .into_iter()
                .next()
                .unwrap_or_else(|| "wallet balance too low".to_owned());
            return Err(AgentError::NoAffordableOffer(reason));
        }
        Ok(eligible
            .into_iter()
            .filter(|o| is_direct(o) || affordable.contains(&channel_key(o)))
            .collect())
    }

    /// `Ok` when the wallet holds enough to open a channel for `offer`.
    async fn hub_shortfall(&self, ledger: &dyn SettlementLedger, offer: &Offer) -> Result<(), String> {
        let OfferTerms::Hub(terms) = &offer.terms else {
            return Ok(());
        };
        let hub = self.hub(&terms.hub_endpoint).map_err(|e| e.to_string())?;
        let info = hub.info().await.map_err(|e| e.to_string())?;
        let per_pay = self
            .hub_debit(&info.fee_policy, offer.max_amount_required)
            .map_err(|e| e.to_string())?;
        let need = self.plan(per_pay, None).needed;
        let have = TokenAmount::from(
            ledger
                .wallet_balance(self.address(), offer.asset)
                .await
                .map_err(|e| e.to_string())?,
        );
        if have < need {
            return Err(format!("insufficient wallet balance (need {need}, have {have})"));
        }
        Ok(())
    }

    /// Funding plan for paying `offer` once, including the hub's fee.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Hub`] if the hub's fee policy cannot be read.
    pub async fn analyze_offer(&self, offer: &Offer) -> Result<FundingPlan, AgentError> {
        let amount = offer.max_amount_required;
        let (per_pay, balance) = match &offer.terms {
            OfferTerms::Hub(terms) => {
                let hub = self.hub(&terms.hub_endpoint)?;
                let info = hub.info().await?;
                let per_pay = self.hub_debit(&info.fee_policy, amount)?;
                let record = self.hydrate(&hub, info.address).await?;
                (per_pay, record.map(|r| r.bal_a))
            }
            OfferTerms::Direct(terms) => (
                amount,
                self.store
                    .get(&direct_key(terms.payee_address))
                    .await
                    .map(|r| r.bal_a),
            ),
        };
        Ok(self.plan(per_pay, balance))
    }

    fn plan(&self, per_pay: TokenAmount, balance: Option<TokenAmount>) -> FundingPlan {
        FundingPlan::compute(
            per_pay,
            balance,
            self.config.topup_payments,
            self.config.low_water_payments,
        )
    }

    fn hub_debit(
        &self,
        policy: &scp::fee::FeePolicy,
        amount: TokenAmount,
    ) -> Result<TokenAmount, AgentError> {
        let quote = policy
            .compute(amount)
            .ok_or(AgentError::HubMismatch("fee overflows for amount"))?;
        if quote.fee > self.config.max_fee {
            tracing::warn!(fee = %quote.fee, max_fee = %self.config.max_fee, "Hub fee above max_fee");
        }
        Ok(quote.total_debit)
    }

    /// Opens or tops up the channel `offer` would be paid from, as the
    /// funding plan requires.
    ///
    /// # Errors
    ///
    /// Returns an error if funding is needed and fails.
    pub async fn ensure_channel_for_offer(&self, offer: &Offer) -> Result<ChannelRecord, AgentError> {
        let amount = offer.max_amount_required;
        match &offer.terms {
            OfferTerms::Hub(terms) => {
                let hub = self.hub(&terms.hub_endpoint)?;
                let info = hub.info().await?;
                let per_pay = self.hub_debit(&info.fee_policy, amount)?;
                let peer = Peer::Hub {
                    client: &hub,
                    address: info.address,
                };
                let lock = self.channel_lock(&peer.key());
                let _guard = lock.lock().await;
                self.prepare_channel(peer, offer.asset, per_pay).await
            }
            OfferTerms::Direct(terms) => {
                let peer = Peer::Direct {
                    payee: terms.payee_address,
                };
                let lock = self.channel_lock(&peer.key());
                let _guard = lock.lock().await;
                self.prepare_channel(peer, offer.asset, amount).await
            }
        }
    }

    /// Finds the channel with the hub at `endpoint`.
    ///
    /// Looks, in order, at the local cache (including entries for the same
    /// hub under another endpoint), the hub's channel listing for this payer
    /// and `ChannelOpened` logs on-chain. A hit is cached under the
    /// endpoint's key.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub cannot describe itself or a ledger query
    /// fails.
    pub async fn hydrate_hub_channel(
        &self,
        endpoint: &str,
    ) -> Result<Option<ChannelRecord>, AgentError> {
        let hub = self.hub(endpoint)?;
        let info = hub.info().await?;
        self.hydrate(&hub, info.address).await
    }

    async fn hydrate(
        &self,
        hub: &HubClient,
        hub_address: Address,
    ) -> Result<Option<ChannelRecord>, AgentError> {
        let key = hub_key(hub.endpoint());
        if let Some(record) = self.store.get(&key).await {
            return Ok(Some(record));
        }
        let endpoint = hub.endpoint().to_owned();

        let alias = self.store.all().await.into_iter().find(|(k, r)| {
            k.starts_with("hub:")
                && (r.counterparty == Some(hub_address)
                    || r.endpoint.as_deref().map(|e| e.trim_end_matches('/'))
                        == Some(endpoint.as_str()))
        });
        if let Some((alias_key, mut record)) = alias {
            tracing::debug!(from = %alias_key, to = %key, "Aliasing cached hub channel");
            record.endpoint = Some(endpoint);
            self.store.put(&key, record.clone()).await?;
            return Ok(Some(record));
        }

        match hub.channels_by_payer(self.address()).await {
            Ok(list) => {
                let newest = list
                    .channels
                    .into_iter()
                    .filter(|v| v.latest_state.is_some())
                    .max_by_key(|v| v.latest_nonce);
                if let Some(view) = newest
                    && let Some(state) = view.latest_state
                {
                    let record = ChannelRecord {
                        channel_id: view.channel_id,
                        counterparty: Some(hub_address),
                        asset: None,
                        nonce: state.state_nonce,
                        bal_a: state.bal_a,
                        bal_b: state.bal_b,
                        endpoint: Some(endpoint),
                    };
                    tracing::info!(channel_id = %record.channel_id, nonce = record.nonce, "Recovered channel from hub listing");
                    self.store.put(&key, record.clone()).await?;
                    return Ok(Some(record));
                }
            }
            Err(e) => tracing::debug!(error = %e, "Hub channel listing unavailable"),
        }

        let Some(ledger) = &self.ledger else {
            return Ok(None);
        };
        let Some(channel_id) = ledger.find_channel_opened(self.address(), hub_address).await? else {
            return Ok(None);
        };
        let on_chain = ledger.get_channel(channel_id).await?;
        if !on_chain.exists() || on_chain.is_closing {
            return Ok(None);
        }
        let mut record =
            ChannelRecord::opened(channel_id, hub_address, on_chain.asset, on_chain.total_balance);
        record.endpoint = Some(endpoint);
        if let Ok(view) = hub.channel(channel_id).await
            && let Some(state) = view.latest_state
        {
            record.nonce = state.state_nonce;
            record.bal_a = state.bal_a;
            record.bal_b = state.bal_b;
        }
        tracing::info!(channel_id = %channel_id, nonce = record.nonce, "Recovered channel from chain logs");
        self.store.put(&key, record.clone()).await?;
        Ok(Some(record))
    }

    /// Adopts the hub's head when it is ahead of the local copy. Deposits
    /// made since that head are kept.
    async fn reconcile(&self, hub: &HubClient, record: &mut ChannelRecord) {
        let view = match hub.channel(record.channel_id).await {
            Ok(view) => view,
            Err(e) => {
                tracing::debug!(channel_id = %record.channel_id, error = %e, "Hub channel lookup failed");
                return;
            }
        };
        let Some(state) = view.latest_state else {
            return;
        };
        if state.channel_id != record.channel_id || state.state_nonce <= record.nonce {
            return;
        }
        let local_total = record.bal_a.0.saturating_add(record.bal_b.0);
        let hub_total = state.total().map_or(local_total, |t| t.0);
        let topped_up = local_total.saturating_sub(hub_total);
        tracing::info!(
            channel_id = %record.channel_id,
            local_nonce = record.nonce,
            hub_nonce = state.state_nonce,
            "Catching up with hub channel state"
        );
        record.nonce = state.state_nonce;
        record.bal_a = TokenAmount(state.bal_a.0.saturating_add(topped_up));
        record.bal_b = state.bal_b;
    }

    /// Resolves, reconciles and if needed funds the channel with `peer`.
    /// Caller holds the channel lock.
    async fn prepare_channel(
        &self,
        peer: Peer<'_>,
        asset: Address,
        per_pay: TokenAmount,
    ) -> Result<ChannelRecord, AgentError> {
        let key = peer.key();
        let mut record = match peer {
            Peer::Hub { client, address } => self.hydrate(client, address).await?,
            Peer::Direct { .. } => self.store.get(&key).await,
        };
        if let (Peer::Hub { client, .. }, Some(r)) = (peer, record.as_mut()) {
            self.reconcile(client, r).await;
        }

        let plan = self.plan(per_pay, record.as_ref().map(|r| r.bal_a));
        if !plan.needs_action() {
            return record.ok_or_else(|| AgentError::NoChannel(key));
        }
        let covers = record.as_ref().is_some_and(|r| r.bal_a >= per_pay);
        let Some(ledger) = &self.ledger else {
            return match record {
                Some(r) if covers => {
                    tracing::warn!(key, balance = %r.bal_a, "Channel below refill level and no ledger to top up");
                    Ok(r)
                }
                Some(r) => Err(AgentError::InsufficientBalance {
                    need: per_pay,
                    have: r.bal_a,
                }),
                None => Err(AgentError::NoLedger),
            };
        };
        match self.fund(ledger.as_ref(), peer, asset, record.clone(), &plan).await {
            Ok(funded) => Ok(funded),
            Err(e) if covers => {
                tracing::warn!(key, error = %e, "Top-up failed; paying from current balance");
                record.ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn fund(
        &self,
        ledger: &dyn SettlementLedger,
        peer: Peer<'_>,
        asset: Address,
        record: Option<ChannelRecord>,
        plan: &FundingPlan,
    ) -> Result<ChannelRecord, AgentError> {
        let key = peer.key();
        let amount = plan.needed;
        let record = match record {
            None => {
                ledger.ensure_allowance(asset, amount.0).await?;
                let channel_expiry = self.clock.now() + self.config.channel_expiry_sec;
                let channel_id = ledger
                    .open_channel(OpenChannelParams {
                        peer: peer.address(),
                        asset,
                        amount: amount.0,
                        challenge_period_sec: self.config.challenge_period_sec,
                        channel_expiry: channel_expiry.as_secs(),
                        salt: ids::channel_salt(),
                    })
                    .await?;
                tracing::info!(%channel_id, peer = %peer.address(), %amount, "Opened channel");
                let mut record = ChannelRecord::opened(channel_id, peer.address(), asset, amount);
                record.endpoint = peer.endpoint();
                record
            }
            Some(mut record) => {
                let asset = record.asset.unwrap_or(asset);
                ledger.ensure_allowance(asset, amount.0).await?;
                let tx = ledger.deposit(record.channel_id, asset, amount.0).await?;
                tracing::info!(channel_id = %record.channel_id, %tx, %amount, "Topped up channel");
                record.bal_a = TokenAmount(record.bal_a.0.saturating_add(amount.0));
                record
            }
        };
        self.store.put(&key, record.clone()).await?;
        Ok(record)
    }

    /// Pays for `url`: discover, choose, fund, sign, present.
    ///
    /// Every attempt past offer selection lands in the history, failed or
    /// not.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] describing the first failed step. Local
    /// channel state is unchanged on error.
    pub async fn pay_url(&self, url: &str) -> Result<PayOutcome, AgentError> {
        let offers = match self.discover_offers(url).await? {
            Discovery::NotRequired { status, body } => {
                return Ok(PayOutcome::NotRequired { status, body });
            }
            Discovery::Offers(offers) => offers,
        };
        let offer = self.choose_offer(&offers).await?;
        self.pay_offer(url, &offer).await.map(|p| PayOutcome::Paid(Box::new(p)))
    }

    /// Pays `offer` for `url`, skipping discovery.
    ///
    /// # Errors
    ///
    /// Same as [`Self::pay_url`].
    pub async fn pay_offer(&self, url: &str, offer: &Offer) -> Result<Payment, AgentError> {
        let order = Order {
            url,
            payment_id: ids::payment_id(),
            invoice_id: offer.invoice_id(),
            payee: offer.payee_address(),
            asset: offer.asset,
            amount: offer.max_amount_required,
        };
        let route = match offer.terms {
            OfferTerms::Hub(_) => Route::Hub,
            OfferTerms::Direct(_) => Route::Direct,
        };
        let result = if order.amount > self.config.max_amount {
            Err(AgentError::AmountExceedsMax {
                amount: order.amount,
                max: self.config.max_amount,
            })
        } else {
            match &offer.terms {
                OfferTerms::Hub(terms) => self.pay_hub(&order, terms).await,
                OfferTerms::Direct(terms) => self.pay_direct(&order, terms).await,
            }
        };
        self.record(&order, route, &result).await;
        result
    }

    async fn record(&self, order: &Order<'_>, route: Route, result: &Result<Payment, AgentError>) {
        let mut entry = PaymentEntry {
            payment_id: order.payment_id.clone(),
            route: route.as_str().to_owned(),
            resource: order.url.to_owned(),
            invoice_id: order.invoice_id.to_owned(),
            payee: order.payee,
            amount: order.amount,
            fee: TokenAmount::ZERO,
            ok: result.is_ok(),
            error: None,
            receipt_id: None,
            ticket_id: None,
            paid_at: self.clock.now(),
        };
        match result {
            Ok(payment) => {
                entry.fee = payment.fee;
                entry.receipt_id = payment.receipt().map(|r| r.receipt_id);
                entry.ticket_id = payment.ticket.as_ref().map(|t| t.draft.ticket_id.clone());
            }
            Err(e) => entry.error = Some(e.to_string()),
        }
        if let Err(e) = self.store.record_payment(entry).await {
            tracing::warn!(error = %e, "Failed to record payment history");
        }
    }

    async fn pay_hub(&self, order: &Order<'_>, terms: &HubTerms) -> Result<Payment, AgentError> {
        let hub = self.hub(&terms.hub_endpoint)?;
        let info = hub.info().await?;
        let per_pay = self.hub_debit(&info.fee_policy, order.amount)?;
        let peer = Peer::Hub {
            client: &hub,
            address: info.address,
        };
        let key = peer.key();
        let lock = self.channel_lock(&key);
        let _guard = lock.lock().await;

        let record = self.prepare_channel(peer, order.asset, per_pay).await?;
        let channel_lock = self.channel_lock(&channel_lock_key(record.channel_id));
        let _channel = channel_lock.lock().await;
        let record = self.freshest(record).await;
        let now = self.clock.now();
        let context = context_hash(order.payee, PAID_METHOD, &order.payment_id, order.invoice_id);
        let quote = hub
            .quote(&QuoteRequest {
                invoice_id: order.invoice_id.to_owned(),
                payment_id: order.payment_id.clone(),
                channel_id: record.channel_id,
                payee: order.payee,
                asset: order.asset,
                amount: order.amount,
                max_fee: self.config.max_fee,
                quote_expiry: now + self.config.quote_ttl_sec,
                context_hash: Some(context),
                payment_memo: None,
            })
            .await?;
        let draft = &quote.ticket_draft;
        if quote.payment_id != order.payment_id
            || draft.payee != order.payee
            || draft.amount != order.amount
            || draft.asset != order.asset
        {
            return Err(AgentError::HubMismatch("quote does not match the request"));
        }

        let state = self.next_state(&record, quote.total_debit, context, now)?;
        let sig_a = self.domain.sign_state(&state, &self.signer).await?;
        let issued = hub
            .issue(&IssueRequest {
                quote: quote.clone(),
                channel_state: state.clone(),
                sig_a: sig_a.clone(),
            })
            .await?;
        if issued.channel_ack.state_hash != self.domain.state_hash(&state) {
            return Err(AgentError::HubMismatch("channel ack does not match the signed state"));
        }

        let payload = PaymentPayload::Hub(HubPayment {
            payment_id: order.payment_id.clone(),
            invoice_id: order.invoice_id.to_owned(),
            ticket: issued.ticket.clone(),
            channel_proof: ChannelProof {
                channel_id: Some(state.channel_id),
                state_nonce: Some(state.state_nonce),
                state_hash: Some(issued.channel_ack.state_hash),
                sig_a: Some(sig_a),
                channel_state: Some(state.clone()),
            },
        });
        let (status, body) = self.present(order.url, &payload).await?;
        self.commit(&key, record, &state).await?;
        tracing::info!(
            payment_id = %order.payment_id,
            channel_id = %state.channel_id,
            nonce = state.state_nonce,
            fee = %quote.fee,
            "Paid through hub"
        );
        Ok(Payment {
            route: Route::Hub,
            payment_id: order.payment_id.clone(),
            invoice_id: order.invoice_id.to_owned(),
            payee: order.payee,
            amount: order.amount,
            fee: quote.fee,
            state,
            ticket: Some(issued.ticket),
            status,
            body,
        })
    }

    async fn pay_direct(&self, order: &Order<'_>, terms: &DirectTerms) -> Result<Payment, AgentError> {
        let peer = Peer::Direct {
            payee: terms.payee_address,
        };
        let key = peer.key();
        let lock = self.channel_lock(&key);
        let _guard = lock.lock().await;

        let record = self.prepare_channel(peer, order.asset, order.amount).await?;
        let channel_lock = self.channel_lock(&channel_lock_key(record.channel_id));
        let _channel = channel_lock.lock().await;
        let record = self.freshest(record).await;
        let now = self.clock.now();
        let context = context_hash(order.payee, PAID_METHOD, &order.payment_id, order.invoice_id);
        let state = self.next_state(&record, order.amount, context, now)?;
        let sig_a = self.domain.sign_state(&state, &self.signer).await?;
        let payload = PaymentPayload::Direct(DirectEnvelope {
            payment_id: order.payment_id.clone(),
            invoice_id: order.invoice_id.to_owned(),
            direct: DirectPayment {
                payer: self.address(),
                payee: order.payee,
                asset: order.asset,
                amount: order.amount,
                expiry: now + self.config.quote_ttl_sec,
                invoice_id: order.invoice_id.to_owned(),
                payment_id: order.payment_id.clone(),
                channel_state: state.clone(),
                sig_a,
            },
        });
        let (status, body) = self.present(order.url, &payload).await?;
        self.commit(&key, record, &state).await?;
        tracing::info!(
            payment_id = %order.payment_id,
            channel_id = %state.channel_id,
            nonce = state.state_nonce,
            "Paid directly"
        );
        Ok(Payment {
            route: Route::Direct,
            payment_id: order.payment_id.clone(),
            invoice_id: order.invoice_id.to_owned(),
            payee: order.payee,
            amount: order.amount,
            fee: TokenAmount::ZERO,
            state,
            ticket: None,
            status,
            body,
        })
    }

    /// Sends `amount` to `payee` through the hub at `hub_endpoint` with no
    /// resource attached. The hub's ticket is the proof of payment.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] describing the first failed step.
    pub async fn pay_address(
        &self,
        hub_endpoint: &str,
        payee: Address,
        asset: Address,
        amount: TokenAmount,
    ) -> Result<Transfer, AgentError> {
        let hub = self.hub(hub_endpoint)?;
        let info = hub.info().await?;
        let per_pay = self.hub_debit(&info.fee_policy, amount)?;
        let peer = Peer::Hub {
            client: &hub,
            address: info.address,
        };
        let key = peer.key();
        let lock = self.channel_lock(&key);
        let _guard = lock.lock().await;

        let record = self.prepare_channel(peer, asset, per_pay).await?;
        let channel_lock = self.channel_lock(&channel_lock_key(record.channel_id));
        let _channel = channel_lock.lock().await;
        let record = self.freshest(record).await;
        let now = self.clock.now();
        let payment_id = ids::payment_id();
        let invoice_id = ids::invoice_id();
        let quote = hub
            .quote(&QuoteRequest {
                invoice_id: invoice_id.clone(),
                payment_id: payment_id.clone(),
                channel_id: record.channel_id,
                payee,
                asset,
                amount,
                max_fee: self.config.max_fee,
                quote_expiry: now + self.config.quote_ttl_sec,
                context_hash: None,
                payment_memo: None,
            })
            .await?;
        if quote.ticket_draft.amount != amount || quote.ticket_draft.payee != payee {
            return Err(AgentError::HubMismatch("quote does not match the request"));
        }
        let state = self.next_state(&record, quote.total_debit, B256::ZERO, now)?;
        let sig_a = self.domain.sign_state(&state, &self.signer).await?;
        let issued = hub
            .issue(&IssueRequest {
                quote: quote.clone(),
                channel_state: state.clone(),
                sig_a,
            })
            .await;
        let entry = PaymentEntry {
            payment_id: payment_id.clone(),
            route: Route::Hub.as_str().to_owned(),
            resource: payee.to_string(),
            invoice_id,
            payee,
            amount,
            fee: quote.fee,
            ok: issued.is_ok(),
            error: issued.as_ref().err().map(ToString::to_string),
            receipt_id: None,
            ticket_id: issued.as_ref().ok().map(|r| r.ticket.draft.ticket_id.clone()),
            paid_at: now,
        };
        if let Err(e) = self.store.record_payment(entry).await {
            tracing::warn!(error = %e, "Failed to record payment history");
        }
        let issued = issued?;
        self.commit(&key, record, &state).await?;
        Ok(Transfer {
            payment_id,
            ticket: issued.ticket,
            state,
        })
    }

    /// The state after moving `debit` from the payer to the counterparty.
    fn next_state(
        &self,
        record: &ChannelRecord,
        debit: TokenAmount,
        context_hash: B256,
        now: UnixTimestamp,
    ) -> Result<ChannelState, AgentError> {
        let insufficient = || AgentError::InsufficientBalance {
            need: debit,
            have: record.bal_a,
        };
        let bal_a = record.bal_a.0.checked_sub(debit.0).ok_or_else(insufficient)?;
        let bal_b = record.bal_b.0.checked_add(debit.0).ok_or_else(insufficient)?;
        Ok(ChannelState {
            channel_id: record.channel_id,
            state_nonce: record.nonce + 1,
            bal_a: TokenAmount(bal_a),
            bal_b: TokenAmount(bal_b),
            locks_root: B256::ZERO,
            state_expiry: now + self.config.quote_ttl_sec,
            context_hash,
        })
    }

    /// Retries `url` with the payment header. Anything but a 2xx is a
    /// rejection.
    async fn present(
        &self,
        url: &str,
        payload: &PaymentPayload,
    ) -> Result<(StatusCode, String), AgentError> {
        let header = serde_json::to_string(payload)?;
        let response = self
            .http
            .get(url)
            .header(PAYMENT_SIGNATURE_HEADER, header)
            .send()
            .await
            .map_err(|e| AgentError::Http {
                context: "Paid request failed",
                source: e,
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| AgentError::Http {
            context: "Failed to read paid response",
            source: e,
        })?;
        if !status.is_success() {
            tracing::warn!(payment_id = payload.payment_id(), %status, "Payee rejected payment");
            return Err(AgentError::PayeeRejected { status, body });
        }
        Ok((status, body))
    }

    /// The newest cached copy of `record`'s channel. Another key can hold
    /// the same channel, e.g. one hub reached through two endpoints.
    async fn freshest(&self, record: ChannelRecord) -> ChannelRecord {
        self.store
            .all()
            .await
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.channel_id == record.channel_id && r.nonce > record.nonce)
            .max_by_key(|r| r.nonce)
            .unwrap_or(record)
    }

    /// Stores `state` under `key` and every other key caching the channel.
    async fn commit(
        &self,
        key: &str,
        mut record: ChannelRecord,
        state: &ChannelState,
    ) -> Result<(), AgentError> {
        for (alias, mut cached) in self.store.all().await {
            if alias != key && cached.channel_id == state.channel_id {
                cached.nonce = state.state_nonce;
                cached.bal_a = state.bal_a;
                cached.bal_b = state.bal_b;
                self.store.put(&alias, cached).await?;
            }
        }
        record.nonce = state.state_nonce;
        record.bal_a = state.bal_a;
        record.bal_b = state.bal_b;
        self.store.put(key, record).await?;
        Ok(())
    }
}

fn channel_lock_key(channel_id: B256) -> String {
    format!("channel:{channel_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, TxHash, U256, address};
    use async_trait::async_trait;
    use scp::fee::FeePolicy;
    use scp::networks::{BASE_MAINNET, CANONICAL_CONTRACT, ChainId};
    use scp::proto::{
        ChannelAck, ChannelList, ChannelView, HubInfo, IssueResponse, PaymentChallenge, Quote,
        TicketDraft,
    };
    use scp::timestamp::ManualClock;
    use scp_evm::ledger::{LedgerError, OnChainChannel};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const NOW: u64 = 1_700_000_000;
    const HUB: Address = address!("4444444444444444444444444444444444444444");
    const PAYEE: Address = address!("3333333333333333333333333333333333333333");
    const ASSET: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
    const OPENED: B256 = B256::repeat_byte(0xc1);
    const PRICE: u64 = 1_000;
    /// 1000 + 10 + 1000 * 30 / 10000
    const HUB_DEBIT: u64 = 1_013;

    #[derive(Debug, Default)]
    struct FakeLedger {
        opened: StdMutex<Vec<OpenChannelParams>>,
        deposits: StdMutex<Vec<(B256, U256)>>,
        logged: Option<B256>,
        on_chain: Option<OnChainChannel>,
        fail_writes: bool,
        wallet: U256,
    }

    #[async_trait]
    impl SettlementLedger for FakeLedger {
        fn chain_id(&self) -> ChainId {
            BASE_MAINNET
        }
        fn contract(&self) -> Address {
            CANONICAL_CONTRACT
        }
        async fn get_channel(&self, _: B256) -> Result<OnChainChannel, LedgerError> {
            self.on_chain.clone().ok_or(LedgerError::Timeout("getChannel"))
        }
        async fn ensure_allowance(&self, _: Address, _: U256) -> Result<(), LedgerError> {
            Ok(())
        }
        async fn open_channel(&self, params: OpenChannelParams) -> Result<B256, LedgerError> {
            if self.fail_writes {
                return Err(LedgerError::Timeout("openChannel"));
            }
            self.opened.lock().unwrap().push(params);
            Ok(OPENED)
        }
        async fn deposit(&self, id: B256, _: Address, amount: U256) -> Result<TxHash, LedgerError> {
            if self.fail_writes {
                return Err(LedgerError::Timeout("deposit"));
            }
            self.deposits.lock().unwrap().push((id, amount));
            Ok(TxHash::repeat_byte(0xdd))
        }
        async fn find_channel_opened(&self, _: Address, _: Address) -> Result<Option<B256>, LedgerError> {
            Ok(self.logged)
        }
        async fn wallet_balance(&self, _: Address, _: Address) -> Result<U256, LedgerError> {
            Ok(self.wallet)
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            network: "base".to_owned(),
            ..AgentConfig::default()
        }
    }

    fn agent(config: AgentConfig) -> AgentClient {
        AgentClient::new(PrivateKeySigner::random(), config)
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(NOW)))
    }

    fn domain() -> ChannelDomain {
        ChannelDomain::new(BASE_MAINNET, CANONICAL_CONTRACT)
    }

    fn hub_offer(resource: &str, hub: &str) -> Offer {
        Offer {
            network: "eip155:8453".to_owned(),
            asset: ASSET,
            max_amount_required: TokenAmount::from(PRICE),
            pay_to: "pay.eth".to_owned(),
            resource: resource.to_owned(),
            terms: OfferTerms::Hub(HubTerms {
                hub_name: "pay.eth".to_owned(),
                hub_endpoint: hub.to_owned(),
                mode: "proxy_hold".to_owned(),
                fee_model: Some(FeePolicy::default()),
                quote_expiry: UnixTimestamp::from_secs(NOW + 120),
                invoice_id: "inv_hub".to_owned(),
                payee_address: PAYEE,
            }),
        }
    }

    fn direct_offer(resource: &str, amount: u64) -> Offer {
        Offer {
            network: "eip155:8453".to_owned(),
            asset: ASSET,
            max_amount_required: TokenAmount::from(amount),
            pay_to: PAYEE.to_string(),
            resource: resource.to_owned(),
            terms: OfferTerms::Direct(DirectTerms {
                mode: "direct".to_owned(),
                quote_expiry: UnixTimestamp::from_secs(NOW + 120),
                invoice_id: "inv_direct".to_owned(),
                payee_address: PAYEE,
            }),
        }
    }

    fn record(bal_a: u64, bal_b: u64, nonce: u64) -> ChannelRecord {
        ChannelRecord {
            channel_id: OPENED,
            counterparty: Some(PAYEE),
            asset: Some(ASSET),
            nonce,
            bal_a: TokenAmount::from(bal_a),
            bal_b: TokenAmount::from(bal_b),
            endpoint: None,
        }
    }

    async fn mount_hub_info(server: &MockServer, fee_policy: FeePolicy) {
        let info = HubInfo {
            hub_name: "pay.eth".to_owned(),
            address: HUB,
            chain_id: BASE_MAINNET,
            schemes: vec!["statechannel-hub-v1".to_owned()],
            supported_assets: vec![ASSET],
            modes: vec!["proxy_hold".to_owned()],
            fee_policy,
        };
        Mock::given(method("GET"))
            .and(path("/.well-known/x402"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&info))
            .mount(server)
            .await;
    }

    /// Answers quotes and issues like a hub would, without signatures.
    async fn mount_hub(server: &MockServer) {
        mount_hub_info(server, FeePolicy::default()).await;
        Mock::given(method("POST"))
            .and(path("/v1/tickets/quote"))
            .respond_with(|req: &Request| {
                let request: QuoteRequest = serde_json::from_slice(&req.body).unwrap();
                let fee = FeePolicy::default().compute(request.amount).unwrap();
                let quote = Quote {
                    invoice_id: request.invoice_id.clone(),
                    payment_id: request.payment_id.clone(),
                    ticket_draft: TicketDraft {
                        ticket_id: "tkt_00112233445566778899".to_owned(),
                        hub: HUB,
                        payee: request.payee,
                        invoice_id: request.invoice_id,
                        payment_id: request.payment_id,
                        asset: request.asset,
                        amount: request.amount,
                        fee_charged: fee.fee,
                        total_debit: fee.total_debit,
                        expiry: request.quote_expiry,
                        policy_hash: B256::ZERO,
                    },
                    fee: fee.fee,
                    total_debit: fee.total_debit,
                    expiry: request.quote_expiry,
                    fee_breakdown: fee.breakdown,
                };
                ResponseTemplate::new(200).set_body_json(quote)
            })
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/tickets/issue"))
            .respond_with(|req: &Request| {
                let request: IssueRequest = serde_json::from_slice(&req.body).unwrap();
                let state = request.channel_state;
                if domain().recover_state_signer(&state, &request.sig_a).is_err() {
                    return ResponseTemplate::new(409);
                }
                let response = IssueResponse {
                    ticket: Ticket {
                        draft: request.quote.ticket_draft,
                        sig: Bytes::from(vec![0x11; 65]),
                    },
                    channel_ack: ChannelAck {
                        state_nonce: state.state_nonce,
                        state_hash: domain().state_hash(&state),
                        sig_b: Bytes::from(vec![0x22; 65]),
                    },
                };
                ResponseTemplate::new(200).set_body_json(response)
            })
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ChannelList::default()))
            .mount(server)
            .await;
    }

    async fn mount_hub_view(server: &MockServer, view: &ChannelView) {
        Mock::given(method("GET"))
            .and(path(format!("/v1/channels/{}", view.channel_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(view))
            .mount(server)
            .await;
    }

    /// A payee that challenges unpaid requests and answers paid ones with
    /// `paid_status`.
    async fn mount_payee(server: &MockServer, offers: Vec<Offer>, paid_status: u16) {
        let paid = json!({
            "ok": true,
            "data": { "value": "premium-resource", "payee": PAYEE },
            "receipt": { "paymentId": "pay_x", "receiptId": "rcpt_1", "acceptedAt": NOW },
        });
        Mock::given(method("GET"))
            .and(path("/v1/data"))
            .and(header_exists(PAYMENT_SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(paid_status).set_body_json(paid))
            .with_priority(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/data"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(PaymentChallenge { accepts: offers }),
            )
            .mount(server)
            .await;
    }

    async fn presented(server: &MockServer) -> Vec<PaymentPayload> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.headers.get(PAYMENT_SIGNATURE_HEADER))
            .map(|v| PaymentPayload::parse(v.to_str().unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn hub_payment_opens_a_channel_and_commits() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        mount_hub_view(&hub, &ChannelView::unknown(OPENED)).await;
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(&payee, vec![hub_offer(&url, &hub.uri())], 200).await;

        let ledger = Arc::new(FakeLedger::default());
        let agent = agent(config()).with_ledger(Arc::clone(&ledger) as Arc<dyn SettlementLedger>);
        let PayOutcome::Paid(payment) = agent.pay_url(&url).await.unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(payment.route, Route::Hub);
        assert_eq!(payment.fee, TokenAmount::from(HUB_DEBIT - PRICE));
        assert_eq!(payment.receipt().unwrap().receipt_id, "rcpt_1");

        let opened = ledger.opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].peer, HUB);
        assert_eq!(opened[0].amount, U256::from(HUB_DEBIT * 100));
        assert_eq!(opened[0].channel_expiry, NOW + 30 * 86_400);

        let PaymentPayload::Hub(sent) = &presented(&payee).await[0] else {
            panic!("expected a hub payload");
        };
        let state = sent.channel_proof.channel_state.clone().unwrap();
        assert_eq!(state.state_nonce, 1);
        assert_eq!(state.bal_b, TokenAmount::from(HUB_DEBIT));
        assert_eq!(
            state.context_hash,
            context_hash(PAYEE, "GET", &sent.payment_id, "inv_hub")
        );
        assert_eq!(
            domain()
                .recover_state_signer(&state, sent.channel_proof.sig_a.as_ref().unwrap())
                .unwrap(),
            agent.address()
        );

        let key = hub_key(&hub.uri());
        let (_, cached) = agent.channels().await.into_iter().find(|(k, _)| *k == key).unwrap();
        assert_eq!(cached.nonce, 1);
        assert_eq!(cached.bal_a, TokenAmount::from(HUB_DEBIT * 99));
        assert_eq!(cached.endpoint.as_deref(), Some(hub.uri().as_str()));

        let history = agent.history(10).await;
        assert_eq!(history.len(), 1);
        assert!(history[0].ok);
        assert_eq!(history[0].ticket_id.as_deref(), Some("tkt_00112233445566778899"));
    }

    #[tokio::test]
    async fn refused_payment_leaves_the_channel_untouched() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        mount_hub_view(&hub, &ChannelView::unknown(OPENED)).await;
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(&payee, vec![hub_offer(&url, &hub.uri())], 402).await;

        let agent = agent(config());
        let key = hub_key(&hub.uri());
        let mut cached = record(50_000, 0, 0);
        cached.counterparty = Some(HUB);
        agent.store.put(&key, cached.clone()).await.unwrap();

        let err = agent.pay_url(&url).await.unwrap_err();
        assert!(matches!(err, AgentError::PayeeRejected { status, .. } if status.as_u16() == 402));
        assert_eq!(agent.store.get(&key).await.unwrap(), cached);

        let history = agent.history(10).await;
        assert!(!history[0].ok);
        assert!(history[0].error.as_deref().unwrap().contains("payee rejected"));
    }

    #[tokio::test]
    async fn catches_up_with_a_hub_that_is_ahead() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        let mut view = ChannelView::unknown(OPENED);
        view.latest_nonce = 1;
        view.latest_state = Some(ChannelState {
            channel_id: OPENED,
            state_nonce: 1,
            bal_a: TokenAmount::from(50_000 - HUB_DEBIT),
            bal_b: TokenAmount::from(HUB_DEBIT),
            locks_root: B256::ZERO,
            state_expiry: UnixTimestamp::from_secs(NOW + 120),
            context_hash: B256::ZERO,
        });
        mount_hub_view(&hub, &view).await;
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(&payee, vec![hub_offer(&url, &hub.uri())], 200).await;

        let agent = agent(config());
        let key = hub_key(&hub.uri());
        // A later deposit the hub has not seen yet.
        let mut cached = record(60_000, 0, 0);
        cached.counterparty = Some(HUB);
        agent.store.put(&key, cached).await.unwrap();

        agent.pay_url(&url).await.unwrap();
        let PaymentPayload::Hub(sent) = &presented(&payee).await[0] else {
            panic!("expected a hub payload");
        };
        let state = sent.channel_proof.channel_state.clone().unwrap();
        assert_eq!(state.state_nonce, 2);
        assert_eq!(state.bal_a, TokenAmount::from(60_000 - 2 * HUB_DEBIT));
        assert_eq!(state.bal_b, TokenAmount::from(2 * HUB_DEBIT));
    }

    #[tokio::test]
    async fn funded_direct_channel_is_preferred_and_paid() {
        let hub = MockServer::start().await;
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(
            &payee,
            vec![hub_offer(&url, &hub.uri()), direct_offer(&url, 500_000)],
            200,
        )
        .await;

        let agent = agent(config());
        agent
            .store
            .put(&direct_key(PAYEE), record(1_000_000, 0, 3))
            .await
            .unwrap();

        let PayOutcome::Paid(payment) = agent.pay_url(&url).await.unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(payment.route, Route::Direct);
        assert_eq!(payment.fee, TokenAmount::ZERO);
        assert!(hub.received_requests().await.unwrap().is_empty());

        let PaymentPayload::Direct(sent) = &presented(&payee).await[0] else {
            panic!("expected a direct payload");
        };
        assert_eq!(sent.direct.payer, agent.address());
        assert_eq!(sent.direct.channel_state.state_nonce, 4);
        assert_eq!(sent.direct.channel_state.bal_b, TokenAmount::from(500_000));
        assert_eq!(
            domain()
                .recover_state_signer(&sent.direct.channel_state, &sent.direct.sig_a)
                .unwrap(),
            agent.address()
        );
        let cached = agent.store.get(&direct_key(PAYEE)).await.unwrap();
        assert_eq!(cached.nonce, 4);
        assert_eq!(cached.bal_a, TokenAmount::from(500_000));
    }

    #[tokio::test]
    async fn insufficient_balance_fails_before_signing() {
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(&payee, vec![direct_offer(&url, 500_000)], 200).await;

        let agent = agent(AgentConfig {
            route: RoutePreference::Direct,
            ..config()
        });
        agent
            .store
            .put(&direct_key(PAYEE), record(10, 0, 1))
            .await
            .unwrap();

        let err = agent.pay_url(&url).await.unwrap_err();
        assert!(matches!(err, AgentError::InsufficientBalance { .. }));
        assert!(presented(&payee).await.is_empty());
        assert_eq!(agent.history(10).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_top_up_still_pays_from_a_covering_balance() {
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(&payee, vec![direct_offer(&url, 1_000)], 200).await;

        let ledger = Arc::new(FakeLedger {
            fail_writes: true,
            ..FakeLedger::default()
        });
        let agent = agent(config()).with_ledger(ledger);
        agent
            .store
            .put(&direct_key(PAYEE), record(5_000, 0, 0))
            .await
            .unwrap();

        agent.pay_url(&url).await.unwrap();
        let cached = agent.store.get(&direct_key(PAYEE)).await.unwrap();
        assert_eq!(cached.bal_a, TokenAmount::from(4_000));
    }

    #[tokio::test]
    async fn price_above_max_is_refused() {
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(&payee, vec![direct_offer(&url, 10_000)], 200).await;
        let agent = agent(AgentConfig {
            max_amount: TokenAmount::from(9_999),
            ..config()
        });
        let err = agent.pay_url(&url).await.unwrap_err();
        assert!(matches!(err, AgentError::AmountExceedsMax { .. }));
    }

    #[tokio::test]
    async fn offers_on_other_networks_are_not_paid() {
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        mount_payee(&payee, vec![direct_offer(&url, 10)], 200).await;
        let agent = agent(AgentConfig::default());
        let err = agent.pay_url(&url).await.unwrap_err();
        assert!(matches!(err, AgentError::NoCompatibleOffer { .. }));
    }

    #[tokio::test]
    async fn free_resources_pass_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("free"))
            .mount(&server)
            .await;
        let outcome = agent(config()).pay_url(&server.uri()).await.unwrap();
        assert!(matches!(outcome, PayOutcome::NotRequired { ref body, .. } if body == "free"));
    }

    #[tokio::test]
    async fn top_up_deposits_the_shortfall() {
        let hub = MockServer::start().await;
        let ledger = Arc::new(FakeLedger::default());
        let agent = agent(config()).with_ledger(Arc::clone(&ledger) as Arc<dyn SettlementLedger>);
        agent
            .store
            .put(&direct_key(PAYEE), record(9_000, 1_000, 5))
            .await
            .unwrap();

        let offer = direct_offer(&format!("{}/v1/data", hub.uri()), 1_010);
        let plan = agent.analyze_offer(&offer).await.unwrap();
        assert_eq!(plan.target, TokenAmount::from(101_000));
        assert_eq!(plan.refill_at, TokenAmount::from(10_100));
        assert!(plan.needs_fund);

        let funded = agent.ensure_channel_for_offer(&offer).await.unwrap();
        assert_eq!(funded.bal_a, TokenAmount::from(101_000));
        assert_eq!(funded.nonce, 5);
        assert_eq!(
            ledger.deposits.lock().unwrap().as_slice(),
            &[(OPENED, U256::from(92_000))]
        );
    }

    #[tokio::test]
    async fn hydrates_from_the_hub_listing() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        let agent = agent(config());
        let mut view = ChannelView::unknown(OPENED);
        view.latest_nonce = 7;
        view.latest_state = Some(ChannelState {
            channel_id: OPENED,
            state_nonce: 7,
            bal_a: TokenAmount::from(900),
            bal_b: TokenAmount::from(100),
            locks_root: B256::ZERO,
            state_expiry: UnixTimestamp::from_secs(NOW),
            context_hash: B256::ZERO,
        });
        Mock::given(method("GET"))
            .and(path("/v1/channels"))
            .and(query_param("payer", agent.address().to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(ChannelList {
                channels: vec![view],
            }))
            .with_priority(1)
            .mount(&hub)
            .await;

        let found = agent.hydrate_hub_channel(&hub.uri()).await.unwrap().unwrap();
        assert_eq!(found.nonce, 7);
        assert_eq!(found.bal_a, TokenAmount::from(900));
        assert_eq!(found.counterparty, Some(HUB));
        assert!(agent.store.get(&hub_key(&hub.uri())).await.is_some());
    }

    #[tokio::test]
    async fn hydrates_from_chain_logs() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        mount_hub_view(&hub, &ChannelView::unknown(OPENED)).await;
        let agent = agent(config());
        let ledger = FakeLedger {
            logged: Some(OPENED),
            on_chain: Some(OnChainChannel {
                participant_a: agent.address(),
                participant_b: HUB,
                asset: ASSET,
                challenge_period_sec: 86_400,
                channel_expiry: UnixTimestamp::from_secs(NOW + 86_400),
                total_balance: TokenAmount::from(20_000),
                is_closing: false,
                close_deadline: 0,
                latest_nonce: 0,
            }),
            ..FakeLedger::default()
        };
        let agent = agent.with_ledger(Arc::new(ledger));

        let found = agent.hydrate_hub_channel(&hub.uri()).await.unwrap().unwrap();
        assert_eq!(found.channel_id, OPENED);
        assert_eq!(found.bal_a, TokenAmount::from(20_000));
        assert_eq!(found.nonce, 0);
        assert_eq!(found.endpoint.as_deref(), Some(hub.uri().as_str()));
    }

    #[tokio::test]
    async fn reuses_a_channel_cached_under_another_endpoint() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        let agent = agent(config());
        let mut cached = record(7_000, 0, 4);
        cached.counterparty = Some(HUB);
        cached.endpoint = Some("http://hub.old.test/".to_owned());
        agent.store.put("hub:http://hub.old.test", cached).await.unwrap();

        let found = agent.hydrate_hub_channel(&hub.uri()).await.unwrap().unwrap();
        assert_eq!(found.nonce, 4);
        assert_eq!(found.endpoint.as_deref(), Some(hub.uri().as_str()));
        assert_eq!(agent.channels().await.len(), 2);
    }

    #[tokio::test]
    async fn pay_address_commits_after_issue() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        mount_hub_view(&hub, &ChannelView::unknown(OPENED)).await;
        let agent = agent(config());
        let key = hub_key(&hub.uri());
        let mut cached = record(50_000, 0, 2);
        cached.counterparty = Some(HUB);
        agent.store.put(&key, cached).await.unwrap();

        let transfer = agent
            .pay_address(&hub.uri(), PAYEE, ASSET, TokenAmount::from(PRICE))
            .await
            .unwrap();
        assert_eq!(transfer.state.state_nonce, 3);
        assert_eq!(transfer.ticket.draft.payee, PAYEE);
        let cached = agent.store.get(&key).await.unwrap();
        assert_eq!(cached.bal_a, TokenAmount::from(50_000 - HUB_DEBIT));
        assert_eq!(agent.history(1).await[0].resource, PAYEE.to_string());
    }

    fn pricey_hub() -> FeePolicy {
        FeePolicy {
            base: TokenAmount::from(5_000),
            ..FeePolicy::default()
        }
    }

    /// Two hubs; opening with the default one takes `HUB_DEBIT * 100`, the
    /// pricey one six times that.
    async fn competing_hubs() -> (MockServer, MockServer) {
        let cheap = MockServer::start().await;
        mount_hub_info(&cheap, FeePolicy::default()).await;
        let pricey = MockServer::start().await;
        mount_hub_info(&pricey, pricey_hub()).await;
        (cheap, pricey)
    }

    fn funded_agent(config: AgentConfig, wallet: u64) -> AgentClient {
        let ledger = FakeLedger {
            wallet: U256::from(wallet),
            ..FakeLedger::default()
        };
        agent(config).with_ledger(Arc::new(ledger))
    }

    #[tokio::test]
    async fn hubs_the_wallet_cannot_fund_are_skipped() {
        let (cheap, pricey) = competing_hubs().await;
        let url = "http://payee.test/v1/data";
        let offers = vec![hub_offer(url, &pricey.uri()), hub_offer(url, &cheap.uri())];

        let agent = funded_agent(config(), 200_000);
        let chosen = agent.choose_offer(&offers).await.unwrap();
        let OfferTerms::Hub(terms) = &chosen.terms else {
            panic!("expected a hub offer");
        };
        assert_eq!(terms.hub_endpoint, cheap.uri());
    }

    #[tokio::test]
    async fn unaffordable_hubs_fall_back_to_direct_or_fail() {
        let (cheap, pricey) = competing_hubs().await;
        let url = "http://payee.test/v1/data";
        let hubs = vec![hub_offer(url, &pricey.uri()), hub_offer(url, &cheap.uri())];

        let err = funded_agent(config(), 5_000).choose_offer(&hubs).await.unwrap_err();
        let AgentError::NoAffordableOffer(reason) = err else {
            panic!("expected NoAffordableOffer");
        };
        assert!(reason.contains("insufficient wallet balance"));

        let mut offers = hubs.clone();
        offers.push(direct_offer(url, PRICE));
        let chosen = funded_agent(config(), 5_000).choose_offer(&offers).await.unwrap();
        assert!(matches!(chosen.terms, OfferTerms::Direct(_)));

        let hub_only = AgentConfig {
            route: RoutePreference::Hub,
            ..config()
        };
        let err = funded_agent(hub_only, 5_000).choose_offer(&offers).await.unwrap_err();
        assert!(matches!(err, AgentError::NoAffordableOffer(_)));
    }

    #[tokio::test]
    async fn existing_hub_channel_skips_the_balance_check() {
        let (cheap, pricey) = competing_hubs().await;
        let url = "http://payee.test/v1/data";
        let offers = vec![hub_offer(url, &pricey.uri()), hub_offer(url, &cheap.uri())];

        let agent = funded_agent(config(), 0);
        let mut cached = record(50_000, 0, 1);
        cached.counterparty = Some(HUB);
        agent.store.put(&hub_key(&pricey.uri()), cached).await.unwrap();

        agent.choose_offer(&offers).await.unwrap();
        for hub in [&cheap, &pricey] {
            assert!(hub.received_requests().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn concurrent_payments_on_one_channel_take_successive_nonces() {
        let hub = MockServer::start().await;
        mount_hub(&hub).await;
        mount_hub_view(&hub, &ChannelView::unknown(OPENED)).await;
        let payee = MockServer::start().await;
        let url = format!("{}/v1/data", payee.uri());
        let offer = hub_offer(&url, &hub.uri());
        mount_payee(&payee, vec![offer.clone()], 200).await;

        let agent = agent(config());
        let key = hub_key(&hub.uri());
        let mut cached = record(50_000, 0, 0);
        cached.counterparty = Some(HUB);
        agent.store.put(&key, cached).await.unwrap();

        let (a, b) = tokio::join!(agent.pay_offer(&url, &offer), agent.pay_offer(&url, &offer));
        let mut nonces = vec![a.unwrap().state.state_nonce, b.unwrap().state.state_nonce];
        nonces.sort_unstable();
        assert_eq!(nonces, vec![1, 2]);

        let cached = agent.store.get(&key).await.unwrap();
        assert_eq!(cached.nonce, 2);
        assert_eq!(cached.bal_a, TokenAmount::from(50_000 - 2 * HUB_DEBIT));
    }

    #[tokio::test]
    async fn one_channel_under_two_endpoints_never_reuses_a_nonce() {
        let primary = MockServer::start().await;
        let mirror = MockServer::start().await;
        for hub in [&primary, &mirror] {
            mount_hub(hub).await;
            mount_hub_view(hub, &ChannelView::unknown(OPENED)).await;
        }

        let agent = agent(config());
        let mut cached = record(50_000, 0, 2);
        cached.counterparty = Some(HUB);
        for hub in [&primary, &mirror] {
            agent.store.put(&hub_key(&hub.uri()), cached.clone()).await.unwrap();
        }

        let amount = TokenAmount::from(PRICE);
        let (primary_uri, mirror_uri) = (primary.uri(), mirror.uri());
        let (a, b) = tokio::join!(
            agent.pay_address(&primary_uri, PAYEE, ASSET, amount),
            agent.pay_address(&mirror_uri, PAYEE, ASSET, amount),
        );
        let mut nonces = vec![a.unwrap().state.state_nonce, b.unwrap().state.state_nonce];
        nonces.sort_unstable();
        assert_eq!(nonces, vec![3, 4]);

        for hub in [&primary, &mirror] {
            let cached = agent.store.get(&hub_key(&hub.uri())).await.unwrap();
            assert_eq!(cached.nonce, 4);
            assert_eq!(cached.bal_a, TokenAmount::from(50_000 - 2 * HUB_DEBIT));
        }
    }
}
