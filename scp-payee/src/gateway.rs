//! The payee gateway: 402 challenges, payment acceptance and receipts.
//!
//! Per route the flow is `unpaid -> payment presented -> verified | rejected
//! -> (optionally) access granted`. Accepted payments are answered with the
//! resource plus a receipt, and the serialized answer is stored in the
//! replay cache so presenting the same payment again yields the same bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::Address;
use dashmap::DashMap;
use scp::amount::TokenAmount;
use scp::fee::FeePolicy;
use scp::ids;
use scp::proto::{
    DirectTerms, HubTerms, Offer, OfferTerms, PaidResponse, PaymentChallenge, PaymentPayload,
    Receipt, ResourceData,
};
use scp::timestamp::{Clock, SystemClock};
use serde_json::value::RawValue;
use tokio::sync::Mutex;

use crate::config::{Accept, PaymentMode};
use crate::error::{GateError, VerificationError};
use crate::grants::AccessGrants;
use crate::invoices::InvoiceStore;
use crate::registration::WebhookInbox;
use crate::replay::ReplayStore;
use crate::verifier::{PaymentVerifier, Verified};

/// How long an offer's quote window stays open.
pub const QUOTE_WINDOW_SECS: u64 = 120;

/// Value served behind the paywall.
pub const RESOURCE_VALUE: &str = "premium-resource";

const HUB_MODE: &str = "proxy_hold";
const DIRECT_MODE: &str = "direct";

/// What a request resolved to.
#[derive(Debug)]
pub enum Outcome {
    /// `402` with fresh offers.
    Challenge(PaymentChallenge),
    /// `200` listing every route's offers (`GET /pay`).
    Catalog(PaymentChallenge),
    /// `200` served under an existing pay-once grant.
    Granted(PaidResponse),
    /// `200` for a payment. `cookie` is set when a grant was minted.
    Paid {
        body: Box<RawValue>,
        cookie: Option<String>,
    },
}

/// Resource server state.
#[derive(Debug)]
pub struct Gateway {
    payee: Address,
    resource_base: String,
    routes: BTreeMap<String, Vec<Accept>>,
    payment_mode: PaymentMode,
    fee_model: FeePolicy,
    invoices: InvoiceStore,
    grants: AccessGrants,
    verifier: PaymentVerifier,
    replay: Arc<dyn ReplayStore>,
    inbox: WebhookInbox,
    payment_locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    pay_once_ttl_secs: u64,
}

impl Gateway {
    /// A gateway with no routes, per-request payment and the wall clock.
    #[must_use]
    pub fn new(verifier: PaymentVerifier, replay: Arc<dyn ReplayStore>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pay_once_ttl_secs = 86_400;
        Self {
            payee: verifier.payee(),
            resource_base: "http://127.0.0.1:4042".to_owned(),
            routes: BTreeMap::new(),
            payment_mode: PaymentMode::PerRequest,
            fee_model: FeePolicy {
                base: TokenAmount::from(10),
                bps: 30,
                gas_surcharge: TokenAmount::ZERO,
            },
            invoices: InvoiceStore::new(Arc::clone(&clock)),
            grants: AccessGrants::new(pay_once_ttl_secs, Arc::clone(&clock)),
            verifier,
            replay,
            inbox: WebhookInbox::new(),
            payment_locks: DashMap::new(),
            clock,
            pay_once_ttl_secs,
        }
    }

    /// Priced routes and their payment options.
    #[must_use]
    pub fn with_routes(mut self, routes: BTreeMap<String, Vec<Accept>>) -> Self {
        self.routes = routes;
        self
    }

    /// Base URL offers advertise as `resource`.
    #[must_use]
    pub fn with_resource_base(mut self, base: &str) -> Self {
        base.trim_end_matches('/').clone_into(&mut self.resource_base);
        self
    }

    /// Access mode; `ttl_secs` is the lifetime of pay-once grants.
    #[must_use]
    pub fn with_payment_mode(mut self, mode: PaymentMode, ttl_secs: u64) -> Self {
        self.payment_mode = mode;
        self.pay_once_ttl_secs = ttl_secs;
        self.grants = AccessGrants::new(ttl_secs, Arc::clone(&self.clock));
        self
    }

    /// Fee model advertised in hub offers.
    #[must_use]
    pub const fn with_fee_model(mut self, fee_model: FeePolicy) -> Self {
        self.fee_model = fee_model;
        self
    }

    /// Replaces the clock. Resets invoices and grants.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.invoices = InvoiceStore::new(Arc::clone(&clock));
        self.grants = AccessGrants::new(self.pay_once_ttl_secs, Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Address payments must be made out to.
    #[must_use]
    pub const fn payee(&self) -> Address {
        self.payee
    }

    /// Per-request or pay-once.
    #[must_use]
    pub const fn payment_mode(&self) -> PaymentMode {
        self.payment_mode
    }

    /// Paths of every priced route.
    pub fn route_paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// The payment verifier.
    #[must_use]
    pub const fn verifier(&self) -> &PaymentVerifier {
        &self.verifier
    }

    /// Hub webhook deliveries.
    #[must_use]
    pub const fn inbox(&self) -> &WebhookInbox {
        &self.inbox
    }

    /// Outstanding invoices.
    #[must_use]
    pub const fn invoices(&self) -> &InvoiceStore {
        &self.invoices
    }

    /// Flushes the replay cache.
    pub async fn close(&self) {
        self.replay.close().await;
    }

    /// Mints one hub and one direct offer per payment option of `path`.
    /// Every option gets its own invoice.
    #[must_use]
    pub fn offers_for(&self, path: &str) -> Vec<Offer> {
        let Some(accepts) = self.routes.get(path) else {
            return Vec::new();
        };
        let quote_expiry = self.clock.now() + QUOTE_WINDOW_SECS;
        let resource = format!("{}{path}", self.resource_base);
        let mut offers = Vec::with_capacity(accepts.len() * 2);
        for accept in accepts {
            let invoice_id = self.invoices.mint(
                path,
                accept.price,
                accept.asset,
                &accept.network,
                &accept.hub_endpoint,
            );
            offers.push(Offer {
                network: accept.network.clone(),
                asset: accept.asset,
                max_amount_required: accept.price,
                pay_to: accept.hub_name.clone(),
                resource: resource.clone(),
                terms: OfferTerms::Hub(HubTerms {
                    hub_name: accept.hub_name.clone(),
                    hub_endpoint: accept.hub_endpoint.clone(),
                    mode: HUB_MODE.to_owned(),
                    fee_model: Some(self.fee_model),
                    quote_expiry,
                    invoice_id: invoice_id.clone(),
                    payee_address: self.payee,
                }),
            });
            offers.push(Offer {
                network: accept.network.clone(),
                asset: accept.asset,
                max_amount_required: accept.price,
                pay_to: self.payee.to_string(),
                resource: resource.clone(),
                terms: OfferTerms::Direct(DirectTerms {
                    mode: DIRECT_MODE.to_owned(),
                    quote_expiry,
                    invoice_id,
                    payee_address: self.payee,
                }),
            });
        }
        offers
    }

    /// Offers for every route.
    #[must_use]
    pub fn catalog(&self) -> PaymentChallenge {
        let accepts = self
            .routes
            .keys()
            .flat_map(|path| self.offers_for(path))
            .collect();
        PaymentChallenge { accepts }
    }

    fn resource_data(&self) -> ResourceData {
        ResourceData {
            value: RESOURCE_VALUE.to_owned(),
            payee: self.payee,
        }
    }

    /// Resolves one request.
    ///
    /// `route` is the priced path requested, or `None` for `GET /pay`.
    /// `payment` is the raw `PAYMENT-SIGNATURE` header and `access_token`
    /// a presented pay-once token.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Verification`] for a refused payment and
    /// [`GateError::Internal`] if the response cannot be encoded.
    pub async fn handle(
        &self,
        route: Option<&str>,
        payment: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<Outcome, GateError> {
        let Some(raw) = payment else {
            return Ok(self.unpaid(route, access_token));
        };
        let payload = PaymentPayload::parse(raw).map_err(VerificationError::from)?;
        let payment_id = payload.payment_id().to_owned();

        let lock = Arc::clone(
            self.payment_locks
                .entry(payment_id.clone())
                .or_default()
                .value(),
        );
        let outcome = {
            let _guard = lock.lock().await;
            self.accept(&payload, route).await
        };
        self.payment_locks
            .remove_if(&payment_id, |_, l| Arc::strong_count(l) <= 2);
        outcome
    }

    fn unpaid(&self, route: Option<&str>, access_token: Option<&str>) -> Outcome {
        let Some(path) = route else {
            return Outcome::Catalog(self.catalog());
        };
        if self.payment_mode == PaymentMode::PayOnce
            && let Some(grant) = access_token.and_then(|t| self.grants.check(t, path))
        {
            return Outcome::Granted(PaidResponse {
                ok: true,
                data: self.resource_data(),
                access: Some(grant),
                receipt: None,
            });
        }
        Outcome::Challenge(PaymentChallenge {
            accepts: self.offers_for(path),
        })
    }

    async fn accept(
        &self,
        payload: &PaymentPayload,
        route: Option<&str>,
    ) -> Result<Outcome, GateError> {
        let verified = self
            .verifier
            .verify(payload, &self.invoices, route, self.replay.as_ref())
            .await?;
        if let Verified::Replayed(body) = verified {
            tracing::debug!(payment_id = payload.payment_id(), "Replayed payment");
            return Ok(Outcome::Paid { body, cookie: None });
        }

        let (access, cookie) = match self.grant_path(route, &verified) {
            Some(path) => {
                let grant = self.grants.issue(&path);
                let cookie = self.grants.cookie(&grant);
                (Some(grant), Some(cookie))
            }
            None => (None, None),
        };
        let receipt = self.receipt(&verified);
        let response = PaidResponse {
            ok: true,
            data: self.resource_data(),
            access,
            receipt: Some(receipt),
        };
        let body = serde_json::to_string(&response)
            .and_then(RawValue::from_string)
            .map_err(|e| GateError::Internal(format!("failed to encode response: {e}")))?;
        self.replay.insert(payload.payment_id(), body.clone()).await;

        tracing::info!(
            payment_id = payload.payment_id(),
            scheme = match verified {
                Verified::Direct { .. } => "direct",
                _ => "hub",
            },
            "Payment accepted"
        );
        Ok(Outcome::Paid { body, cookie })
    }

    /// Route a pay-once grant is scoped to. For `/pay` that is the route
    /// the paid invoice was minted for.
    fn grant_path(&self, route: Option<&str>, verified: &Verified) -> Option<String> {
        if self.payment_mode != PaymentMode::PayOnce {
            return None;
        }
        match route {
            Some(path) => Some(path.to_owned()),
            None => verified
                .invoice_id()
                .and_then(|id| self.invoices.get(id))
                .map(|inv| inv.path),
        }
    }

    fn receipt(&self, verified: &Verified) -> Receipt {
        let mut receipt = Receipt {
            payment_id: String::new(),
            receipt_id: ids::receipt_id(),
            accepted_at: self.clock.now(),
            ticket_id: None,
            direct_channel_id: None,
        };
        match verified {
            Verified::Hub { payment_id, ticket } => {
                receipt.payment_id.clone_from(payment_id);
                receipt.ticket_id = Some(ticket.draft.ticket_id.clone());
            }
            Verified::Direct { payment_id, direct } => {
                receipt.payment_id.clone_from(payment_id);
                receipt.direct_channel_id = Some(direct.channel_state.channel_id);
            }
            Verified::Replayed(_) => {}
        }
        receipt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::MemoryReplayStore;
    use alloy_primitives::B256;
    use alloy_signer_local::PrivateKeySigner;
    use async_trait::async_trait;
    use scp::UnixTimestamp;
    use scp::networks::{BASE_MAINNET, CANONICAL_CONTRACT, USDC_BASE};
    use scp::proto::{ChannelState, DirectEnvelope, DirectPayment};
    use scp::timestamp::ManualClock;
    use scp_evm::ChannelDomain;
    use scp_evm::ticket::context_hash;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: u64 = 1_700_000_000;
    const PRICE: u64 = 1_000_000;
    const ROUTE: &str = "/v1/data";

    #[derive(Debug)]
    struct CountingReplay {
        inner: MemoryReplayStore,
        inserts: AtomicUsize,
    }

    #[async_trait]
    impl ReplayStore for CountingReplay {
        async fn get(&self, payment_id: &str) -> Option<Box<RawValue>> {
            self.inner.get(payment_id).await
        }

        async fn insert(&self, payment_id: &str, response: Box<RawValue>) {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.inner.insert(payment_id, response).await;
        }
    }

    fn domain() -> ChannelDomain {
        ChannelDomain::new(BASE_MAINNET, CANONICAL_CONTRACT)
    }

    fn gateway(payee: Address, replay: Arc<CountingReplay>, clock: Arc<ManualClock>) -> Gateway {
        let verifier = PaymentVerifier::new(payee, domain(), Vec::new(), clock.clone())
            .with_hub_confirmation(false);
        let routes = BTreeMap::from([(
            ROUTE.to_owned(),
            vec![Accept {
                network: "eip155:8453".to_owned(),
                chain_id: BASE_MAINNET,
                asset: USDC_BASE,
                hub_endpoint: "http://127.0.0.1:9".to_owned(),
                hub_name: "pay.eth".to_owned(),
                price: TokenAmount::from(PRICE),
            }],
        )]);
        Gateway::new(verifier, replay)
            .with_clock(clock)
            .with_routes(routes)
    }

    async fn direct_header(
        payer: &PrivateKeySigner,
        payee: Address,
        invoice_id: &str,
        payment_id: &str,
    ) -> String {
        let state = ChannelState {
            channel_id: B256::repeat_byte(0x42),
            state_nonce: 1,
            bal_a: TokenAmount::from(10_000_000 - PRICE),
            bal_b: TokenAmount::from(PRICE),
            locks_root: B256::ZERO,
            state_expiry: UnixTimestamp::from_secs(NOW + 3_600),
            context_hash: context_hash(payee, "GET", payment_id, invoice_id),
        };
        let sig_a = domain().sign_state(&state, payer).await.unwrap();
        serde_json::to_string(&PaymentPayload::Direct(DirectEnvelope {
            payment_id: payment_id.to_owned(),
            invoice_id: invoice_id.to_owned(),
            direct: DirectPayment {
                payer: payer.address(),
                payee,
                asset: USDC_BASE,
                amount: TokenAmount::from(PRICE),
                expiry: UnixTimestamp::from_secs(NOW + 120),
                invoice_id: invoice_id.to_owned(),
                payment_id: payment_id.to_owned(),
                channel_state: state,
                sig_a,
            },
        }))
        .unwrap()
    }

    fn paid_body(outcome: Result<Outcome, GateError>) -> String {
        match outcome.unwrap() {
            Outcome::Paid { body, .. } => body.get().to_owned(),
            other => panic!("expected a paid outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_presentations_of_one_payment_settle_once() {
        let clock = Arc::new(ManualClock::new(NOW));
        let replay = Arc::new(CountingReplay {
            inner: MemoryReplayStore::new(3_600, 100, clock.clone()),
            inserts: AtomicUsize::new(0),
        });
        let payee = PrivateKeySigner::random().address();
        let gw = gateway(payee, Arc::clone(&replay), clock);
        let invoice_id = gw
            .offers_for(ROUTE)
            .iter()
            .find(|o| matches!(o.terms, OfferTerms::Direct(_)))
            .map(|o| o.invoice_id().to_owned())
            .unwrap();
        let header = direct_header(&PrivateKeySigner::random(), payee, &invoice_id, "pay_1").await;

        let (first, second) = tokio::join!(
            gw.handle(Some(ROUTE), Some(&header), None),
            gw.handle(Some(ROUTE), Some(&header), None),
        );
        let (first, second) = (paid_body(first), paid_body(second));
        assert_eq!(first, second);
        assert_eq!(replay.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(gw.verifier().direct_head(B256::repeat_byte(0x42)).unwrap().nonce, 1);
        assert!(gw.payment_locks.is_empty());
    }

    #[tokio::test]
    async fn offers_pair_hub_and_direct_terms_per_option() {
        let clock = Arc::new(ManualClock::new(NOW));
        let replay = Arc::new(CountingReplay {
            inner: MemoryReplayStore::new(3_600, 100, clock.clone()),
            inserts: AtomicUsize::new(0),
        });
        let payee = Address::repeat_byte(7);
        let gw = gateway(payee, replay, clock);
        let offers = gw.offers_for(ROUTE);
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].invoice_id(), offers[1].invoice_id());
        assert_eq!(gw.invoices().len(), 1);
        assert_eq!(gw.payee(), payee);
        assert!(gw.offers_for("/v1/free").is_empty());
    }
}
