//! Wire schemas exchanged between agents, hubs and payees.
//!
//! All JSON is camelCase. Token amounts are decimal strings, unix times and
//! nonces are numbers, hashes and signatures are `0x` hex.
//!
//! Three message families live here:
//!
//! - hub API: [`QuoteRequest`] / [`Quote`], [`IssueRequest`] / [`IssueResponse`],
//!   [`HubInfo`], [`PaymentRecord`], [`ChannelView`]
//! - 402 challenges: [`PaymentChallenge`] carrying [`Offer`]s
//! - payment headers: [`PaymentPayload`], sent as `PAYMENT-SIGNATURE`
//!
//! Offers and payloads are closed variant types. The scheme string picks the
//! variant at parse time; unknown schemes are rejected.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, B256, Bytes};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{VecSkipError, serde_as, skip_serializing_none};

use crate::amount::TokenAmount;
use crate::fee::{FeeBreakdown, FeePolicy};
use crate::timestamp::UnixTimestamp;

/// Scheme name of hub-routed payments.
pub const HUB_SCHEME: &str = "statechannel-hub-v1";
/// Scheme name of direct channel payments.
pub const DIRECT_SCHEME: &str = "statechannel-direct-v1";
/// Request header carrying a JSON [`PaymentPayload`].
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
/// Request header carrying a pay-once access token.
pub const ACCESS_TOKEN_HEADER: &str = "x-scp-access-token";
/// Cookie carrying a pay-once access token.
pub const ACCESS_COOKIE: &str = "scp_access";
/// Request header carrying the hub admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-scp-admin-token";

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// A channel balance update, the object both parties sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    /// Channel the state belongs to.
    pub channel_id: B256,
    /// Strictly increasing per channel.
    pub state_nonce: u64,
    /// Payer balance.
    pub bal_a: TokenAmount,
    /// Counterparty balance.
    pub bal_b: TokenAmount,
    /// Root of pending conditional locks; zero when there are none.
    #[serde(default)]
    pub locks_root: B256,
    /// After this the state is no longer offered for payment.
    pub state_expiry: UnixTimestamp,
    /// Binds the state to one payee, payment and invoice.
    #[serde(default)]
    pub context_hash: B256,
}

impl ChannelState {
    /// `balA + balB`, or `None` on overflow.
    #[must_use]
    pub fn total(&self) -> Option<TokenAmount> {
        self.bal_a.0.checked_add(self.bal_b.0).map(TokenAmount)
    }
}

// ---------------------------------------------------------------------------
// Hub API
// ---------------------------------------------------------------------------

/// `POST /v1/tickets/quote` body.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    /// Invoice from the offer.
    pub invoice_id: String,
    /// Payer-minted id, unique per hub.
    pub payment_id: String,
    /// Channel the debit comes from.
    pub channel_id: B256,
    /// Who the ticket is made out to.
    pub payee: Address,
    /// Token paid.
    pub asset: Address,
    /// Price the payee receives.
    pub amount: TokenAmount,
    /// Highest fee the payer accepts.
    pub max_fee: TokenAmount,
    /// Requested quote lifetime.
    pub quote_expiry: UnixTimestamp,
    /// Context the state will carry.
    #[serde(default)]
    pub context_hash: Option<B256>,
    /// Free-form note echoed into the payment record.
    #[serde(default)]
    pub payment_memo: Option<String>,
}

/// The unsigned ticket a hub will sign once the payer co-signs a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketDraft {
    /// Hub-minted ticket id.
    pub ticket_id: String,
    /// Signing hub.
    pub hub: Address,
    /// Beneficiary.
    pub payee: Address,
    /// Invoice paid.
    pub invoice_id: String,
    /// Payment id.
    pub payment_id: String,
    /// Token paid.
    pub asset: Address,
    /// Amount owed to the payee.
    pub amount: TokenAmount,
    /// Hub fee.
    pub fee_charged: TokenAmount,
    /// `amount + fee_charged`, taken from the payer.
    pub total_debit: TokenAmount,
    /// Ticket validity.
    pub expiry: UnixTimestamp,
    /// Hash of the fee policy in force.
    pub policy_hash: B256,
}

/// A hub-signed ticket: the draft plus the hub's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// The signed fields.
    #[serde(flatten)]
    pub draft: TicketDraft,
    /// Hub signature over the draft.
    pub sig: Bytes,
}

/// `POST /v1/tickets/quote` response. Echoed back verbatim on issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Invoice from the request.
    pub invoice_id: String,
    /// Payment id from the request.
    pub payment_id: String,
    /// Ticket the hub will sign.
    pub ticket_draft: TicketDraft,
    /// Hub fee.
    pub fee: TokenAmount,
    /// What the next state must move to the hub.
    pub total_debit: TokenAmount,
    /// Quote validity.
    pub expiry: UnixTimestamp,
    /// How the fee was computed.
    pub fee_breakdown: FeeBreakdown,
}

/// `POST /v1/tickets/issue` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    /// The quote being accepted.
    pub quote: Quote,
    /// Next channel state paying `total_debit`.
    pub channel_state: ChannelState,
    /// Payer signature over that state.
    pub sig_a: Bytes,
}

/// The hub's countersignature over an accepted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAck {
    /// Nonce of the accepted state.
    pub state_nonce: u64,
    /// Its EIP-712 hash.
    pub state_hash: B256,
    /// Hub signature over the state.
    pub sig_b: Bytes,
}

/// `POST /v1/tickets/issue` response: the ticket fields plus `channelAck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueResponse {
    /// The signed ticket.
    #[serde(flatten)]
    pub ticket: Ticket,
    /// The hub's countersignature.
    pub channel_ack: ChannelAck,
}

/// `GET /.well-known/x402` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubInfo {
    /// Display name.
    pub hub_name: String,
    /// Address the hub signs with.
    pub address: Address,
    /// Settlement chain.
    pub chain_id: u64,
    /// Payment schemes served.
    #[serde(default)]
    pub schemes: Vec<String>,
    /// Tokens accepted.
    #[serde(default)]
    pub supported_assets: Vec<Address>,
    /// Settlement modes offered.
    #[serde(default)]
    pub modes: Vec<String>,
    /// Current fee policy.
    #[serde(alias = "fee", default)]
    pub fee_policy: FeePolicy,
}

/// Hub-side lifecycle of a payment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Quoted, awaiting issue.
    Quoted,
    /// Ticket issued against a co-signed state.
    Issued,
    /// Quote lapsed without issue.
    Expired,
}

impl PaymentStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Quoted => "quoted",
            Self::Issued => "issued",
            Self::Expired => "expired",
        }
    }
}

/// `GET /v1/payments/{id}` response.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Payment id.
    pub payment_id: String,
    /// Lifecycle state.
    pub status: PaymentStatus,
    /// When it was quoted.
    #[serde(default)]
    pub created_at: Option<UnixTimestamp>,
    /// Invoice paid.
    #[serde(default)]
    pub invoice_id: Option<String>,
    /// Ticket once issued.
    #[serde(default)]
    pub ticket_id: Option<String>,
    /// Nonce of the paying state once issued.
    #[serde(default)]
    pub state_nonce: Option<u64>,
    /// Channel debited.
    #[serde(default)]
    pub channel_id: Option<B256>,
    /// Beneficiary.
    #[serde(default)]
    pub payee: Option<Address>,
    /// Token paid.
    #[serde(default)]
    pub asset: Option<Address>,
    /// Amount owed to the payee.
    #[serde(default)]
    pub amount: Option<TokenAmount>,
    /// Hub fee.
    #[serde(default)]
    pub fee: Option<TokenAmount>,
    /// Amount taken from the payer.
    #[serde(default)]
    pub total_debit: Option<TokenAmount>,
}

impl PaymentRecord {
    /// A bare record in the given status.
    #[must_use]
    pub fn with_status(payment_id: impl Into<String>, status: PaymentStatus) -> Self {
        Self {
            payment_id: payment_id.into(),
            status,
            created_at: None,
            invoice_id: None,
            ticket_id: None,
            state_nonce: None,
            channel_id: None,
            payee: None,
            asset: None,
            amount: None,
            fee: None,
            total_debit: None,
        }
    }
}

/// `GET /v1/channels/{id}` response. Signatures are never exposed.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    /// Channel id.
    pub channel_id: B256,
    /// Nonce of the newest state, zero if none.
    pub latest_nonce: u64,
    /// `open` while the hub serves it.
    pub status: String,
    /// Newest accepted state.
    #[serde(default)]
    pub latest_state: Option<ChannelState>,
    /// Payer, once known.
    #[serde(default)]
    pub participant_a: Option<Address>,
    /// Whether a payer signature is on file.
    #[serde(default)]
    pub has_signed_state: bool,
}

impl ChannelView {
    /// View of a channel the hub has never seen.
    #[must_use]
    pub fn unknown(channel_id: B256) -> Self {
        Self {
            channel_id,
            latest_nonce: 0,
            status: "open".to_owned(),
            latest_state: None,
            participant_a: None,
            has_signed_state: false,
        }
    }
}

/// `GET /v1/channels?payer=` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelList {
    /// Matching channels.
    pub channels: Vec<ChannelView>,
}

// ---------------------------------------------------------------------------
// 402 offers
// ---------------------------------------------------------------------------

/// Hub-scheme offer terms, `extensions["statechannel-hub-v1"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubTerms {
    /// Hub display name.
    pub hub_name: String,
    /// Hub base URL.
    pub hub_endpoint: String,
    /// Settlement mode, e.g. `proxy_hold`.
    pub mode: String,
    /// Fee policy the payee expects, if known.
    #[serde(default)]
    pub fee_model: Option<FeePolicy>,
    /// Offer validity.
    pub quote_expiry: UnixTimestamp,
    /// Invoice to pay.
    pub invoice_id: String,
    /// Payee signing address.
    pub payee_address: Address,
}

/// Direct-scheme offer terms, `extensions["statechannel-direct-v1"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectTerms {
    /// Always `direct`.
    pub mode: String,
    /// Offer validity.
    pub quote_expiry: UnixTimestamp,
    /// Invoice to pay.
    pub invoice_id: String,
    /// Payee signing address and channel peer.
    pub payee_address: Address,
}

/// Scheme-specific part of an [`Offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferTerms {
    /// Pay through a hub.
    Hub(HubTerms),
    /// Pay the payee over a direct channel.
    Direct(DirectTerms),
}

/// One entry of a 402 `accepts` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOffer", into = "RawOffer")]
pub struct Offer {
    /// CAIP-2 network.
    pub network: String,
    /// Token to pay in.
    pub asset: Address,
    /// Price in base units.
    pub max_amount_required: TokenAmount,
    /// Payee name or address.
    pub pay_to: String,
    /// URL being sold.
    pub resource: String,
    /// Scheme-specific terms.
    pub terms: OfferTerms,
}

impl Offer {
    /// Scheme name.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self.terms {
            OfferTerms::Hub(_) => HUB_SCHEME,
            OfferTerms::Direct(_) => DIRECT_SCHEME,
        }
    }

    /// Invoice this offer is bound to.
    #[must_use]
    pub fn invoice_id(&self) -> &str {
        match &self.terms {
            OfferTerms::Hub(t) => &t.invoice_id,
            OfferTerms::Direct(t) => &t.invoice_id,
        }
    }

    /// The payee's signing address.
    #[must_use]
    pub const fn payee_address(&self) -> Address {
        match &self.terms {
            OfferTerms::Hub(t) => t.payee_address,
            OfferTerms::Direct(t) => t.payee_address,
        }
    }

    /// Hub endpoint, for hub offers.
    #[must_use]
    pub fn hub_endpoint(&self) -> Option<&str> {
        match &self.terms {
            OfferTerms::Hub(t) => Some(&t.hub_endpoint),
            OfferTerms::Direct(_) => None,
        }
    }

    /// Last second at which the invoice is honoured.
    #[must_use]
    pub const fn quote_expiry(&self) -> UnixTimestamp {
        match &self.terms {
            OfferTerms::Hub(t) => t.quote_expiry,
            OfferTerms::Direct(t) => t.quote_expiry,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOffer {
    scheme: String,
    network: String,
    asset: Address,
    max_amount_required: TokenAmount,
    pay_to: String,
    resource: String,
    #[serde(default)]
    extensions: Map<String, Value>,
}

impl TryFrom<RawOffer> for Offer {
    type Error = String;

    fn try_from(mut raw: RawOffer) -> Result<Self, Self::Error> {
        let ext = raw
            .extensions
            .remove(&raw.scheme)
            .ok_or_else(|| format!("offer missing extensions[{}]", raw.scheme))?;
        let terms = match raw.scheme.as_str() {
            HUB_SCHEME => OfferTerms::Hub(serde_json::from_value(ext).map_err(|e| e.to_string())?),
            DIRECT_SCHEME => {
                OfferTerms::Direct(serde_json::from_value(ext).map_err(|e| e.to_string())?)
            }
            other => return Err(format!("unsupported offer scheme: {other}")),
        };
        Ok(Self {
            network: raw.network,
            asset: raw.asset,
            max_amount_required: raw.max_amount_required,
            pay_to: raw.pay_to,
            resource: raw.resource,
            terms,
        })
    }
}

impl From<Offer> for RawOffer {
    fn from(offer: Offer) -> Self {
        let scheme = offer.scheme().to_owned();
        let ext = match offer.terms {
            OfferTerms::Hub(t) => serde_json::to_value(t),
            OfferTerms::Direct(t) => serde_json::to_value(t),
        }
        .unwrap_or(Value::Null);
        let mut extensions = Map::new();
        extensions.insert(scheme.clone(), ext);
        Self {
            scheme,
            network: offer.network,
            asset: offer.asset,
            max_amount_required: offer.max_amount_required,
            pay_to: offer.pay_to,
            resource: offer.resource,
            extensions,
        }
    }
}

/// Body of a 402 response. Offers in schemes this crate does not speak are
/// dropped.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChallenge {
    /// Offers, best-effort parsed.
    #[serde_as(as = "VecSkipError<_>")]
    pub accepts: Vec<Offer>,
}

// ---------------------------------------------------------------------------
// Payment header
// ---------------------------------------------------------------------------

/// The payer's state proof accompanying a hub ticket.
///
/// Every field is optional on the wire so that a verifier can report an
/// incomplete proof instead of a generic parse failure.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelProof {
    /// Channel debited.
    #[serde(default)]
    pub channel_id: Option<B256>,
    /// Nonce of the paying state.
    #[serde(default)]
    pub state_nonce: Option<u64>,
    /// Hash the hub acknowledged.
    #[serde(default)]
    pub state_hash: Option<B256>,
    /// Payer signature.
    #[serde(default)]
    pub sig_a: Option<Bytes>,
    /// The paying state itself.
    #[serde(default)]
    pub channel_state: Option<ChannelState>,
}

/// Hub-routed payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubPayment {
    /// Payment id.
    pub payment_id: String,
    /// Invoice paid.
    pub invoice_id: String,
    /// Hub ticket.
    pub ticket: Ticket,
    /// State that paid the hub.
    #[serde(default)]
    pub channel_proof: ChannelProof,
}

/// Direct channel payment body, `direct` in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectPayment {
    /// Channel payer.
    pub payer: Address,
    /// Channel peer and beneficiary.
    pub payee: Address,
    /// Token paid.
    pub asset: Address,
    /// Price paid.
    pub amount: TokenAmount,
    /// Payment validity.
    pub expiry: UnixTimestamp,
    /// Invoice paid.
    pub invoice_id: String,
    /// Payment id.
    pub payment_id: String,
    /// Next channel state.
    pub channel_state: ChannelState,
    /// Payer signature over it.
    pub sig_a: Bytes,
}

/// Direct payment envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectEnvelope {
    /// Payment id.
    pub payment_id: String,
    /// Invoice paid.
    pub invoice_id: String,
    /// The payment.
    pub direct: DirectPayment,
}

/// The `PAYMENT-SIGNATURE` header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme")]
pub enum PaymentPayload {
    /// `statechannel-hub-v1`.
    #[serde(rename = "statechannel-hub-v1")]
    Hub(HubPayment),
    /// `statechannel-direct-v1`.
    #[serde(rename = "statechannel-direct-v1")]
    Direct(DirectEnvelope),
}

/// Why a payment header could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// Not a JSON object of a known shape.
    #[error("missing or invalid header")]
    Invalid,
    /// A scheme this crate does not speak.
    #[error("wrong scheme")]
    WrongScheme,
    /// A direct payload without its `direct` body.
    #[error("missing direct payment fields")]
    MissingDirectFields,
}

impl PaymentPayload {
    /// Parses a raw header value. A payload without a `scheme` is read as a
    /// hub payment.
    ///
    /// # Errors
    ///
    /// Returns a [`PayloadError`] naming the first problem found.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let mut value: Value = serde_json::from_str(raw).map_err(|_| PayloadError::Invalid)?;
        let obj = value.as_object_mut().ok_or(PayloadError::Invalid)?;
        let scheme = match obj.remove("scheme") {
            None | Some(Value::Null) => HUB_SCHEME.to_owned(),
            Some(Value::String(s)) => s,
            Some(_) => return Err(PayloadError::WrongScheme),
        };
        match scheme.as_str() {
            HUB_SCHEME => serde_json::from_value(value)
                .map(Self::Hub)
                .map_err(|_| PayloadError::Invalid),
            DIRECT_SCHEME => serde_json::from_value(value)
                .map(Self::Direct)
                .map_err(|_| PayloadError::MissingDirectFields),
            _ => Err(PayloadError::WrongScheme),
        }
    }

    /// Payment id.
    #[must_use]
    pub fn payment_id(&self) -> &str {
        match self {
            Self::Hub(p) => &p.payment_id,
            Self::Direct(p) => &p.payment_id,
        }
    }

    /// Invoice id.
    #[must_use]
    pub fn invoice_id(&self) -> &str {
        match self {
            Self::Hub(p) => &p.invoice_id,
            Self::Direct(p) => &p.invoice_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Paid responses
// ---------------------------------------------------------------------------

/// Proof that the payee accepted a payment.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Payment id.
    pub payment_id: String,
    /// Payee-minted receipt id.
    pub receipt_id: String,
    /// When the payee accepted.
    pub accepted_at: UnixTimestamp,
    /// Hub ticket, for hub payments.
    #[serde(default)]
    pub ticket_id: Option<String>,
    /// Channel, for direct payments.
    #[serde(default)]
    pub direct_channel_id: Option<B256>,
}

/// A time-boxed pay-once grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    /// Always `pay_once`.
    pub mode: String,
    /// Bearer token for later requests.
    pub token: String,
    /// End of the grant.
    pub expires_at: UnixTimestamp,
}

/// The gated resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceData {
    /// The resource.
    pub value: String,
    /// Who served it.
    pub payee: Address,
}

/// Body of a successful paid request.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaidResponse {
    /// Always `true`.
    pub ok: bool,
    /// The resource.
    pub data: ResourceData,
    /// Pay-once grant, when that mode is on.
    #[serde(default)]
    pub access: Option<AccessGrant>,
    /// Receipt for a payment made with this request.
    #[serde(default)]
    pub receipt: Option<Receipt>,
}

// ---------------------------------------------------------------------------
// Hub events
// ---------------------------------------------------------------------------

/// Events a hub emits and delivers to webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A party started a unilateral close.
    #[serde(rename = "channel.close_started")]
    ChannelCloseStarted,
    /// A close was challenged with a newer state.
    #[serde(rename = "channel.challenged")]
    ChannelChallenged,
    /// A channel settled.
    #[serde(rename = "channel.closed")]
    ChannelClosed,
    /// A ticket was issued.
    #[serde(rename = "payment.received")]
    PaymentReceived,
    /// A payment was refunded.
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    /// A payer channel ran low.
    #[serde(rename = "balance.low")]
    BalanceLow,
}

impl EventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::ChannelCloseStarted,
        Self::ChannelChallenged,
        Self::ChannelClosed,
        Self::PaymentReceived,
        Self::PaymentRefunded,
        Self::BalanceLow,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelCloseStarted => "channel.close_started",
            Self::ChannelChallenged => "channel.challenged",
            Self::ChannelClosed => "channel.closed",
            Self::PaymentReceived => "payment.received",
            Self::PaymentRefunded => "payment.refunded",
            Self::BalanceLow => "balance.low",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|k| k.as_str() == s).ok_or(())
    }
}

/// `POST /v1/webhooks` body. Events stay strings so the hub can report
/// unknown names itself.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    /// Delivery URL.
    pub url: String,
    /// Event names; all when absent.
    #[serde(default)]
    pub events: Option<Vec<String>>,
    /// Channel filter, `*` for every channel.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Shared secret; the hub mints one when absent.
    #[serde(default)]
    pub secret: Option<String>,
}

/// `POST /v1/webhooks` 201 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistered {
    /// Hub-minted id.
    pub webhook_id: String,
    /// Delivery URL.
    #[serde(default)]
    pub url: String,
    /// Subscribed events.
    #[serde(default)]
    pub events: Vec<EventKind>,
    /// Channel filter.
    #[serde(default)]
    pub channel_id: String,
    /// `active` or `disabled`.
    pub status: String,
    /// Secret deliveries are signed with.
    pub secret: String,
}

/// Body of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event kind.
    pub event: EventKind,
    /// When it was emitted.
    pub timestamp: UnixTimestamp,
    /// Subscription delivered to.
    pub webhook_id: String,
    /// Position in the hub's event log.
    pub seq: u64,
    /// Event-specific payload.
    pub data: Value,
}
