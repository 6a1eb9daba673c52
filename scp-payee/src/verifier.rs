//! Payment header verification.
//!
//! Hub payments are checked against the set of trusted hubs, resolved from
//! each configured endpoint's `/.well-known/x402`: the ticket must be signed
//! by one of them, name this payee, be unexpired, carry a complete channel
//! proof, and match a live invoice. Unless confirmation is switched off the
//! hub is then asked whether it really issued that ticket.
//!
//! Direct payments are checked against the payer's own signature and the
//! last state this payee accepted on the channel. Channel tracking only
//! moves once every check has passed.
//!
//! A payment id already in the replay cache short-circuits to the cached
//! response once the header has been authenticated.

use std::sync::Arc;

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use scp::amount::TokenAmount;
use scp::hub_client::HubClient;
use scp::networks::ChainId;
use scp::proto::{
    ChannelProof, DirectEnvelope, DirectPayment, HubPayment, PaymentPayload, PaymentStatus,
    Ticket,
};
use scp::timestamp::Clock;
use scp_evm::ChannelDomain;
use scp_evm::ticket::{context_hash, recover_ticket_signer};
use serde_json::value::RawValue;

use crate::error::VerificationError;
use crate::invoices::InvoiceStore;
use crate::replay::ReplayStore;

/// Method paid requests are bound to in a state's `contextHash`.
const PAID_METHOD: &str = "GET";

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub enum Verified {
    /// Seen before; answer with these bytes.
    Replayed(Box<RawValue>),
    /// A fresh hub ticket.
    Hub { payment_id: String, ticket: Ticket },
    /// A fresh direct channel payment.
    Direct {
        payment_id: String,
        direct: DirectPayment,
    },
}

impl Verified {
    /// Invoice the fresh payment settles.
    #[must_use]
    pub fn invoice_id(&self) -> Option<&str> {
        match self {
            Self::Replayed(_) => None,
            Self::Hub { ticket, .. } => Some(&ticket.draft.invoice_id),
            Self::Direct { direct, .. } => Some(&direct.invoice_id),
        }
    }
}

#[derive(Debug, Clone)]
struct TrustedHub {
    client: HubClient,
    domain: ChannelDomain,
}

/// Last state accepted on a direct channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectHead {
    /// Nonce of that state.
    pub nonce: u64,
    /// Payee balance in it.
    pub bal_b: TokenAmount,
}

/// Verifies hub and direct payment headers for one payee.
#[derive(Debug)]
pub struct PaymentVerifier {
    payee: Address,
    direct_domain: ChannelDomain,
    hubs: Vec<HubClient>,
    trusted: DashMap<Address, TrustedHub>,
    direct_channels: DashMap<B256, DirectHead>,
    confirm_with_hub: bool,
    clock: Arc<dyn Clock>,
}

impl PaymentVerifier {
    /// A verifier for `payee` that trusts the hubs behind `hubs` once they
    /// have been resolved. Direct channel proofs are checked under
    /// `direct_domain`; hub channel proofs under the hub's own chain and the
    /// same contract.
    #[must_use]
    pub fn new(
        payee: Address,
        direct_domain: ChannelDomain,
        hubs: Vec<HubClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            payee,
            direct_domain,
            hubs,
            trusted: DashMap::new(),
            direct_channels: DashMap::new(),
            confirm_with_hub: true,
            clock,
        }
    }

    /// Whether to ask the issuing hub about every fresh ticket.
    #[must_use]
    pub const fn with_hub_confirmation(mut self, confirm: bool) -> Self {
        self.confirm_with_hub = confirm;
        self
    }

    /// The payee address tickets and direct payments must name.
    #[must_use]
    pub const fn payee(&self) -> Address {
        self.payee
    }

    /// Trusts `address` as the hub served at `client`.
    pub fn trust_hub(&self, address: Address, client: HubClient, chain_id: ChainId) {
        let domain = ChannelDomain::new(chain_id, self.direct_domain.contract);
        self.trusted
            .insert(address, TrustedHub { client, domain });
    }

    /// Addresses of every hub resolved so far.
    #[must_use]
    pub fn trusted_hubs(&self) -> Vec<Address> {
        self.trusted.iter().map(|e| *e.key()).collect()
    }

    /// Resolves configured hubs that are not yet trusted. Unreachable hubs
    /// are skipped and retried on the next call. Returns how many hubs are
    /// trusted afterwards.
    pub async fn resolve_hubs(&self) -> usize {
        for client in &self.hubs {
            let known = self
                .trusted
                .iter()
                .any(|e| e.value().client.endpoint() == client.endpoint());
            if known {
                continue;
            }
            match client.info().await {
                Ok(info) => {
                    tracing::info!(
                        hub = %info.address,
                        endpoint = client.endpoint(),
                        chain_id = info.chain_id,
                        "Trusting hub"
                    );
                    self.trust_hub(info.address, client.clone(), info.chain_id);
                }
                Err(e) => {
                    tracing::warn!(endpoint = client.endpoint(), error = %e, "Hub metadata unavailable");
                }
            }
        }
        self.trusted.len()
    }

    /// Last accepted state of a direct channel.
    #[must_use]
    pub fn direct_head(&self, channel_id: B256) -> Option<DirectHead> {
        self.direct_channels.get(&channel_id).map(|h| *h)
    }

    /// Verifies a parsed payment header.
    ///
    /// `expected_path` binds the invoice to the route being requested; pass
    /// `None` for the route-agnostic `/pay` endpoint.
    ///
    /// # Errors
    ///
    /// Returns the first [`VerificationError`] the payment trips over.
    pub async fn verify(
        &self,
        payload: &PaymentPayload,
        invoices: &InvoiceStore,
        expected_path: Option<&str>,
        replay: &dyn ReplayStore,
    ) -> Result<Verified, VerificationError> {
        match payload {
            PaymentPayload::Hub(payment) => {
                self.verify_hub(payment, invoices, expected_path, replay)
                    .await
            }
            PaymentPayload::Direct(envelope) => {
                self.verify_direct(envelope, invoices, expected_path, replay)
                    .await
            }
        }
    }

    async fn verify_hub(
        &self,
        payment: &HubPayment,
        invoices: &InvoiceStore,
        expected_path: Option<&str>,
        replay: &dyn ReplayStore,
    ) -> Result<Verified, VerificationError> {
        let signer =
            recover_ticket_signer(&payment.ticket).map_err(|_| VerificationError::BadTicketSig)?;
        if self.trusted.len() < self.hubs.len() {
            self.resolve_hubs().await;
        }
        let hub = self
            .trusted
            .get(&signer)
            .map(|h| h.clone())
            .ok_or(VerificationError::UntrustedHub)?;

        let ticket = &payment.ticket.draft;
        if ticket.payee != self.payee {
            return Err(VerificationError::WrongPayee);
        }
        if ticket.payment_id != payment.payment_id || ticket.invoice_id != payment.invoice_id {
            return Err(VerificationError::TicketIdsMismatch);
        }
        if ticket.expiry < self.clock.now() {
            return Err(VerificationError::Expired);
        }
        let context = context_hash(self.payee, PAID_METHOD, &ticket.payment_id, &ticket.invoice_id);
        check_channel_proof(&payment.channel_proof, &hub.domain, context)?;
        if !invoices.matches(&ticket.invoice_id, expected_path, ticket.amount, ticket.asset) {
            return Err(VerificationError::UnknownInvoice);
        }
        if let Some(cached) = replay.get(&payment.payment_id).await {
            return Ok(Verified::Replayed(cached));
        }
        if self.confirm_with_hub {
            confirm_with_hub(&hub.client, &payment.ticket).await?;
        }
        Ok(Verified::Hub {
            payment_id: payment.payment_id.clone(),
            ticket: payment.ticket.clone(),
        })
    }

    async fn verify_direct(
        &self,
        envelope: &DirectEnvelope,
        invoices: &InvoiceStore,
        expected_path: Option<&str>,
        replay: &dyn ReplayStore,
    ) -> Result<Verified, VerificationError> {
        let direct = &envelope.direct;
        let now = self.clock.now();
        let invoice = invoices.get(&envelope.invoice_id);

        if direct.payee != self.payee {
            return Err(VerificationError::DirectPayeeMismatch);
        }
        if invoice.as_ref().is_some_and(|inv| inv.asset != direct.asset) {
            return Err(VerificationError::DirectAssetMismatch);
        }
        if direct.invoice_id != envelope.invoice_id || direct.payment_id != envelope.payment_id {
            return Err(VerificationError::DirectIdMismatch);
        }
        if direct.expiry < now {
            return Err(VerificationError::DirectExpired);
        }

        if invoice.as_ref().is_some_and(|inv| inv.amount != direct.amount) {
            return Err(VerificationError::WrongAmount);
        }
        let payer = self
            .direct_domain
            .recover_state_signer(&direct.channel_state, &direct.sig_a)
            .map_err(|_| VerificationError::PayerSigMismatch)?;
        if payer != direct.payer {
            return Err(VerificationError::PayerSigMismatch);
        }
        if !invoices.matches(&direct.invoice_id, expected_path, direct.amount, direct.asset) {
            return Err(VerificationError::UnknownInvoice);
        }
        let context = context_hash(self.payee, PAID_METHOD, &direct.payment_id, &direct.invoice_id);
        if direct.channel_state.context_hash != context {
            return Err(VerificationError::ContextMismatch);
        }
        if let Some(cached) = replay.get(&envelope.payment_id).await {
            return Ok(Verified::Replayed(cached));
        }

        let state = &direct.channel_state;
        let entry = self.direct_channels.entry(state.channel_id);
        let prev = match &entry {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(_) => DirectHead::default(),
        };
        if state.state_nonce <= prev.nonce {
            return Err(VerificationError::StaleNonce);
        }
        let delta = state.bal_b.0.checked_sub(prev.bal_b.0);
        if delta.is_none_or(|d| d < direct.amount.0) {
            return Err(VerificationError::InsufficientDelta);
        }
        if state.state_expiry.as_secs() != 0 && state.state_expiry < now {
            return Err(VerificationError::StateExpired);
        }
        entry.insert(DirectHead {
            nonce: state.state_nonce,
            bal_b: state.bal_b,
        });

        tracing::debug!(
            channel_id = %state.channel_id,
            nonce = state.state_nonce,
            payer = %direct.payer,
            "Direct payment accepted"
        );
        Ok(Verified::Direct {
            payment_id: envelope.payment_id.clone(),
            direct: direct.clone(),
        })
    }
}

fn check_channel_proof(
    proof: &ChannelProof,
    domain: &ChannelDomain,
    context: B256,
) -> Result<(), VerificationError> {
    let (Some(channel_id), Some(nonce), Some(state_hash), Some(sig_a), Some(state)) = (
        proof.channel_id,
        proof.state_nonce,
        proof.state_hash,
        proof.sig_a.as_ref(),
        proof.channel_state.as_ref(),
    ) else {
        return Err(VerificationError::IncompleteProof);
    };
    if state.channel_id != channel_id || state.state_nonce != nonce {
        return Err(VerificationError::ProofMismatch);
    }
    if domain.state_hash(state) != state_hash {
        return Err(VerificationError::StateHashMismatch);
    }
    if state.context_hash != context {
        return Err(VerificationError::ContextMismatch);
    }
    domain
        .recover_state_signer(state, sig_a)
        .map_err(|_| VerificationError::InvalidProofSig)?;
    Ok(())
}

async fn confirm_with_hub(client: &HubClient, ticket: &Ticket) -> Result<(), VerificationError> {
    let record = client
        .payment(&ticket.draft.payment_id)
        .await
        .map_err(|e| {
            tracing::debug!(payment_id = %ticket.draft.payment_id, error = %e, "Hub confirmation failed");
            VerificationError::HubPaymentUnknown
        })?;
    if record.status != PaymentStatus::Issued {
        return Err(VerificationError::HubPaymentNotIssued);
    }
    if record.ticket_id.as_deref() != Some(ticket.draft.ticket_id.as_str()) {
        return Err(VerificationError::HubTicketMismatch);
    }
    Ok(())
}
