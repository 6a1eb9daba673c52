//! Offer discovery and route selection.
//!
//! A protected resource answers an unpaid GET with `402 {accepts: [...]}`.
//! Offers on other networks are dropped; the rest are ranked by how ready
//! the matching local channel is, then by price, then by the order the
//! payee listed them.

use std::cmp::Reverse;

use reqwest::{Client, StatusCode};
use scp::amount::TokenAmount;
use scp::networks::same_network;
use scp::proto::{Offer, OfferTerms, PaymentChallenge};
use url::Url;

use crate::config::RoutePreference;
use crate::error::AgentError;
use crate::store::{direct_key, hub_key};

/// What an unpaid request turned up.
#[derive(Debug, Clone)]
pub enum Discovery {
    /// The resource did not ask for payment.
    NotRequired {
        /// Response status.
        status: StatusCode,
        /// Response body.
        body: String,
    },
    /// `402` with at least one parsable offer.
    Offers(Vec<Offer>),
}

/// GETs `url` without following redirects and collects its offers.
///
/// A `402` whose body lists nothing usable is retried against the payee's
/// `/pay` catalog, keeping offers for the same resource.
///
/// # Errors
///
/// Returns [`AgentError::Http`] on transport failure and
/// [`AgentError::NoOffers`] when neither source yields an offer.
pub async fn discover(http: &Client, url: &str) -> Result<Discovery, AgentError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| AgentError::Http {
            context: "Offer discovery request failed",
            source: e,
        })?;
    let status = response.status();
    let body = response.text().await.map_err(|e| AgentError::Http {
        context: "Failed to read offer discovery response",
        source: e,
    })?;
    if status != StatusCode::PAYMENT_REQUIRED {
        return Ok(Discovery::NotRequired { status, body });
    }
    let offers = parse_offers(&body);
    if !offers.is_empty() {
        return Ok(Discovery::Offers(offers));
    }

    tracing::debug!(url, "402 without usable offers; trying /pay");
    let catalog = catalog_offers(http, url).await.unwrap_or_default();
    if catalog.is_empty() {
        return Err(AgentError::NoOffers);
    }
    Ok(Discovery::Offers(catalog))
}

fn parse_offers(body: &str) -> Vec<Offer> {
    serde_json::from_str::<PaymentChallenge>(body)
        .map(|c| c.accepts)
        .unwrap_or_default()
}

async fn catalog_offers(http: &Client, url: &str) -> Option<Vec<Offer>> {
    let resource = Url::parse(url).ok()?;
    let pay_url = resource.join("/pay").ok()?;
    let body = http.get(pay_url).send().await.ok()?.text().await.ok()?;
    let wanted = resource.as_str().trim_end_matches('/');
    Some(
        parse_offers(&body)
            .into_iter()
            .filter(|o| o.resource.trim_end_matches('/') == wanted)
            .collect(),
    )
}

/// Cache key of the channel an offer would be paid from.
#[must_use]
pub fn channel_key(offer: &Offer) -> String {
    match &offer.terms {
        OfferTerms::Hub(t) => hub_key(&t.hub_endpoint),
        OfferTerms::Direct(t) => direct_key(t.payee_address),
    }
}

/// Whether an offer on `offered` can be paid from `configured`. Empty and
/// `*` are network-agnostic on either side.
#[must_use]
pub fn network_matches(configured: &str, offered: &str) -> bool {
    let agnostic = |n: &str| {
        let n = n.trim();
        n.is_empty() || n == "*"
    };
    agnostic(configured) || agnostic(offered) || same_network(configured, offered)
}

/// Channel readiness for an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Readiness {
    /// No channel with the counterparty.
    NoChannel = 0,
    /// A channel that cannot cover the price.
    Underfunded = 1,
    /// A channel whose balance covers the price.
    Funded = 2,
}

impl Readiness {
    /// Readiness given the payer balance of the matching channel.
    #[must_use]
    pub fn of(balance: Option<TokenAmount>, required: TokenAmount) -> Self {
        match balance {
            None => Self::NoChannel,
            Some(b) if b >= required => Self::Funded,
            Some(_) => Self::Underfunded,
        }
    }
}

/// An offer with its ranking inputs.
#[derive(Debug, Clone, Copy)]
pub struct ScoredOffer<'a> {
    /// The offer.
    pub offer: &'a Offer,
    /// Position in the payee's list.
    pub index: usize,
    /// Whether a channel can pay it now.
    pub readiness: Readiness,
}

impl ScoredOffer<'_> {
    /// Whether the offer is paid over a direct channel.
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        matches!(self.offer.terms, OfferTerms::Direct(_))
    }
}

/// Drops offers for other networks and ranks the rest, best first.
///
/// `balances[i]` is the payer balance of the channel `offers[i]` would use,
/// `None` when there is no such channel.
#[must_use]
pub fn score_offers<'a>(
    offers: &'a [Offer],
    network: &str,
    balances: &[Option<TokenAmount>],
) -> Vec<ScoredOffer<'a>> {
    let mut scored: Vec<_> = offers
        .iter()
        .enumerate()
        .filter(|(_, o)| network_matches(network, &o.network))
        .map(|(index, offer)| ScoredOffer {
            offer,
            index,
            readiness: Readiness::of(
                balances.get(index).copied().flatten(),
                offer.max_amount_required,
            ),
        })
        .collect();
    scored.sort_by_key(|s| (Reverse(s.readiness), s.offer.max_amount_required, s.index));
    scored
}

/// Picks the offer to pay from a ranked list.
///
/// `hub` and `direct` take the best offer of that scheme. `auto` takes a
/// direct offer whose channel already covers the price, then the best hub
/// offer, then any direct offer.
#[must_use]
pub fn choose_offer<'a>(scored: &[ScoredOffer<'a>], route: RoutePreference) -> Option<&'a Offer> {
    let best_hub = || scored.iter().find(|s| !s.is_direct());
    let best_direct = || scored.iter().find(|s| s.is_direct());
    let chosen = match route {
        RoutePreference::Hub => best_hub(),
        RoutePreference::Direct => best_direct(),
        RoutePreference::Auto => best_direct()
            .filter(|s| s.readiness == Readiness::Funded)
            .or_else(best_hub)
            .or_else(best_direct),
    };
    chosen.map(|s| s.offer)
}
