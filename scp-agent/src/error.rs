//! Agent errors.

use reqwest::StatusCode;
use scp::amount::TokenAmount;
use scp::config::ConfigError;
use scp::hub_client::HubClientError;
use scp_evm::SigningError;
use scp_evm::ledger::LedgerError;

use crate::store::StoreError;

/// Everything that can stop a payment.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Talking to the payee failed.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The resource answered 402 without any offer this agent can parse.
    #[error("402 response carried no usable offers")]
    NoOffers,
    /// No offer matches the configured network, assets and route.
    #[error("no compatible offer for network {network} and route {route}")]
    NoCompatibleOffer {
        /// Configured network.
        network: String,
        /// Configured route preference.
        route: String,
    },
    /// Several hubs were offered and the wallet cannot fund a channel with
    /// any of them.
    #[error("no affordable hub offer: {0}")]
    NoAffordableOffer(String),
    /// The price is above `max_amount`.
    #[error("offer amount {amount} exceeds the configured maximum {max}")]
    AmountExceedsMax {
        /// Asked for.
        amount: TokenAmount,
        /// Allowed.
        max: TokenAmount,
    },
    /// Funding would be needed but no ledger is configured.
    #[error("channel needs funding but no settlement ledger is configured")]
    NoLedger,
    /// No channel is known for the counterparty.
    #[error("no channel with {0}")]
    NoChannel(String),
    /// The channel cannot cover this payment.
    #[error("insufficient channel balance: need {need}, have {have}")]
    InsufficientBalance {
        /// Debit of this payment.
        need: TokenAmount,
        /// Payer balance in the channel.
        have: TokenAmount,
    },
    /// The payee refused the payment.
    #[error("payee rejected payment with {status}: {body}")]
    PayeeRejected {
        /// Response status.
        status: StatusCode,
        /// Response body.
        body: String,
    },
    /// A hub answer does not match what was asked.
    #[error("hub response mismatch: {0}")]
    HubMismatch(&'static str),
    /// Configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A hub call failed.
    #[error(transparent)]
    Hub(#[from] HubClientError),
    /// An on-chain call failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Signing a channel state failed.
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// The channel store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The payment header could not be encoded.
    #[error("cannot encode payment header: {0}")]
    Encode(#[from] serde_json::Error),
}
