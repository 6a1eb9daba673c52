//! Gateway errors and their HTTP responses.
//!
//! A payment that fails verification is answered with
//! `402 {"error": "<reason>", "retryable": false}`; the reason strings are
//! stable and agents match on them.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scp::proto::PayloadError;
use serde_json::json;

/// Why a payment header was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// The header did not parse.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// The ticket signature does not recover.
    #[error("bad ticket sig")]
    BadTicketSig,
    /// The ticket was signed by a key that is not a trusted hub.
    #[error("ticket signer mismatch")]
    UntrustedHub,
    /// The ticket names another payee.
    #[error("wrong payee")]
    WrongPayee,
    /// Header ids differ from the ids the ticket was issued for.
    #[error("ticket payment id mismatch")]
    TicketIdsMismatch,
    /// The ticket has expired.
    #[error("expired")]
    Expired,
    /// The channel proof lacks a field.
    #[error("incomplete channel proof")]
    IncompleteProof,
    /// Proof fields disagree with the state they carry.
    #[error("channel proof mismatch")]
    ProofMismatch,
    /// The proof hash is not the hash of its state.
    #[error("state hash mismatch")]
    StateHashMismatch,
    /// The proof was not signed by the channel payer.
    #[error("invalid channel proof sig")]
    InvalidProofSig,
    /// The signed state is bound to another payee, payment or invoice.
    #[error("context hash mismatch")]
    ContextMismatch,
    /// No live invoice matches the route, amount and asset.
    #[error("unknown invoice")]
    UnknownInvoice,
    /// The hub has no record of the payment.
    #[error("hub payment unknown")]
    HubPaymentUnknown,
    /// The hub has not issued the payment.
    #[error("hub payment not issued")]
    HubPaymentNotIssued,
    /// The hub issued a different ticket for the payment.
    #[error("ticket id mismatch at hub")]
    HubTicketMismatch,
    /// A direct payment made out to someone else.
    #[error("direct payee mismatch")]
    DirectPayeeMismatch,
    /// A direct payment in another token.
    #[error("direct asset mismatch")]
    DirectAssetMismatch,
    /// Envelope and body ids differ.
    #[error("direct id mismatch")]
    DirectIdMismatch,
    /// The direct payment has expired.
    #[error("direct payment expired")]
    DirectExpired,
    /// The amount differs from the invoice.
    #[error("wrong amount")]
    WrongAmount,
    /// The state was not signed by the named payer.
    #[error("payer sig mismatch")]
    PayerSigMismatch,
    /// Nonce not above the last one accepted on this channel.
    #[error("stale direct nonce")]
    StaleNonce,
    /// `balB` grew by less than the amount due.
    #[error("insufficient direct delta")]
    InsufficientDelta,
    /// The direct state has expired.
    #[error("state expired")]
    StateExpired,
}

/// Gateway error type.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The payment was refused.
    #[error(transparent)]
    Verification(#[from] VerificationError),
    /// Something on our side broke.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        match self {
            Self::Verification(err) => {
                tracing::debug!(reason = %err, "Payment rejected");
                (
                    StatusCode::PAYMENT_REQUIRED,
                    Json(json!({ "error": err.to_string(), "retryable": false })),
                )
                    .into_response()
            }
            Self::Internal(message) => {
                tracing::error!(%message, "Gateway failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": message })),
                )
                    .into_response()
            }
        }
    }
}
