//! Hub ticket signatures and the hashes that bind payments to context.
//!
//! A ticket digest is `keccak256` of the draft's sorted-key JSON. The hub
//! signs it EIP-191 style (`personal_sign` over the 32 digest bytes), which
//! lets any wallet tooling verify a ticket.

use alloy_primitives::{Address, B256, Bytes, Signature, SignatureError, eip191_hash_message, keccak256};
use alloy_sol_types::SolValue;
use scp::canonical::to_canonical_json;
use scp::networks::ChainId;
use scp::proto::{Ticket, TicketDraft};

use crate::signer::SignerLike;
use crate::state::SigningError;

/// `keccak256(canonical_json(draft))`.
///
/// # Errors
///
/// Returns an error if the draft cannot be serialized.
pub fn draft_digest(draft: &TicketDraft) -> Result<B256, serde_json::Error> {
    Ok(keccak256(to_canonical_json(draft)?))
}

/// Signs a ticket draft and returns the finished [`Ticket`].
///
/// # Errors
///
/// Returns [`SigningError`] if serialization or signing fails.
pub async fn sign_ticket<S: SignerLike>(
    draft: TicketDraft,
    signer: &S,
) -> Result<Ticket, SigningError> {
    let digest = draft_digest(&draft)?;
    let signature = signer.sign_hash(&eip191_hash_message(digest)).await?;
    Ok(Ticket {
        draft,
        sig: Bytes::copy_from_slice(&signature.as_bytes()),
    })
}

/// Why a ticket signer could not be recovered.
#[derive(Debug, thiserror::Error)]
pub enum TicketSignatureError {
    /// The draft could not be serialized.
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    /// Malformed or unrecoverable signature.
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Recovers the address that signed `ticket`.
///
/// # Errors
///
/// Returns [`TicketSignatureError`] if the signature is malformed.
pub fn recover_ticket_signer(ticket: &Ticket) -> Result<Address, TicketSignatureError> {
    let digest = draft_digest(&ticket.draft)?;
    let signature = Signature::from_raw(&ticket.sig)?;
    Ok(signature.recover_address_from_msg(digest)?)
}

/// Hash of the policy a ticket was issued under.
///
/// `keccak256('{"channelId":"0x..","chainId":N,"paymentMemo":".."}')`
#[must_use]
pub fn policy_hash(channel_id: B256, chain_id: ChainId, payment_memo: &str) -> B256 {
    let memo = serde_json::Value::from(payment_memo);
    keccak256(format!(
        r#"{{"channelId":"{channel_id}","chainId":{chain_id},"paymentMemo":{memo}}}"#
    ))
}

/// Binds a channel state to one payment request:
/// `keccak256(abi.encode(payee, method, paymentId, invoiceId))`.
#[must_use]
pub fn context_hash(payee: Address, method: &str, payment_id: &str, invoice_id: &str) -> B256 {
    keccak256(
        (
            payee,
            method.to_owned(),
            payment_id.to_owned(),
            invoice_id.to_owned(),
        )
            .abi_encode_params(),
    )
}
