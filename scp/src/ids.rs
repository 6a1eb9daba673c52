//! Random prefixed identifiers.
//!
//! Every id SCP mints is `<prefix>_<hex>`: tickets `tkt_`, invoices `inv_`,
//! payments `pay_`, receipts `rcpt_`, access grants `acc_`, webhooks `wh_`.

use alloy_primitives::{B256, hex};
use rand::RngExt;

/// Mints `<prefix>_<2N hex chars>` from `N` random bytes.
#[must_use]
pub fn mint<const N: usize>(prefix: &str) -> String {
    let bytes: [u8; N] = rand::rng().random();
    format!("{prefix}_{}", hex::encode(bytes))
}

/// Ticket id, `tkt_` + 20 hex.
#[must_use]
pub fn ticket_id() -> String {
    mint::<10>("tkt")
}

/// Invoice id, `inv_` + 20 hex.
#[must_use]
pub fn invoice_id() -> String {
    mint::<10>("inv")
}

/// Payment id, `pay_` + 20 hex.
#[must_use]
pub fn payment_id() -> String {
    mint::<10>("pay")
}

/// Receipt id, `rcpt_` + 20 hex.
#[must_use]
pub fn receipt_id() -> String {
    mint::<10>("rcpt")
}

/// Pay-once access token, `acc_` + 48 hex.
#[must_use]
pub fn access_token() -> String {
    mint::<24>("acc")
}

/// Webhook id, `wh_` + 16 hex.
#[must_use]
pub fn webhook_id() -> String {
    mint::<8>("wh")
}

/// Random 32-hex secret for webhook signing.
#[must_use]
pub fn webhook_secret() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// Random salt for `openChannel`, so repeated opens get distinct ids.
#[must_use]
pub fn channel_salt() -> B256 {
    B256::from(rand::rng().random::<[u8; 32]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes() {
        let id = ticket_id();
        assert!(id.starts_with("tkt_"));
        assert_eq!(id.len(), 4 + 20);
        assert_eq!(webhook_id().len(), 3 + 16);
        assert_eq!(access_token().len(), 4 + 48);
        assert_eq!(webhook_secret().len(), 32);
        assert_ne!(payment_id(), payment_id());
        assert_ne!(channel_salt(), channel_salt());
    }
}
