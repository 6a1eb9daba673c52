//! Signing abstraction shared by state and ticket signing.

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::{Address, B256, Signature};
use alloy_signer_local::PrivateKeySigner;

/// Anything that can sign a 32-byte prehash.
///
/// Alloy's `Signer` is not implemented for `Arc<T>`; this trait is, so one
/// key can be shared between the hub service, the ledger and webhook tasks.
pub trait SignerLike: Send + Sync {
    /// Address of the signing key.
    fn address(&self) -> Address;

    /// Signs `hash` as-is, without any message prefix.
    fn sign_hash(
        &self,
        hash: &B256,
    ) -> impl Future<Output = Result<Signature, alloy_signer::Error>> + Send;
}

impl SignerLike for PrivateKeySigner {
    fn address(&self) -> Address {
        Self::address(self)
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_hash(self, hash).await
    }
}

impl<T: SignerLike> SignerLike for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        (**self).sign_hash(hash).await
    }
}
