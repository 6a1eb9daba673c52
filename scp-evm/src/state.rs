//! EIP-712 hashing and signing of channel states.
//!
//! The domain is `{name: "X402StateChannel", version: "1", chainId,
//! verifyingContract}` and the primary type is
//!
//! ```text
//! ChannelState(bytes32 channelId,uint64 stateNonce,uint256 balA,uint256 balB,
//!              bytes32 locksRoot,uint64 stateExpiry,bytes32 contextHash)
//! ```
//!
//! Signatures are raw secp256k1 signatures over the `0x1901` digest, encoded
//! as 65 bytes `r || s || v`.

use alloy_primitives::{Address, B256, Bytes, Signature, SignatureError};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain};
use scp::networks::ChainId;
use scp::proto::ChannelState;

use crate::signer::SignerLike;

mod abi {
    #![allow(missing_docs)]
    alloy_sol_types::sol! {
        #[derive(Debug)]
        struct ChannelState {
            bytes32 channelId;
            uint64 stateNonce;
            uint256 balA;
            uint256 balB;
            bytes32 locksRoot;
            uint64 stateExpiry;
            bytes32 contextHash;
        }
    }
}

/// EIP-712 domain name.
pub const DOMAIN_NAME: &str = "X402StateChannel";
/// EIP-712 domain version.
pub const DOMAIN_VERSION: &str = "1";

/// Errors from producing a state or ticket signature.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// The signer refused or failed.
    #[error("signing failed: {0}")]
    Signer(#[from] alloy_signer::Error),
    /// The value to sign could not be serialized.
    #[error("cannot encode signing payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The chain and settlement contract a state is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelDomain {
    /// EIP-155 chain id.
    pub chain_id: ChainId,
    /// Settlement contract, the EIP-712 verifying contract.
    pub contract: Address,
}

impl ChannelDomain {
    /// Creates a domain for `contract` on `chain_id`.
    #[must_use]
    pub const fn new(chain_id: ChainId, contract: Address) -> Self {
        Self { chain_id, contract }
    }

    /// The alloy EIP-712 domain.
    #[must_use]
    pub fn eip712_domain(&self) -> Eip712Domain {
        eip712_domain! {
            name: DOMAIN_NAME,
            version: DOMAIN_VERSION,
            chain_id: self.chain_id,
            verifying_contract: self.contract,
        }
    }

    /// Domain separator.
    #[must_use]
    pub fn separator(&self) -> B256 {
        self.eip712_domain().separator()
    }

    /// `keccak256(0x1901 || separator || structHash)` for `state`.
    #[must_use]
    pub fn state_hash(&self, state: &ChannelState) -> B256 {
        to_sol(state).eip712_signing_hash(&self.eip712_domain())
    }

    /// Signs `state` with `signer`.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Signer`] if the signer fails.
    pub async fn sign_state<S: SignerLike>(
        &self,
        state: &ChannelState,
        signer: &S,
    ) -> Result<Bytes, SigningError> {
        let hash = self.state_hash(state);
        let signature = signer.sign_hash(&hash).await?;
        Ok(Bytes::copy_from_slice(&signature.as_bytes()))
    }

    /// Recovers the address that signed `state`.
    ///
    /// # Errors
    ///
    /// Returns a [`SignatureError`] if `sig` is not a valid 65-byte
    /// signature or recovery fails.
    pub fn recover_state_signer(
        &self,
        state: &ChannelState,
        sig: &[u8],
    ) -> Result<Address, SignatureError> {
        let signature = Signature::from_raw(sig)?;
        signature.recover_address_from_prehash(&self.state_hash(state))
    }
}

fn to_sol(state: &ChannelState) -> abi::ChannelState {
    abi::ChannelState {
        channelId: state.channel_id,
        stateNonce: state.state_nonce,
        balA: state.bal_a.0,
        balB: state.bal_b.0,
        locksRoot: state.locks_root,
        stateExpiry: state.state_expiry.as_secs(),
        contextHash: state.context_hash,
    }
}
