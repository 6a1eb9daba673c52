#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EVM support for SCP state channels.
//!
//! Channel states are EIP-712 typed data under the `X402StateChannel`
//! domain; hub tickets are EIP-191 personal signatures over a canonical JSON
//! digest. Both are produced through [`SignerLike`], so a
//! `PrivateKeySigner` and an `Arc` of one are interchangeable.
//!
//! # Modules
//!
//! - [`signer`] - The [`SignerLike`] abstraction
//! - [`state`] - Channel state hashing, signing and recovery
//! - [`ticket`] - Ticket digests, policy and context hashes
//! - [`logs`] - Adaptive backward log scanning
//!
//! # Feature Flags
//!
//! - `provider` - Contract bindings, RPC provider selection and the
//!   alloy-backed [`ledger::EvmLedger`]
//! - `telemetry` - Tracing on RPC selection and on-chain calls

pub mod logs;
pub mod signer;
pub mod state;
pub mod ticket;

#[cfg(feature = "provider")]
pub mod contract;
#[cfg(feature = "provider")]
pub mod ledger;
#[cfg(feature = "provider")]
pub mod provider;

pub use signer::SignerLike;
pub use state::{ChannelDomain, SigningError};
