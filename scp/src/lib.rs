#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the SCP state-channel payment protocol.
//!
//! SCP lets a paying agent answer an HTTP 402 challenge with a signed
//! state-channel balance update instead of an on-chain transfer. A hub quotes
//! and issues tickets against a funded channel; a payee accepts either a
//! hub-issued ticket or a direct channel proof.
//!
//! This crate is chain-agnostic apart from using `alloy-primitives` for
//! addresses, hashes and 256-bit amounts. Signing lives in `scp-evm`.
//!
//! # Modules
//!
//! - [`amount`] - Token amounts serialized as decimal strings
//! - [`canonical`] - Sorted-key JSON used for digests and quote matching
//! - [`config`] - Config file loading with `$VAR` expansion
//! - [`error`] - Protocol error codes and the wire error body
//! - [`fee`] - Hub fee policy arithmetic
//! - [`ids`] - Random prefixed identifiers (`tkt_`, `inv_`, `pay_`, ...)
//! - [`networks`] - Network aliases, RPC defaults, assets and contract addresses
//! - [`proto`] - Wire schemas for quotes, tickets, offers and payment headers
//! - [`timestamp`] - Unix timestamps and clocks
//! - [`webhook`] - HMAC signing of hub event deliveries
//!
//! # Feature Flags
//!
//! - `client` - [`hub_client::HubClient`], a typed HTTP client for the hub API
//! - `telemetry` - Tracing spans on outbound hub calls

pub mod amount;
pub mod canonical;
pub mod config;
pub mod error;
pub mod fee;
pub mod ids;
pub mod networks;
pub mod proto;
pub mod timestamp;
pub mod webhook;

#[cfg(feature = "client")]
pub mod hub_client;

pub use amount::TokenAmount;
pub use error::{ErrorBody, ScpErrorCode};
pub use timestamp::UnixTimestamp;
