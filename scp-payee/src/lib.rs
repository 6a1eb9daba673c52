//! SCP payee gateway.
//!
//! Prices HTTP routes and answers unpaid requests with `402` offers, one for
//! paying through a hub and one for paying over a direct channel. Presented
//! payments are verified offline ([`verifier::PaymentVerifier`]), optionally
//! confirmed with the issuing hub, and answered exactly once; presenting the
//! same payment again returns the original response bytes.
//!
//! # Modules
//!
//! - [`config`] - Routes, pricing and gateway settings
//! - [`error`] - Verification failures and their `402` responses
//! - [`gateway`] - Offers, payment acceptance and receipts
//! - [`grants`] - Pay-once access grants
//! - [`handlers`] - Axum route handlers and router builder
//! - [`invoices`] - Short-lived invoices backing offers
//! - [`registration`] - Hub webhook registration and inbox
//! - [`replay`] - In-memory and file-backed replay caches
//! - [`verifier`] - Hub ticket and direct payment verification

pub mod config;
pub mod error;
pub mod gateway;
pub mod grants;
pub mod handlers;
pub mod invoices;
pub mod registration;
pub mod replay;
pub mod verifier;

pub use gateway::{Gateway, Outcome};
pub use handlers::{SharedGateway, payee_router};
pub use verifier::PaymentVerifier;
