//! SCP hub server.
//!
//! The hub sits between paying agents and payees. It prices a payment
//! ([`service::HubService::quote`]), then accepts a payer-signed channel
//! state that moves exactly the quoted debit to the hub, countersigns it and
//! issues a ticket the payee can verify offline
//! ([`service::HubService::issue`]).
//!
//! # Modules
//!
//! - [`config`] - Server configuration with environment variable expansion
//! - [`error`] - Hub error type and its JSON response mapping
//! - [`handlers`] - Axum route handlers and router builder
//! - [`service`] - Quote and issue validation
//! - [`store`] - Quote, payment and channel state with JSON persistence
//! - [`webhooks`] - Webhook registry, event log and signed delivery
//! - [`util`] - Shutdown signal handling

pub mod config;
pub mod error;
pub mod handlers;
pub mod service;
pub mod store;
pub mod util;
pub mod webhooks;

pub use handlers::{SharedHub, hub_router};
pub use service::HubService;
