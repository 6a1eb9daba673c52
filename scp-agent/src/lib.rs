//! SCP paying agent.
//!
//! Answers HTTP 402 challenges from SCP payees by signing state-channel
//! updates. Payments go either through a hub, which quotes a fee and issues
//! a ticket the payee trusts, or straight to the payee over a direct
//! channel. Channels are opened and topped up on-chain as needed and their
//! latest confirmed state is cached locally.
//!
//! ```no_run
//! use scp_agent::{AgentClient, AgentConfig, PayOutcome};
//!
//! # async fn run() -> Result<(), scp_agent::AgentError> {
//! let agent = AgentClient::from_config(AgentConfig::load()?).await?;
//! match agent.pay_url("http://127.0.0.1:4042/v1/data").await? {
//!     PayOutcome::Paid(payment) => println!("paid {} via {:?}", payment.amount, payment.route),
//!     PayOutcome::NotRequired { status, .. } => println!("free: {status}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`client`] - [`AgentClient`] and the hub and direct payment flows
//! - [`config`] - Agent settings and route preference
//! - [`error`] - Payment failures
//! - [`funding`] - When and how much to open or top up
//! - [`offers`] - Offer discovery, scoring and selection
//! - [`store`] - Channel cache and payment history

pub mod client;
pub mod config;
pub mod error;
pub mod funding;
pub mod offers;
pub mod store;

pub use client::{AgentClient, PayOutcome, Payment, Route, Transfer};
pub use config::{AgentConfig, RoutePreference};
pub use error::AgentError;
pub use funding::FundingPlan;
pub use store::{ChannelRecord, ChannelStore, FileChannelStore, MemoryChannelStore, PaymentEntry};
