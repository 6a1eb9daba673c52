//! Short-lived invoices backing 402 offers.
//!
//! Every offer carries a fresh invoice id bound to one route, price, asset
//! and hub. Invoices outlive the 120 s quote window by a generous margin and
//! are swept lazily, at most once per [`SWEEP_INTERVAL_SECS`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::Address;
use dashmap::DashMap;
use scp::UnixTimestamp;
use scp::amount::TokenAmount;
use scp::ids;
use scp::timestamp::Clock;

/// Invoice lifetime.
pub const INVOICE_TTL_SECS: u64 = 300;
/// Minimum spacing of sweeps.
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// What an invoice was minted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// Mint time.
    pub created_at: UnixTimestamp,
    /// Route it prices.
    pub path: String,
    /// Price in base units.
    pub amount: TokenAmount,
    /// Token.
    pub asset: Address,
    /// CAIP-2 network.
    pub network: String,
    /// Hub of the hub option.
    pub hub_endpoint: String,
}

/// Concurrent invoice registry.
#[derive(Debug)]
pub struct InvoiceStore {
    invoices: DashMap<String, Invoice>,
    clock: Arc<dyn Clock>,
    last_sweep: AtomicU64,
}

impl InvoiceStore {
    /// An empty store expiring invoices by `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            invoices: DashMap::new(),
            clock,
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Current time on the store's clock.
    #[must_use]
    pub fn now(&self) -> UnixTimestamp {
        self.clock.now()
    }

    /// Registers an invoice and returns its id.
    pub fn mint(
        &self,
        path: &str,
        amount: TokenAmount,
        asset: Address,
        network: &str,
        hub_endpoint: &str,
    ) -> String {
        self.sweep();
        let id = ids::invoice_id();
        self.invoices.insert(
            id.clone(),
            Invoice {
                created_at: self.clock.now(),
                path: path.to_owned(),
                amount,
                asset,
                network: network.to_owned(),
                hub_endpoint: hub_endpoint.to_owned(),
            },
        );
        id
    }

    /// A live invoice by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Invoice> {
        let now = self.clock.now().as_secs();
        self.invoices
            .get(id)
            .filter(|inv| now.saturating_sub(inv.created_at.as_secs()) <= INVOICE_TTL_SECS)
            .map(|inv| inv.clone())
    }

    /// Whether `id` is live, bound to `path` (when given), and priced at
    /// exactly `amount` of `asset`.
    #[must_use]
    pub fn matches(&self, id: &str, path: Option<&str>, amount: TokenAmount, asset: Address) -> bool {
        self.get(id).is_some_and(|inv| {
            path.is_none_or(|p| inv.path == p) && inv.amount == amount && inv.asset == asset
        })
    }

    /// Number of stored invoices, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.invoices.len()
    }

    /// Whether no invoice is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }

    fn sweep(&self) {
        let now = self.clock.now().as_secs();
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.saturating_sub(last) < SWEEP_INTERVAL_SECS
            || self
                .last_sweep
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        self.invoices
            .retain(|_, inv| now.saturating_sub(inv.created_at.as_secs()) <= INVOICE_TTL_SECS);
    }
}
