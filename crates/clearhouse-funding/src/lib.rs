//! # clearhouse-funding
//!
//! Funding sync adapters for the **Clearhouse** ledger & fulfillment state
//! engine. Money enters merchant wallets through two asynchronous channels:
//!
//! - **Bank invoices** ([`BankInvoiceAdapter`]): open invoices are polled
//!   against the external banking API (a webhook only triggers the same
//!   verified fetch) and credited exactly once when paid.
//! - **On-chain deposits** ([`ChainDepositAdapter`]): active receive
//!   addresses are scanned via a block explorer; deposits are credited
//!   exactly once after reaching the confirmation threshold.
//!
//! Both channels funnel into the ledger's claim-guarded idempotent credit,
//! so replayed polls, overlapping webhooks, and restarts never double-credit.
//! Receive addresses come from the [`AddressAllocator`], which derives them
//! deterministically from an extended public key with a conditionally
//! advanced per-purpose index counter.

pub mod allocator;
pub mod bank;
pub mod chain;
pub mod retry;

pub use allocator::{AddressAllocator, AddressDeriver, AddressStore, XpubDeriver};
pub use bank::{BankApi, BankInvoiceAdapter, InvoiceStore, RemoteInvoice};
pub use chain::{ChainDepositAdapter, ChainExplorer, ChainTxOut, DepositStore};
pub use retry::with_backoff;

/// Per-cycle tally reported by the polling adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records inspected this cycle.
    pub checked: usize,
    /// Wallet credits applied this cycle.
    pub credited: usize,
    /// Records skipped after a per-record failure; retried next cycle.
    pub failed: usize,
}
