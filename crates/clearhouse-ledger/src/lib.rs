//! # clearhouse-ledger
//!
//! **Ledger Store**: the single source of truth for merchant wallet
//! balances.
//!
//! ## Architecture
//!
//! - One wallet row per (merchant, currency), holding `balance_minor` and
//!   `reserved_minor`.
//! - An append-only [`WalletTransaction`](clearhouse_types::WalletTransaction)
//!   log; every balance mutation appends exactly one entry in the same
//!   logical operation.
//! - `balance_minor` changes **only** through the conditional-update
//!   primitive: read, compute, write-if-unchanged. Lost races surface as
//!   `ConcurrentModification` and are retried from a fresh read, bounded.
//! - [`credit_idempotent`](LedgerStore::credit_idempotent) layers an atomic
//!   claim on the funding source's credited flag over the delta primitive,
//!   which is what makes bank-invoice and on-chain crediting safe to call
//!   repeatedly (cron re-poll, webhook replay, manual retrigger).

pub mod credit;
pub mod store;

pub use credit::{ClaimOutcome, CreditOutcome, CreditSource};
pub use store::LedgerStore;
