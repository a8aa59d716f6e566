//! # clearhouse-types
//!
//! Shared types, errors, and configuration for the **Clearhouse** ledger &
//! fulfillment state engine.
//!
//! This crate is the leaf dependency of the workspace — every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`MerchantId`], [`WalletId`], [`OrderId`], [`TransactionId`], [`InvoiceId`], [`DepositId`], [`OutPoint`]
//! - **Currency model**: [`Currency`] (all amounts are `i64` minor units)
//! - **Wallet model**: [`WalletAccount`], [`WalletStatus`]
//! - **Ledger entries**: [`WalletTransaction`], [`TransactionType`], [`Reference`]
//! - **Order model**: [`Order`], [`OrderStatus`], [`LineItem`] and the transition table
//! - **Funding records**: [`Invoice`], [`InvoiceStatus`], [`Deposit`], [`DepositStatus`]
//! - **Receive addresses**: [`DepositAddress`], [`AddressPurpose`], [`AddressStatus`]
//! - **Events**: [`LedgerEvent`], [`EventBus`]
//! - **Configuration**: [`EngineConfig`], [`BankConfig`], [`ChainConfig`], [`RetryPolicy`]
//! - **Errors**: [`ClearhouseError`] with `CH_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod address;
pub mod config;
pub mod constants;
pub mod currency;
pub mod deposit;
pub mod error;
pub mod event;
pub mod ids;
pub mod invoice;
pub mod order;
pub mod transaction;
pub mod wallet;

// Re-export all primary types at crate root for ergonomic imports:
//   use clearhouse_types::{WalletAccount, Order, OrderStatus, ...};

pub use address::*;
pub use config::*;
pub use currency::*;
pub use deposit::*;
pub use error::*;
pub use event::*;
pub use ids::*;
pub use invoice::*;
pub use order::*;
pub use transaction::*;
pub use wallet::*;

// Constants are accessed via `clearhouse_types::constants::FOO`
// (not re-exported to avoid name collisions).
