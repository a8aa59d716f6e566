//! Error types for the Clearhouse engine.
//!
//! All errors use the `CH_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Order / state machine errors
//! - 2xx: Ledger / balance errors
//! - 3xx: Funding record errors
//! - 4xx: Address allocation errors
//! - 7xx: External collaborator errors
//! - 8xx: Data integrity errors
//! - 9xx: General / internal errors
//!
//! Note: a repeated idempotent credit is **not** an error — it is the
//! `CreditOutcome::AlreadyCredited` success value in `clearhouse-ledger`.
//! Likewise an underfunded order intake is a structured business outcome
//! (`AwaitingFunds`), not a fault.

use thiserror::Error;

use crate::{DepositId, InvoiceId, OrderId, OrderStatus, WalletId};

fn allowed_set(allowed: &[OrderStatus]) -> String {
    allowed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Central error enum for all Clearhouse operations.
#[derive(Debug, Error)]
pub enum ClearhouseError {
    // =================================================================
    // Order / State Machine Errors (1xx)
    // =================================================================
    /// The requested order does not exist.
    #[error("CH_ERR_100: Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The transition is not in the table. Never retried — retrying an
    /// invalid transition cannot make it valid.
    #[error("CH_ERR_101: Invalid transition {from} -> {to}; allowed: [{}]", allowed_set(allowed))]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
        allowed: &'static [OrderStatus],
    },

    // =================================================================
    // Ledger / Balance Errors (2xx)
    // =================================================================
    /// Not enough available balance for a direct debit.
    #[error("CH_ERR_200: Insufficient funds: need {needed_minor}, have {available_minor}")]
    InsufficientFunds {
        needed_minor: i64,
        available_minor: i64,
    },

    /// A conditional update lost the race: the stored value no longer
    /// matches the value read. Retryable with a fresh read, bounded.
    #[error("CH_ERR_201: Concurrent modification of {resource}")]
    ConcurrentModification { resource: String },

    /// The bounded conditional-update retry loop was exhausted. Fatal for
    /// the owning operation — never silently dropped.
    #[error("CH_ERR_202: Retries exhausted after {attempts} attempts on {resource}")]
    RetriesExhausted { resource: String, attempts: u32 },

    /// The wallet does not exist.
    #[error("CH_ERR_203: Wallet not found: {0}")]
    WalletNotFound(WalletId),

    /// The wallet is closed and refuses mutation.
    #[error("CH_ERR_204: Wallet is closed: {0}")]
    WalletClosed(WalletId),

    /// A non-positive amount was passed where a positive one is required.
    #[error("CH_ERR_205: Invalid amount: {amount_minor}")]
    InvalidAmount { amount_minor: i64 },

    /// The running sum of ledger entries disagrees with the stored balance.
    #[error(
        "CH_ERR_206: Ledger invariant violation on {wallet_id}: \
         balance {balance_minor}, entry sum {entry_sum_minor}"
    )]
    LedgerInvariantViolation {
        wallet_id: WalletId,
        balance_minor: i64,
        entry_sum_minor: i64,
    },

    // =================================================================
    // Funding Record Errors (3xx)
    // =================================================================
    /// The invoice does not exist.
    #[error("CH_ERR_300: Invoice not found: {0}")]
    InvoiceNotFound(InvoiceId),

    /// The deposit does not exist.
    #[error("CH_ERR_301: Deposit not found: {0}")]
    DepositNotFound(DepositId),

    // =================================================================
    // Address Allocation Errors (4xx)
    // =================================================================
    /// The address is not tracked by the allocator.
    #[error("CH_ERR_400: Unknown address: {address}")]
    UnknownAddress { address: String },

    /// Address derivation produced no usable address.
    #[error("CH_ERR_401: Address derivation failed: {reason}")]
    DerivationFailed { reason: String },

    // =================================================================
    // External Collaborator Errors (7xx)
    // =================================================================
    /// Transient failure (network, timeout, 5xx, rate limit). Retried with
    /// backoff; surfaced once attempts are exhausted.
    #[error("CH_ERR_700: {service} unavailable: {reason}")]
    ExternalUnavailable { service: String, reason: String },

    /// The external system rejected the request (client error). Never
    /// retried.
    #[error("CH_ERR_701: {service} rejected request with status {status}")]
    ExternalRejected { service: String, status: u16 },

    // =================================================================
    // Data Integrity Errors (8xx)
    // =================================================================
    /// A unique constraint was hit (duplicate outpoint, reused address or
    /// derivation index, replayed idempotency key). Fatal, logged, never
    /// silently swallowed.
    #[error("CH_ERR_800: Data integrity violation on {constraint}: {value}")]
    DataIntegrityViolation { constraint: String, value: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("CH_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("CH_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (missing account id, bad thresholds, etc.).
    #[error("CH_ERR_902: Configuration error: {0}")]
    Configuration(String),
}

impl ClearhouseError {
    /// Whether the owning operation may retry after this error.
    ///
    /// Only lost conditional updates and transient external failures are
    /// retryable; everything else surfaces immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::ExternalUnavailable { .. }
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, ClearhouseError>;

impl From<serde_json::Error> for ClearhouseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
