//! Bank funding invoices.
//!
//! Invoice status transitions mirror the external banking system and only
//! move forward: `Unpaid → Processing → Paid` or `→ Cancelled`. The
//! `wallet_credited` flag is the idempotency guard for crediting — it flips
//! false→true exactly once, under a conditional update on the invoice row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Currency, InvoiceId, MerchantId, TransactionId, WalletId};

/// External-facing invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Unpaid,
    Processing,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    /// Whether the external system may still move this invoice.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Unpaid | Self::Processing)
    }

    /// Forward-only ordering: an observed external status may never move an
    /// invoice backwards (a re-polled `Unpaid` after `Paid` is stale data).
    #[must_use]
    pub fn may_advance_to(self, next: InvoiceStatus) -> bool {
        match self {
            Self::Unpaid => matches!(next, Self::Processing | Self::Paid | Self::Cancelled),
            Self::Processing => matches!(next, Self::Paid | Self::Cancelled),
            Self::Paid | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unpaid => write!(f, "UNPAID"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Paid => write!(f, "PAID"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A bank funding invoice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invoice {
    pub id: InvoiceId,
    pub merchant_id: MerchantId,
    pub wallet_id: WalletId,
    /// Reference in the external banking system.
    pub external_ref: String,
    pub amount_minor: i64,
    pub currency: Currency,
    pub status: InvoiceStatus,
    /// Idempotency guard: true once the wallet has been credited.
    pub wallet_credited: bool,
    /// The ledger entry recorded by the credit, once applied.
    pub wallet_transaction_id: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    #[must_use]
    pub fn new(
        merchant_id: MerchantId,
        wallet_id: WalletId,
        external_ref: impl Into<String>,
        amount_minor: i64,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InvoiceId::new(),
            merchant_id,
            wallet_id,
            external_ref: external_ref.into(),
            amount_minor,
            currency,
            status: InvoiceStatus::Unpaid,
            wallet_credited: false,
            wallet_transaction_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal once paid-and-credited or cancelled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self.status, InvoiceStatus::Cancelled)
            || (self.status == InvoiceStatus::Paid && self.wallet_credited)
    }
}
