//! Immutable wallet ledger entries.
//!
//! Every mutation of a wallet's `balance_minor` appends exactly one
//! `WalletTransaction` in the same logical operation. Entries are created
//! once and never mutated or deleted: the per-wallet running sum of
//! `amount_minor` must equal the wallet's current `balance_minor`, and
//! `balance_after_minor` snapshots the value computed under the same row
//! lock as the write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DepositId, InvoiceId, OrderId, TransactionId, WalletId};

/// The kind of balance movement a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Bank-invoice funding credit.
    Topup,
    /// Order settlement debit (actual cost at shipment).
    Settlement,
    /// Manual operator adjustment (signed).
    Adjustment,
    /// On-chain deposit funding credit.
    BtcDepositTopup,
    /// Refund credit back to the merchant.
    Refund,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Topup => write!(f, "TOPUP"),
            Self::Settlement => write!(f, "SETTLEMENT"),
            Self::Adjustment => write!(f, "ADJUSTMENT"),
            Self::BtcDepositTopup => write!(f, "BTC_DEPOSIT_TOPUP"),
            Self::Refund => write!(f, "REFUND"),
        }
    }
}

/// What a ledger entry is booked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reference {
    Order(OrderId),
    Invoice(InvoiceId),
    Deposit(DepositId),
    /// No backing record (operator adjustment).
    Manual,
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Order(id) => write!(f, "order:{id}"),
            Self::Invoice(id) => write!(f, "{id}"),
            Self::Deposit(id) => write!(f, "{id}"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletTransaction {
    pub id: TransactionId,
    pub wallet_id: WalletId,
    pub tx_type: TransactionType,
    /// Signed movement in minor units (positive = credit, negative = debit).
    pub amount_minor: i64,
    /// Balance snapshot immediately after this entry was applied.
    pub balance_after_minor: i64,
    pub reference: Reference,
    /// Unique per wallet-credit source; `None` for non-idempotent paths.
    pub idempotency_key: Option<String>,
    /// Structured audit payload (settlement figures, operator notes).
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Audit figures attached to a SETTLEMENT entry's metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementFigures {
    pub total_estimate_minor: i64,
    pub subtotal_minor: i64,
    pub actual_shipping_minor: i64,
    pub actual_total_minor: i64,
    /// `estimate - actual_total`: positive means the merchant overpaid at
    /// reservation time, negative means they owed more.
    pub difference_minor: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_type_display() {
        assert_eq!(format!("{}", TransactionType::Topup), "TOPUP");
        assert_eq!(
            format!("{}", TransactionType::BtcDepositTopup),
            "BTC_DEPOSIT_TOPUP"
        );
        assert_eq!(format!("{}", TransactionType::Settlement), "SETTLEMENT");
    }

    #[test]
    fn settlement_figures_roundtrip_as_metadata() {
        let figures = SettlementFigures {
            total_estimate_minor: 10_000,
            subtotal_minor: 8_000,
            actual_shipping_minor: 900,
            actual_total_minor: 8_900,
            difference_minor: 1_100,
        };
        let value = serde_json::to_value(&figures).unwrap();
        let back: SettlementFigures = serde_json::from_value(value).unwrap();
        assert_eq!(figures, back);
    }

    #[test]
    fn reference_display() {
        let inv = InvoiceId::new();
        assert_eq!(format!("{}", Reference::Invoice(inv)), format!("{inv}"));
        assert_eq!(format!("{}", Reference::Manual), "manual");
    }
}
