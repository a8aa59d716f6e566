//! Order model and the status transition table.
//!
//! The transition table is the **single** source of truth for which status
//! changes are legal. Every consumer (intake, state machine, settlement)
//! validates through [`validate_transition`]; there are no per-call-site
//! copies of the table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClearhouseError, Currency, MerchantId, OrderId, Result, WalletId};

/// Fulfillment lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Intake accepted; the estimate is reserved on the wallet.
    Received,
    /// Intake accepted but unfunded; no reservation held.
    AwaitingFunds,
    /// Paused pending payment review.
    OnHoldPayment,
    /// Paused pending compliance review.
    OnHoldCompliance,
    /// Funds confirmed committed.
    Funded,
    /// Handed to the fulfillment pipeline.
    ReleasedToFulfillment,
    Picking,
    Packed,
    /// Settled: reservation released, actual cost debited.
    Shipped,
    Delivered,
    Complete,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// The statuses this one may legally transition to.
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Received => &[AwaitingFunds, Funded, OnHoldCompliance, Cancelled],
            AwaitingFunds => &[Funded, OnHoldPayment, Cancelled],
            OnHoldPayment => &[Funded, AwaitingFunds, Cancelled],
            OnHoldCompliance => &[Funded, Cancelled, Refunded],
            Funded => &[ReleasedToFulfillment, OnHoldCompliance, Cancelled, Refunded],
            ReleasedToFulfillment => &[Picking, OnHoldCompliance, Cancelled],
            Picking => &[Packed, OnHoldCompliance, Cancelled],
            Packed => &[Shipped],
            Shipped => &[Complete, Delivered],
            Delivered => &[Complete, Refunded],
            Complete | Cancelled | Refunded => &[],
        }
    }

    /// Whether this status ends the order lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Refunded)
    }

    /// Whether an order in this status owns a wallet reservation for its
    /// estimate. While true, the wallet's `reserved_minor` must include the
    /// order's `total_estimate_minor` exactly once.
    ///
    /// `AwaitingFunds` never reserves, and `OnHoldPayment` is only reachable
    /// from it, so neither holds. Settlement releases the reservation on the
    /// way into `Shipped`.
    #[must_use]
    pub fn holds_reservation(self) -> bool {
        matches!(
            self,
            Self::Received
                | Self::OnHoldCompliance
                | Self::Funded
                | Self::ReleasedToFulfillment
                | Self::Picking
                | Self::Packed
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "RECEIVED",
            Self::AwaitingFunds => "AWAITING_FUNDS",
            Self::OnHoldPayment => "ON_HOLD_PAYMENT",
            Self::OnHoldCompliance => "ON_HOLD_COMPLIANCE",
            Self::Funded => "FUNDED",
            Self::ReleasedToFulfillment => "RELEASED_TO_FULFILLMENT",
            Self::Picking => "PICKING",
            Self::Packed => "PACKED",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Complete => "COMPLETE",
            Self::Cancelled => "CANCELLED",
            Self::Refunded => "REFUNDED",
        };
        write!(f, "{s}")
    }
}

/// Validate a status transition against the table.
///
/// # Errors
/// Returns [`ClearhouseError::InvalidTransition`] reporting the allowed set
/// when the edge is not in the table. Never retried by callers — retrying an
/// invalid transition cannot make it valid.
pub fn validate_transition(from: OrderStatus, to: OrderStatus) -> Result<()> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        Err(ClearhouseError::InvalidTransition {
            from,
            to,
            allowed: from.allowed_transitions(),
        })
    }
}

/// A single purchased line item. Settlement recomputes the subtotal from
/// items rather than trusting the stale intake estimate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_minor: i64,
}

impl LineItem {
    #[must_use]
    pub fn line_total_minor(&self) -> i64 {
        i64::from(self.quantity) * self.unit_price_minor
    }
}

/// Sum of line totals over a set of items.
#[must_use]
pub fn subtotal_minor(items: &[LineItem]) -> i64 {
    items.iter().map(LineItem::line_total_minor).sum()
}

/// One merchant purchase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub merchant_id: MerchantId,
    /// The merchant's own order reference; with the merchant id it forms the
    /// intake idempotency key.
    pub external_ref: String,
    pub wallet_id: WalletId,
    pub currency: Currency,
    pub status: OrderStatus,
    pub items: Vec<LineItem>,
    pub subtotal_minor: i64,
    pub shipping_estimate_minor: i64,
    pub total_estimate_minor: i64,
    /// `None` until settlement persists the reconciled actual cost.
    pub actual_total_minor: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl Order {
    pub fn dummy(status: OrderStatus, estimate_minor: i64) -> Self {
        let merchant_id = MerchantId::new();
        let now = Utc::now();
        Self {
            id: OrderId::new(),
            merchant_id,
            external_ref: "ext-test".to_string(),
            wallet_id: WalletId::new(),
            currency: Currency::Usd,
            status,
            items: vec![LineItem {
                sku: "SKU-1".to_string(),
                quantity: 1,
                unit_price_minor: estimate_minor,
            }],
            subtotal_minor: estimate_minor,
            shipping_estimate_minor: 0,
            total_estimate_minor: estimate_minor,
            actual_total_minor: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(format!("{}", OrderStatus::AwaitingFunds), "AWAITING_FUNDS");
        assert_eq!(
            format!("{}", OrderStatus::ReleasedToFulfillment),
            "RELEASED_TO_FULFILLMENT"
        );
    }

    #[test]
    fn representative_edges_allowed() {
        validate_transition(OrderStatus::Received, OrderStatus::AwaitingFunds).unwrap();
        validate_transition(OrderStatus::Received, OrderStatus::Funded).unwrap();
        validate_transition(OrderStatus::Funded, OrderStatus::ReleasedToFulfillment).unwrap();
        validate_transition(OrderStatus::Packed, OrderStatus::Shipped).unwrap();
        validate_transition(OrderStatus::Shipped, OrderStatus::Delivered).unwrap();
        validate_transition(OrderStatus::Shipped, OrderStatus::Complete).unwrap();
    }

    #[test]
    fn packed_to_picking_rejected_with_allowed_set() {
        let err = validate_transition(OrderStatus::Packed, OrderStatus::Picking).unwrap_err();
        match err {
            ClearhouseError::InvalidTransition { from, to, allowed } => {
                assert_eq!(from, OrderStatus::Packed);
                assert_eq!(to, OrderStatus::Picking);
                assert_eq!(allowed, &[OrderStatus::Shipped]);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in [
            OrderStatus::Complete,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert!(status.is_terminal());
            assert!(status.allowed_transitions().is_empty());
        }
    }

    #[test]
    fn awaiting_funds_holds_no_reservation() {
        assert!(!OrderStatus::AwaitingFunds.holds_reservation());
        assert!(!OrderStatus::OnHoldPayment.holds_reservation());
        assert!(!OrderStatus::Shipped.holds_reservation());
        assert!(OrderStatus::Received.holds_reservation());
        assert!(OrderStatus::Packed.holds_reservation());
        assert!(!OrderStatus::Cancelled.holds_reservation());
    }

    #[test]
    fn every_table_edge_is_self_consistent() {
        // All listed targets must themselves be states in the table (trivially
        // true for an enum), and no terminal state may appear as a source of
        // further transitions.
        use OrderStatus::*;
        let all = [
            Received,
            AwaitingFunds,
            OnHoldPayment,
            OnHoldCompliance,
            Funded,
            ReleasedToFulfillment,
            Picking,
            Packed,
            Shipped,
            Delivered,
            Complete,
            Cancelled,
            Refunded,
        ];
        for from in all {
            for to in from.allowed_transitions() {
                assert_ne!(from, *to, "self-loop in table at {from}");
            }
            if from.is_terminal() {
                assert!(from.allowed_transitions().is_empty());
            }
        }
    }

    #[test]
    fn subtotal_sums_line_items() {
        let items = vec![
            LineItem {
                sku: "A".into(),
                quantity: 2,
                unit_price_minor: 1_500,
            },
            LineItem {
                sku: "B".into(),
                quantity: 1,
                unit_price_minor: 5_000,
            },
        ];
        assert_eq!(subtotal_minor(&items), 8_000);
    }
}
