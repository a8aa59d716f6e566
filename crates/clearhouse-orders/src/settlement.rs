//! Settlement: reconcile estimated vs. actual order cost at shipment.
//!
//! The actual-cost deduction and the reservation release are two
//! independent, composable ledger effects: `balance -= actual_total` and
//! `reserved -= estimate` (floored at zero) — never `balance -= difference`.
//! The deduction goes through the conditional-update primitive, so a
//! concurrent balance mutation (e.g. a simultaneous top-up) forces a retry
//! from a fresh balance read rather than a stale under- or over-charge. The
//! deduction lands first: if it fails, the reservation and the PACKED status
//! are untouched and the settlement can simply be retried.

use std::sync::Arc;

use clearhouse_ledger::LedgerStore;
use clearhouse_types::{
    ClearhouseError, EventBus, LedgerEvent, Order, OrderId, OrderStatus, Reference, Result,
    SettlementFigures, TransactionType, subtotal_minor, validate_transition,
};

use crate::store::OrderStore;

/// Reconciles shipped orders against the wallet.
pub struct SettlementEngine {
    ledger: Arc<LedgerStore>,
    orders: Arc<OrderStore>,
    events: EventBus,
}

impl SettlementEngine {
    #[must_use]
    pub fn new(ledger: Arc<LedgerStore>, orders: Arc<OrderStore>, events: EventBus) -> Self {
        Self {
            ledger,
            orders,
            events,
        }
    }

    /// Settle a PACKED order with the carrier's actual shipping cost and
    /// advance it to SHIPPED.
    ///
    /// The line-item subtotal is recomputed from the order's items — the
    /// stale intake estimate is never trusted for the debit. Exactly one
    /// SETTLEMENT ledger entry is recorded, carrying the full figures in its
    /// metadata; a second settle attempt fails on the status check, and a
    /// concurrent one on the entry's idempotency key.
    pub fn settle(&self, order_id: OrderId, actual_shipping_minor: i64) -> Result<Order> {
        if actual_shipping_minor < 0 {
            return Err(ClearhouseError::InvalidAmount {
                amount_minor: actual_shipping_minor,
            });
        }

        let order = self.orders.get(order_id)?;
        validate_transition(order.status, OrderStatus::Shipped)?;

        let subtotal = subtotal_minor(&order.items);
        let actual_total = subtotal + actual_shipping_minor;
        let estimate = order.total_estimate_minor;
        let difference = estimate - actual_total;

        let figures = SettlementFigures {
            total_estimate_minor: estimate,
            subtotal_minor: subtotal,
            actual_shipping_minor,
            actual_total_minor: actual_total,
            difference_minor: difference,
        };

        // Deduct the actual total first, then release the full original
        // reservation. A failed deduction (closed wallet, spent retry
        // budget) leaves the reservation standing; the idempotency key
        // ensures a concurrent settle books the entry exactly once. The
        // deduction retries internally from fresh reads on
        // conditional-update conflicts; the release cannot conflict.
        self.ledger.apply_delta(
            order.wallet_id,
            -actual_total,
            TransactionType::Settlement,
            Reference::Order(order_id),
            Some(&format!("settlement:{order_id}")),
            Some(serde_json::to_value(&figures)?),
        )?;
        self.ledger.release(order.wallet_id, estimate)?;

        let updated = self.orders.update_if_status(order_id, order.status, |o| {
            o.actual_total_minor = Some(actual_total);
            o.status = OrderStatus::Shipped;
        })?;

        tracing::info!(
            %order_id,
            estimate,
            actual_total,
            difference,
            "order settled and shipped"
        );
        self.events.publish(LedgerEvent::OrderStatusChanged {
            order_id,
            from: OrderStatus::Packed,
            to: OrderStatus::Shipped,
        });
        self.events.publish(LedgerEvent::OrderSettled {
            order_id,
            actual_total_minor: actual_total,
            difference_minor: difference,
        });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use clearhouse_types::{Currency, LineItem, MerchantId, Reference, TransactionType};

    use super::*;

    struct Fixture {
        ledger: Arc<LedgerStore>,
        orders: Arc<OrderStore>,
        engine: SettlementEngine,
    }

    /// A PACKED order with estimate 10_000 (subtotal 8_000 + shipping
    /// estimate 2_000), reservation held, wallet balance 50_000.
    fn setup() -> (Fixture, Order) {
        let ledger = Arc::new(LedgerStore::new(5));
        let orders = Arc::new(OrderStore::new());
        let engine =
            SettlementEngine::new(Arc::clone(&ledger), Arc::clone(&orders), EventBus::new());

        let mut order = Order::dummy(OrderStatus::Packed, 10_000);
        order.items = vec![LineItem {
            sku: "SKU-1".to_string(),
            quantity: 4,
            unit_price_minor: 2_000,
        }];
        order.subtotal_minor = 8_000;
        order.shipping_estimate_minor = 2_000;
        order.total_estimate_minor = 10_000;
        order.wallet_id = ledger.open_wallet(MerchantId::new(), Currency::Usd);

        ledger
            .apply_delta(
                order.wallet_id,
                50_000,
                TransactionType::Adjustment,
                Reference::Manual,
                None,
                None,
            )
            .unwrap();
        ledger.reserve(order.wallet_id, 10_000).unwrap();
        orders.insert_idempotent(order.clone());
        (
            Fixture {
                ledger,
                orders,
                engine,
            },
            order,
        )
    }

    #[test]
    fn settlement_arithmetic_and_both_effects() {
        let (f, order) = setup();
        let settled = f.engine.settle(order.id, 900).unwrap();

        // actual_total = 8_000 + 900
        assert_eq!(settled.actual_total_minor, Some(8_900));
        assert_eq!(settled.status, OrderStatus::Shipped);

        let wallet = f.ledger.wallet(order.wallet_id).unwrap();
        assert_eq!(wallet.reserved_minor, 0); // -10_000, floored path unused
        assert_eq!(wallet.balance_minor, 41_100); // 50_000 - 8_900
        f.ledger.audit(order.wallet_id).unwrap();
    }

    #[test]
    fn single_combined_ledger_entry_with_figures() {
        let (f, order) = setup();
        f.engine.settle(order.id, 900).unwrap();

        let entries: Vec<_> = f
            .ledger
            .transactions(order.wallet_id)
            .into_iter()
            .filter(|tx| tx.tx_type == TransactionType::Settlement)
            .collect();
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.amount_minor, -8_900);
        assert_eq!(entry.reference, Reference::Order(order.id));

        let figures: SettlementFigures =
            serde_json::from_value(entry.metadata.clone().unwrap()).unwrap();
        assert_eq!(figures.total_estimate_minor, 10_000);
        assert_eq!(figures.subtotal_minor, 8_000);
        assert_eq!(figures.actual_shipping_minor, 900);
        assert_eq!(figures.actual_total_minor, 8_900);
        assert_eq!(figures.difference_minor, 1_100);
    }

    #[test]
    fn overrun_deducts_more_than_estimate() {
        let (f, order) = setup();
        // actual_total = 8_000 + 3_500 = 11_500 > estimate 10_000
        f.engine.settle(order.id, 3_500).unwrap();

        let wallet = f.ledger.wallet(order.wallet_id).unwrap();
        assert_eq!(wallet.balance_minor, 38_500);
        assert_eq!(wallet.reserved_minor, 0);
    }

    #[test]
    fn settle_requires_packed() {
        let (f, _) = setup();
        let mut picking = Order::dummy(OrderStatus::Picking, 5_000);
        picking.wallet_id = f.ledger.open_wallet(MerchantId::new(), Currency::Usd);
        f.orders.insert_idempotent(picking.clone());

        let err = f.engine.settle(picking.id, 100).unwrap_err();
        assert!(matches!(err, ClearhouseError::InvalidTransition { .. }));
    }

    #[test]
    fn second_settle_rejected() {
        let (f, order) = setup();
        f.engine.settle(order.id, 900).unwrap();

        // SHIPPED is not settleable again.
        let err = f.engine.settle(order.id, 900).unwrap_err();
        assert!(matches!(err, ClearhouseError::InvalidTransition { .. }));

        // Still exactly one settlement entry and one deduction.
        let wallet = f.ledger.wallet(order.wallet_id).unwrap();
        assert_eq!(wallet.balance_minor, 41_100);
    }

    #[test]
    fn negative_shipping_rejected() {
        let (f, order) = setup();
        let err = f.engine.settle(order.id, -1).unwrap_err();
        assert!(matches!(err, ClearhouseError::InvalidAmount { .. }));
    }

    #[test]
    fn failed_deduction_leaves_the_reservation_intact() {
        let (f, order) = setup();

        // A second PACKED order holds its own 10_000 on the same wallet.
        let mut other = Order::dummy(OrderStatus::Packed, 10_000);
        other.wallet_id = order.wallet_id;
        f.orders.insert_idempotent(other.clone());
        f.ledger.reserve(order.wallet_id, 10_000).unwrap();

        f.ledger.close_wallet(order.wallet_id).unwrap();
        let err = f.engine.settle(order.id, 900).unwrap_err();
        assert!(matches!(err, ClearhouseError::WalletClosed(_)));

        // Nothing moved: both reservations stand, no ledger entry was
        // booked, and the order can be settled again once the wallet is
        // reopened.
        let wallet = f.ledger.wallet(order.wallet_id).unwrap();
        assert_eq!(wallet.reserved_minor, 20_000);
        assert_eq!(wallet.balance_minor, 50_000);
        assert_eq!(f.orders.get(order.id).unwrap().status, OrderStatus::Packed);
        assert!(
            f.ledger
                .transactions(order.wallet_id)
                .iter()
                .all(|tx| tx.tx_type != TransactionType::Settlement)
        );

        // A retry while closed fails the same way without eating the other
        // order's reservation.
        f.engine.settle(order.id, 900).unwrap_err();
        assert_eq!(
            f.ledger.wallet(order.wallet_id).unwrap().reserved_minor,
            20_000
        );
    }

    #[test]
    fn concurrent_topup_does_not_corrupt_settlement() {
        let (f, order) = setup();

        // A top-up lands between the settlement's reads; apply_delta's
        // fresh-read retry must absorb it.
        f.ledger
            .apply_delta(
                order.wallet_id,
                20_000,
                TransactionType::Topup,
                Reference::Manual,
                None,
                None,
            )
            .unwrap();
        f.engine.settle(order.id, 900).unwrap();

        let wallet = f.ledger.wallet(order.wallet_id).unwrap();
        assert_eq!(wallet.balance_minor, 50_000 + 20_000 - 8_900);
        f.ledger.audit(order.wallet_id).unwrap();
    }
}
