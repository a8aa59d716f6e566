//! Order status transitions and reservation ownership.
//!
//! Every transition is validated against the single table in
//! `clearhouse-types`. The machine also keeps the wallet reservation in
//! lockstep with the status: entering the reservation-holding set reserves
//! the order's estimate (re-checking the compliance gate), leaving it
//! releases the estimate exactly once. The one edge the machine refuses to
//! apply itself is PACKED → SHIPPED, which belongs to the settlement engine
//! because it couples the status change with the ledger reconciliation.

use std::sync::Arc;

use clearhouse_ledger::LedgerStore;
use clearhouse_types::{
    ClearhouseError, EventBus, LedgerEvent, Order, OrderId, OrderStatus, Result,
    validate_transition,
};

use crate::store::OrderStore;

/// Applies validated status transitions and owns the reservation lifecycle.
pub struct OrderStateMachine {
    ledger: Arc<LedgerStore>,
    orders: Arc<OrderStore>,
    events: EventBus,
    compliance_reserve_minor: i64,
}

impl OrderStateMachine {
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerStore>,
        orders: Arc<OrderStore>,
        events: EventBus,
        compliance_reserve_minor: i64,
    ) -> Self {
        Self {
            ledger,
            orders,
            events,
            compliance_reserve_minor,
        }
    }

    /// Apply a status transition.
    ///
    /// # Errors
    /// - `InvalidTransition` if the edge is not in the table (reports the
    ///   allowed set; never retried).
    /// - `InsufficientFunds` if the transition would enter the
    ///   reservation-holding set and the wallet cannot cover the estimate
    ///   above the compliance reserve.
    /// - `ConcurrentModification` if another handler moved the order between
    ///   this one's read and its write; the caller must re-read and retry.
    pub fn transition(&self, order_id: OrderId, to: OrderStatus) -> Result<Order> {
        let order = self.orders.get(order_id)?;
        let from = order.status;
        validate_transition(from, to)?;

        if to == OrderStatus::Shipped {
            return Err(ClearhouseError::Internal(format!(
                "{order_id}: PACKED -> SHIPPED is applied by the settlement engine"
            )));
        }

        let entering = !from.holds_reservation() && to.holds_reservation();
        let leaving = from.holds_reservation() && !to.holds_reservation();

        if entering {
            // Funding an order that held nothing: same gate as intake.
            let wallet = self.ledger.wallet(order.wallet_id)?;
            let spendable = wallet.spendable_minor(self.compliance_reserve_minor);
            if spendable < order.total_estimate_minor {
                return Err(ClearhouseError::InsufficientFunds {
                    needed_minor: order.total_estimate_minor,
                    available_minor: spendable,
                });
            }
            self.ledger
                .reserve(order.wallet_id, order.total_estimate_minor)?;
        }

        // The status write is conditional on the status the edge was
        // validated against. A handler working from a stale read loses the
        // compare here and must not repeat the reservation effects, so a
        // release happens only after this write lands exactly once.
        let updated = match self.orders.update_if_status(order_id, from, |o| o.status = to) {
            Ok(updated) => updated,
            Err(err) => {
                if entering {
                    self.ledger
                        .release(order.wallet_id, order.total_estimate_minor)?;
                }
                return Err(err);
            }
        };

        if leaving {
            self.ledger
                .release(order.wallet_id, order.total_estimate_minor)?;
        }

        tracing::info!(%order_id, %from, %to, "order transitioned");
        self.events.publish(LedgerEvent::OrderStatusChanged {
            order_id,
            from,
            to,
        });
        Ok(updated)
    }
}
