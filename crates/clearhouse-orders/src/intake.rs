//! Order intake: the compliance-reserve funding gate.
//!
//! Intake decides, per submission, whether the merchant's settlement-currency
//! wallet can fund the order's estimate after subtracting the compliance
//! reserve floor. The reserve is enforced identically on every evaluation —
//! a hard regulatory invariant, not a UX nicety. An underfunded order is a
//! structured business outcome (AWAITING_FUNDS), never an error: it is
//! stored without a reservation and without downstream dispatch, waiting for
//! a funding event to re-evaluate it.

use std::sync::Arc;

use chrono::Utc;
use clearhouse_ledger::LedgerStore;
use clearhouse_types::{
    ClearhouseError, Currency, EventBus, LedgerEvent, LineItem, MerchantId, Order, OrderId,
    OrderStatus, Result, subtotal_minor,
};

use crate::store::OrderStore;

/// An incoming order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub merchant_id: MerchantId,
    /// The merchant's own order reference; replays with the same reference
    /// return the existing order.
    pub external_ref: String,
    pub currency: Currency,
    pub items: Vec<LineItem>,
    pub shipping_estimate_minor: i64,
}

/// Outcome of an intake evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Funds committed: the estimate is reserved and the order is RECEIVED.
    Accepted(Order),
    /// Underfunded: stored AWAITING_FUNDS, no reservation, no dispatch.
    /// Carries the figures the merchant needs to act.
    AwaitingFunds {
        order: Order,
        shortfall_minor: i64,
        compliance_reserve_minor: i64,
    },
    /// Replay of a previously submitted reference; nothing changed.
    Existing(Order),
}

/// Evaluates order submissions against the merchant wallet.
pub struct OrderIntake {
    ledger: Arc<LedgerStore>,
    orders: Arc<OrderStore>,
    events: EventBus,
    compliance_reserve_minor: i64,
}

impl OrderIntake {
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

    /// Evaluate one submission.
    ///
    /// Idempotent over (merchant, external reference): the order id is
    /// derived deterministically, so a replayed submission returns
    /// [`IntakeOutcome::Existing`] instead of duplicating the order.
    pub fn submit(&self, request: OrderRequest) -> Result<IntakeOutcome> {
        let order_id = OrderId::deterministic(request.merchant_id, &request.external_ref);
        if let Ok(existing) = self.orders.get(order_id) {
            return Ok(IntakeOutcome::Existing(existing));
        }

        let subtotal = subtotal_minor(&request.items);
        let total_estimate = subtotal + request.shipping_estimate_minor;
        if total_estimate <= 0 || request.shipping_estimate_minor < 0 {
            return Err(ClearhouseError::InvalidAmount {
                amount_minor: total_estimate,
            });
        }

        // Lazy wallet creation per merchant onboarding.
        let wallet_id = self
            .ledger
            .open_wallet(request.merchant_id, request.currency);
        let wallet = self.ledger.wallet(wallet_id)?;
        let spendable = wallet.spendable_minor(self.compliance_reserve_minor);
        let funded = spendable >= total_estimate;

        let now = Utc::now();
        let order = Order {
            id: order_id,
            merchant_id: request.merchant_id,
            external_ref: request.external_ref,
            wallet_id,
            currency: request.currency,
            status: if funded {
                OrderStatus::Received
            } else {
                OrderStatus::AwaitingFunds
            },
            items: request.items,
            subtotal_minor: subtotal,
            shipping_estimate_minor: request.shipping_estimate_minor,
            total_estimate_minor: total_estimate,
            actual_total_minor: None,
            created_at: now,
            updated_at: now,
        };

        let (stored, created) = self.orders.insert_idempotent(order);
        if !created {
            // Lost an intake race for the same reference; the winner owns
            // any reservation.
            return Ok(IntakeOutcome::Existing(stored));
        }

        if funded {
            self.ledger.reserve(wallet_id, total_estimate)?;
            tracing::info!(%order_id, total_estimate, "order accepted, estimate reserved");
            self.events.publish(LedgerEvent::OrderAccepted {
                order_id,
                total_estimate_minor: total_estimate,
            });
            Ok(IntakeOutcome::Accepted(stored))
        } else {
            let shortfall = total_estimate - spendable;
            tracing::info!(%order_id, shortfall, "order awaiting funds");
            self.events.publish(LedgerEvent::OrderAwaitingFunds {
                order_id,
                shortfall_minor: shortfall,
            });
            Ok(IntakeOutcome::AwaitingFunds {
                order: stored,
                shortfall_minor: shortfall,
                compliance_reserve_minor: self.compliance_reserve_minor,
            })
        }
    }
}
