//! Outbound lifecycle events.
//!
//! Order-lifecycle and funding events are published for unrelated
//! collaborators (notification, fulfillment dispatch, AWAITING_FUNDS
//! re-evaluation) to consume. The core never blocks on delivery: publishing
//! into the broadcast channel is non-blocking, and having zero subscribers
//! is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    DepositId, InvoiceId, OrderId, OrderStatus, Reference, TransactionType, WalletId, constants,
};

/// Events emitted by the ledger, order, and funding components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LedgerEvent {
    /// Intake accepted a funded order and reserved its estimate.
    OrderAccepted {
        order_id: OrderId,
        total_estimate_minor: i64,
    },
    /// Intake parked an underfunded order; no downstream dispatch.
    OrderAwaitingFunds {
        order_id: OrderId,
        shortfall_minor: i64,
    },
    /// The state machine applied a transition.
    OrderStatusChanged {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
    /// Settlement reconciled an order's estimated vs. actual cost.
    OrderSettled {
        order_id: OrderId,
        actual_total_minor: i64,
        difference_minor: i64,
    },
    /// A wallet balance was raised by a funding source.
    WalletCredited {
        wallet_id: WalletId,
        amount_minor: i64,
        tx_type: TransactionType,
        reference: Reference,
    },
    /// A bank invoice was observed Paid and credited.
    InvoicePaid { invoice_id: InvoiceId },
    /// A deposit crossed the confirmation threshold and was credited.
    DepositConfirmed {
        deposit_id: DepositId,
        confirmations: u32,
    },
}

/// Fire-and-forget broadcast bus for [`LedgerEvent`]s.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(constants::EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Never blocks and never fails the publishing
    /// operation: with no subscribers the event is dropped.
    pub fn publish(&self, event: LedgerEvent) {
        if let Err(err) = self.sender.send(event) {
            tracing::trace!(event = ?err.0, "no event subscribers, dropping");
        }
    }

    /// Subscribe to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
