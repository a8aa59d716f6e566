//! Order table.
//!
//! Same row-locking discipline as the ledger's wallet table. Because intake
//! order IDs are deterministic over (merchant, external reference), the
//! primary key doubles as the intake idempotency index: a replayed insert
//! finds the existing row.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use clearhouse_types::{ClearhouseError, Order, OrderId, OrderStatus, Result};

/// The order table. `Arc`-shareable across handlers.
pub struct OrderStore {
    inner: Mutex<HashMap<OrderId, Order>>,
}

impl OrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert unless the id already exists. Returns the stored order and
    /// whether this call created it — a replay gets `(existing, false)`.
    pub fn insert_idempotent(&self, order: Order) -> (Order, bool) {
        let mut orders = self.lock();
        if let Some(existing) = orders.get(&order.id) {
            return (existing.clone(), false);
        }
        let stored = order.clone();
        orders.insert(order.id, order);
        (stored, true)
    }

    /// Snapshot read of one order.
    pub fn get(&self, order_id: OrderId) -> Result<Order> {
        self.lock()
            .get(&order_id)
            .cloned()
            .ok_or(ClearhouseError::OrderNotFound(order_id))
    }

    /// Mutate one order row only if its status still equals `expected` — the
    /// same compare-and-swap the ledger uses on balances. Two handlers
    /// working from the same stale read serialize here: the loser gets
    /// `ConcurrentModification` and must re-read before retrying. The closure
    /// sees the current row; `updated_at` is bumped on its behalf.
    pub fn update_if_status<F>(
        &self,
        order_id: OrderId,
        expected: OrderStatus,
        mutate: F,
    ) -> Result<Order>
    where
        F: FnOnce(&mut Order),
    {
        let mut orders = self.lock();
        let order = orders
            .get_mut(&order_id)
            .ok_or(ClearhouseError::OrderNotFound(order_id))?;
        if order.status != expected {
            return Err(ClearhouseError::ConcurrentModification {
                resource: order_id.to_string(),
            });
        }
        mutate(order);
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    /// All orders, unordered. Test and audit surface.
    #[must_use]
    pub fn all(&self) -> Vec<Order> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OrderId, Order>> {
        self.inner.lock().expect("order store lock poisoned")
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}
