//! # clearhouse-orders
//!
//! **Order State Machine & Settlement Engine.**
//!
//! ## Architecture
//!
//! - [`OrderStore`] — the order table with an idempotent insert keyed by the
//!   deterministic intake `OrderId`.
//! - [`OrderStateMachine`] — applies status transitions against the single
//!   table in `clearhouse-types`, and owns the reservation lifecycle: an
//!   order in a reservation-holding status has its estimate reserved on the
//!   wallet exactly once, acquired when entering the holding set and
//!   released when leaving it.
//! - [`OrderIntake`] — the funding gate at order creation: the compliance
//!   reserve is subtracted from the available balance on **every**
//!   evaluation before deciding RECEIVED (reserve committed) vs
//!   AWAITING_FUNDS (no reservation, no downstream dispatch).
//! - [`SettlementEngine`] — reconciles estimated vs. actual cost when an
//!   order ships: release the full original reservation, deduct the actual
//!   total through the conditional-update primitive, record one SETTLEMENT
//!   entry carrying both figures.

pub mod intake;
pub mod machine;
pub mod settlement;
pub mod store;

pub use intake::{IntakeOutcome, OrderIntake, OrderRequest};
pub use machine::OrderStateMachine;
pub use settlement::SettlementEngine;
pub use store::OrderStore;
