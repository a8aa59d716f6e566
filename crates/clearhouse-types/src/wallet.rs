//! Wallet account types.
//!
//! Every merchant has one wallet per currency. A wallet tracks
//! `balance_minor` (the settled balance) and `reserved_minor` (the amount
//! earmarked against open orders). `available = balance - reserved` is what
//! order intake can commit against, after subtracting the compliance reserve.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Currency, MerchantId, WalletId};

/// Lifecycle status of a wallet. Wallets are never deleted — a closed
/// account is status-flagged and refuses further mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletStatus {
    Active,
    Closed,
}

impl std::fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A single wallet account, owned by exactly one (merchant, currency) pair.
///
/// Invariant: `reserved_minor >= 0` at all times. `available_minor()` may be
/// negative only transiently before reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletAccount {
    pub id: WalletId,
    pub merchant_id: MerchantId,
    pub currency: Currency,
    /// Settled balance in minor units (signed).
    pub balance_minor: i64,
    /// Amount earmarked against open orders, in minor units.
    pub reserved_minor: i64,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletAccount {
    /// Create a fresh zero-balance wallet.
    #[must_use]
    pub fn new(merchant_id: MerchantId, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: WalletId::new(),
            merchant_id,
            currency,
            balance_minor: 0,
            reserved_minor: 0,
            status: WalletStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Balance not held by any reservation.
    #[must_use]
    pub fn available_minor(&self) -> i64 {
        self.balance_minor - self.reserved_minor
    }

    /// Balance available for funding new orders once the compliance reserve
    /// floor is subtracted.
    #[must_use]
    pub fn spendable_minor(&self, compliance_reserve_minor: i64) -> i64 {
        self.available_minor() - compliance_reserve_minor
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == WalletStatus::Active
    }
}
