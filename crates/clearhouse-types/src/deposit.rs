//! On-chain deposit records.
//!
//! A deposit is created the first time a transaction output referencing a
//! known receive address is observed. Uniqueness is enforced on the
//! `(txid, vout)` outpoint — the same transaction may fund several addresses
//! through different outputs, each a distinct deposit. A deposit becomes
//! creditworthy once its confirmation count reaches the configured threshold
//! and is credited exactly once (claim-guarded).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DepositId, OutPoint, TransactionId, WalletId};

/// Confirmation lifecycle of a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum DepositStatus {
    /// Below the confirmation threshold.
    Pending,
    /// At or above the threshold, credit not yet applied.
    Confirmed,
    /// Wallet credited.
    Credited,
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Credited => write!(f, "CREDITED"),
        }
    }
}

/// One observed transaction output paying a known receive address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deposit {
    pub id: DepositId,
    pub outpoint: OutPoint,
    /// The receive address this output pays.
    pub address: String,
    /// Derivation index of that address (denormalized for audit).
    pub derivation_index: u32,
    pub wallet_id: WalletId,
    /// Output value in satoshis.
    pub amount_minor: i64,
    pub confirmations: u32,
    pub status: DepositStatus,
    /// Idempotency guard: true once the wallet has been credited.
    pub wallet_credited: bool,
    pub wallet_transaction_id: Option<TransactionId>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    #[must_use]
    pub fn new(
        outpoint: OutPoint,
        address: impl Into<String>,
        derivation_index: u32,
        wallet_id: WalletId,
        amount_minor: i64,
        confirmations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DepositId::new(),
            outpoint,
            address: address.into(),
            derivation_index,
            wallet_id,
            amount_minor,
            confirmations,
            status: DepositStatus::Pending,
            wallet_credited: false,
            wallet_transaction_id: None,
            first_seen_at: now,
            updated_at: now,
        }
    }

    /// Whether the deposit has enough confirmations to be credited.
    #[must_use]
    pub fn is_confirmed(&self, threshold: u32) -> bool {
        self.confirmations >= threshold
    }
}
