//! Receive address records.
//!
//! Addresses are derived by the HD allocator from a purpose-scoped extended
//! public key. The derivation index is unique per purpose and the address
//! string is globally unique; both constraints are enforced at insert as a
//! defense-in-depth check against a defective derivation path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a derived address is used for. Each purpose has its own index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum AddressPurpose {
    /// Merchant wallet funding.
    Topup,
    /// Gratuity collection.
    Tip,
}

impl AddressPurpose {
    /// Stable byte tag for derivation hashing.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Topup => 0,
            Self::Tip => 1,
        }
    }
}

impl std::fmt::Display for AddressPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Topup => write!(f, "TOPUP"),
            Self::Tip => write!(f, "TIP"),
        }
    }
}

/// Whether an address is still handed out / scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressStatus {
    Active,
    Retired,
}

impl std::fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Retired => write!(f, "RETIRED"),
        }
    }
}

/// One allocated receive address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositAddress {
    /// Globally unique address string.
    pub address: String,
    pub purpose: AddressPurpose,
    /// Unique per purpose.
    pub derivation_index: u32,
    pub status: AddressStatus,
    pub created_at: DateTime<Utc>,
}

impl DepositAddress {
    #[must_use]
    pub fn new(address: impl Into<String>, purpose: AddressPurpose, derivation_index: u32) -> Self {
        Self {
            address: address.into(),
            purpose,
            derivation_index,
            status: AddressStatus::Active,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AddressStatus::Active
    }
}
