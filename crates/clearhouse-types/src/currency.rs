//! Currency model.
//!
//! Every monetary amount in Clearhouse is a signed `i64` in the currency's
//! **minor unit** (cents, satoshis) — never floating point. Wallets are
//! single-currency and currencies never cross.

use serde::{Deserialize, Serialize};

/// Supported wallet currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Currency {
    Usd,
    Eur,
    Btc,
}

impl Currency {
    /// ISO-style currency code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Btc => "BTC",
        }
    }

    /// Number of minor units per major unit (100 cents per dollar,
    /// 100,000,000 satoshis per bitcoin).
    #[must_use]
    pub fn minor_units_per_major(self) -> i64 {
        match self {
            Self::Usd | Self::Eur => 100,
            Self::Btc => 100_000_000,
        }
    }

    /// Name of the minor unit, for operator-facing messages.
    #[must_use]
    pub fn minor_unit_name(self) -> &'static str {
        match self {
            Self::Usd | Self::Eur => "cent",
            Self::Btc => "satoshi",
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}
