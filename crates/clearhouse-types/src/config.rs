//! Configuration types for the Clearhouse engine.
//!
//! Everything here is resolved once at process start and injected into the
//! components that need it. In particular the banking account id is an
//! explicit configuration value, not an auto-discovered module-level cache;
//! the bank adapter exposes `replace_account_id` as the invalidation entry
//! point when the account genuinely changes.

use serde::{Deserialize, Serialize};

use crate::constants;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed floor balance (minor units) that is never available for order
    /// funding.
    pub compliance_reserve_minor: i64,
    /// Bound on conditional-update retry loops.
    pub max_cas_retries: u32,
    pub bank: BankConfig,
    pub chain: ChainConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compliance_reserve_minor: constants::DEFAULT_COMPLIANCE_RESERVE_MINOR,
            max_cas_retries: constants::DEFAULT_MAX_CAS_RETRIES,
            bank: BankConfig::default(),
            chain: ChainConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Banking API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    /// The banking account all invoices are issued under. Resolved once at
    /// startup (empty means unconfigured).
    pub account_id: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            poll_interval_ms: constants::DEFAULT_BANK_POLL_INTERVAL_MS,
            request_timeout_ms: constants::DEFAULT_BANK_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Blockchain explorer / deposit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Confirmations required before a deposit is credited. Admin-configured.
    pub confirmation_threshold: u32,
    pub poll_interval_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            confirmation_threshold: constants::DEFAULT_CONFIRMATION_THRESHOLD,
            poll_interval_ms: constants::DEFAULT_CHAIN_POLL_INTERVAL_MS,
        }
    }
}

/// Bounded exponential backoff parameters for external calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts (initial try plus retries).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: constants::DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: constants::DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}
