//! System-wide constants for the Clearhouse engine.

/// Default compliance reserve floor, in minor units of the settlement
/// currency. Never available for order funding — a hard regulatory
/// invariant enforced on every intake evaluation.
pub const DEFAULT_COMPLIANCE_RESERVE_MINOR: i64 = 50_000;

/// Default confirmation threshold for crediting on-chain deposits.
pub const DEFAULT_CONFIRMATION_THRESHOLD: u32 = 3;

/// Maximum conditional-update attempts before surfacing `RetriesExhausted`.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 5;

/// Maximum attempts per external call (initial try plus retries).
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 4;

/// Base delay for exponential backoff between external-call retries.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;

/// Upper bound on a single backoff delay.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Default bank-invoice poll interval.
pub const DEFAULT_BANK_POLL_INTERVAL_MS: u64 = 60_000;

/// Default per-request timeout against the banking API.
pub const DEFAULT_BANK_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default blockchain-explorer poll interval.
pub const DEFAULT_CHAIN_POLL_INTERVAL_MS: u64 = 30_000;

/// Event bus channel capacity (events beyond this lag slow subscribers,
/// never the publisher).
pub const EVENT_BUS_CAPACITY: usize = 1_024;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "Clearhouse";
