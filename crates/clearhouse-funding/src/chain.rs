//! On-chain deposit funding channel.
//!
//! The adapter scans every active receive address through a block explorer,
//! registers each newly observed transaction output as a deposit keyed by
//! its `(txid, vout)` outpoint, tracks confirmations, and credits the bound
//! wallet exactly once when a deposit crosses the confirmation threshold.
//! Registration and crediting are decoupled: a deposit sits PENDING across
//! as many cycles as it takes, and a replayed scan of an already-credited
//! outpoint is a no-op. An address carrying a PENDING deposit stays in the
//! scan set even after it is retired — retirement stops new allocations,
//! never the crediting of money already in flight.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clearhouse_ledger::{ClaimOutcome, CreditOutcome, CreditSource, LedgerStore};
use clearhouse_types::{
    ChainConfig, ClearhouseError, Deposit, DepositAddress, DepositId, DepositStatus, EventBus,
    LedgerEvent, OutPoint, Reference, Result, RetryPolicy, TransactionId, TransactionType,
};
use tokio::sync::watch;

use crate::CycleReport;
use crate::allocator::AddressStore;
use crate::retry::with_backoff;

/// Service label used in errors and logs.
pub const CHAIN_SERVICE: &str = "chain-explorer";

// ---------------------------------------------------------------------------
// External API surface
// ---------------------------------------------------------------------------

/// One transaction output paying a scanned address, as the explorer
/// reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTxOut {
    pub txid: String,
    pub vout: u32,
    /// Output value in satoshis.
    pub value_minor: i64,
    pub confirmations: u32,
}

/// The block-explorer surface the adapter scans with. Tests substitute an
/// in-memory fake.
#[async_trait]
pub trait ChainExplorer: Send + Sync {
    /// All outputs paying `address`, confirmed or not.
    async fn address_transactions(&self, address: &str) -> Result<Vec<ChainTxOut>>;
}

#[async_trait]
impl<T: ChainExplorer + ?Sized> ChainExplorer for Arc<T> {
    async fn address_transactions(&self, address: &str) -> Result<Vec<ChainTxOut>> {
        (**self).address_transactions(address).await
    }
}

// ---------------------------------------------------------------------------
// Deposit table
// ---------------------------------------------------------------------------

struct Tables {
    deposits: HashMap<DepositId, Deposit>,
    by_outpoint: HashMap<OutPoint, DepositId>,
}

/// The deposit table. One row per observed `(txid, vout)` outpoint.
pub struct DepositStore {
    inner: Mutex<Tables>,
}

impl DepositStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables {
                deposits: HashMap::new(),
                by_outpoint: HashMap::new(),
            }),
        }
    }

    /// Register a newly observed output. The outpoint is the unique key: a
    /// second insert for the same `(txid, vout)` is an integrity violation,
    /// while other outputs of the same transaction are distinct deposits.
    pub fn insert(&self, deposit: Deposit) -> Result<Deposit> {
        let mut tables = self.lock();
        if tables.by_outpoint.contains_key(&deposit.outpoint) {
            return Err(ClearhouseError::DataIntegrityViolation {
                constraint: "deposit_outpoint_unique".to_string(),
                value: deposit.outpoint.to_string(),
            });
        }
        tables
            .by_outpoint
            .insert(deposit.outpoint.clone(), deposit.id);
        tables.deposits.insert(deposit.id, deposit.clone());
        Ok(deposit)
    }

    pub fn get(&self, deposit_id: DepositId) -> Result<Deposit> {
        self.lock()
            .deposits
            .get(&deposit_id)
            .cloned()
            .ok_or(ClearhouseError::DepositNotFound(deposit_id))
    }

    #[must_use]
    pub fn find_by_outpoint(&self, outpoint: &OutPoint) -> Option<Deposit> {
        let tables = self.lock();
        let id = tables.by_outpoint.get(outpoint)?;
        tables.deposits.get(id).cloned()
    }

    /// Update the confirmation count from a fresh scan.
    pub fn record_confirmations(&self, deposit_id: DepositId, confirmations: u32) -> Result<Deposit> {
        let mut tables = self.lock();
        let deposit = tables
            .deposits
            .get_mut(&deposit_id)
            .ok_or(ClearhouseError::DepositNotFound(deposit_id))?;
        if deposit.confirmations != confirmations {
            deposit.confirmations = confirmations;
            deposit.updated_at = Utc::now();
        }
        Ok(deposit.clone())
    }

    /// Move a deposit PENDING → CONFIRMED once the threshold is met.
    /// Returns whether this call moved it.
    pub fn mark_confirmed(&self, deposit_id: DepositId) -> Result<bool> {
        let mut tables = self.lock();
        let deposit = tables
            .deposits
            .get_mut(&deposit_id)
            .ok_or(ClearhouseError::DepositNotFound(deposit_id))?;
        if deposit.status != DepositStatus::Pending {
            return Ok(false);
        }
        deposit.status = DepositStatus::Confirmed;
        deposit.updated_at = Utc::now();
        Ok(true)
    }

    /// All deposits, unordered. Test and audit surface.
    #[must_use]
    pub fn all(&self) -> Vec<Deposit> {
        self.lock().deposits.values().cloned().collect()
    }

    /// Deposits still short of the confirmation threshold. Their addresses
    /// belong in the scan working set whatever the address status says.
    #[must_use]
    pub fn pending(&self) -> Vec<Deposit> {
        self.lock()
            .deposits
            .values()
            .filter(|d| d.status == DepositStatus::Pending)
            .cloned()
            .collect()
    }

    fn claim_credit(&self, deposit_id: DepositId) -> Result<ClaimOutcome> {
        let mut tables = self.lock();
        let deposit = tables
            .deposits
            .get_mut(&deposit_id)
            .ok_or(ClearhouseError::DepositNotFound(deposit_id))?;
        if deposit.wallet_credited {
            return Ok(ClaimOutcome::AlreadyCredited);
        }
        deposit.wallet_credited = true;
        deposit.updated_at = Utc::now();
        Ok(ClaimOutcome::Claimed)
    }

    fn rollback_credit(&self, deposit_id: DepositId) -> Result<()> {
        let mut tables = self.lock();
        let deposit = tables
            .deposits
            .get_mut(&deposit_id)
            .ok_or(ClearhouseError::DepositNotFound(deposit_id))?;
        deposit.wallet_credited = false;
        deposit.updated_at = Utc::now();
        Ok(())
    }

    fn record_credit(&self, deposit_id: DepositId, tx_id: TransactionId) -> Result<()> {
        let mut tables = self.lock();
        let deposit = tables
            .deposits
            .get_mut(&deposit_id)
            .ok_or(ClearhouseError::DepositNotFound(deposit_id))?;
        deposit.wallet_transaction_id = Some(tx_id);
        deposit.status = DepositStatus::Credited;
        deposit.updated_at = Utc::now();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().expect("deposit store lock poisoned")
    }
}

impl Default for DepositStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of one deposit row as a creditable funding source.
struct DepositCredit<'a> {
    store: &'a DepositStore,
    deposit_id: DepositId,
}

impl CreditSource for DepositCredit<'_> {
    fn claim(&self) -> Result<ClaimOutcome> {
        self.store.claim_credit(self.deposit_id)
    }

    fn rollback(&self) -> Result<()> {
        self.store.rollback_credit(self.deposit_id)
    }

    fn record(&self, tx_id: TransactionId) -> Result<()> {
        self.store.record_credit(self.deposit_id, tx_id)
    }

    fn describe(&self) -> String {
        self.deposit_id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Scans receive addresses and credits wallets for confirmed deposits.
pub struct ChainDepositAdapter<E> {
    explorer: E,
    addresses: Arc<AddressStore>,
    deposits: Arc<DepositStore>,
    ledger: Arc<LedgerStore>,
    events: EventBus,
    retry: RetryPolicy,
    confirmation_threshold: u32,
    poll_interval: Duration,
}

impl<E: ChainExplorer> ChainDepositAdapter<E> {
    #[must_use]
    pub fn new(
        explorer: E,
        config: &ChainConfig,
        retry: RetryPolicy,
        addresses: Arc<AddressStore>,
        deposits: Arc<DepositStore>,
        ledger: Arc<LedgerStore>,
        events: EventBus,
    ) -> Self {
        Self {
            explorer,
            addresses,
            deposits,
            ledger,
            events,
            retry,
            confirmation_threshold: config.confirmation_threshold,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// One scan cycle over all active addresses plus any retired address
    /// still carrying a pending deposit.
    ///
    /// An explorer failure for one address skips only that address; each
    /// output is then processed in isolation as well.
    pub async fn poll_once(&self) -> CycleReport {
        let mut report = CycleReport::default();
        for address in self.scan_set() {
            let outputs = with_backoff(&self.retry, "chain.address_transactions", || {
                self.explorer.address_transactions(&address.address)
            })
            .await;
            let outputs = match outputs {
                Ok(outputs) => outputs,
                Err(err) => {
                    tracing::warn!(
                        address = %address.address,
                        error = %err,
                        "address scan failed; retrying next cycle"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            for output in outputs {
                report.checked += 1;
                match self.observe(&address, output) {
                    Ok(true) => report.credited += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(
                            address = %address.address,
                            error = %err,
                            "deposit processing failed; retrying next cycle"
                        );
                        report.failed += 1;
                    }
                }
            }
        }
        tracing::debug!(
            checked = report.checked,
            credited = report.credited,
            failed = report.failed,
            "chain scan cycle complete"
        );
        report
    }

    /// Active addresses, plus the addresses of deposits still pending —
    /// a retired address must keep being scanned until every deposit on it
    /// has either been credited or abandoned by the chain.
    fn scan_set(&self) -> Vec<DepositAddress> {
        let mut set = self.addresses.active();
        let mut seen: HashSet<String> = set.iter().map(|a| a.address.clone()).collect();
        for deposit in self.deposits.pending() {
            if !seen.insert(deposit.address.clone()) {
                continue;
            }
            match self.addresses.get(&deposit.address) {
                Ok(record) => set.push(record),
                Err(err) => {
                    tracing::warn!(
                        deposit_id = %deposit.id,
                        address = %deposit.address,
                        error = %err,
                        "pending deposit on unknown address; skipping"
                    );
                }
            }
        }
        set
    }

    /// Register or refresh one observed output, then credit it if it just
    /// became creditworthy. Returns whether a wallet credit was applied.
    fn observe(&self, address: &DepositAddress, output: ChainTxOut) -> Result<bool> {
        let outpoint = OutPoint::new(output.txid, output.vout);
        let deposit = match self.deposits.find_by_outpoint(&outpoint) {
            Some(existing) => self
                .deposits
                .record_confirmations(existing.id, output.confirmations)?,
            None => {
                let wallet_id = self.addresses.wallet_for(&address.address)?;
                let deposit = self.deposits.insert(Deposit::new(
                    outpoint,
                    &address.address,
                    address.derivation_index,
                    wallet_id,
                    output.value_minor,
                    output.confirmations,
                ))?;
                tracing::info!(
                    deposit_id = %deposit.id,
                    outpoint = %deposit.outpoint,
                    amount_minor = deposit.amount_minor,
                    confirmations = deposit.confirmations,
                    "deposit observed"
                );
                deposit
            }
        };

        if !deposit.is_confirmed(self.confirmation_threshold) {
            return Ok(false);
        }
        if self.deposits.mark_confirmed(deposit.id)? {
            self.events.publish(LedgerEvent::DepositConfirmed {
                deposit_id: deposit.id,
                confirmations: deposit.confirmations,
            });
        }

        let current = self.deposits.get(deposit.id)?;
        if current.wallet_credited {
            return Ok(false);
        }

        let source = DepositCredit {
            store: self.deposits.as_ref(),
            deposit_id: deposit.id,
        };
        let outcome = self.ledger.credit_idempotent(
            &source,
            current.wallet_id,
            current.amount_minor,
            TransactionType::BtcDepositTopup,
            Reference::Deposit(deposit.id),
            &format!("deposit:{}", current.outpoint),
        )?;

        match outcome {
            CreditOutcome::Credited(_) => {
                self.events.publish(LedgerEvent::WalletCredited {
                    wallet_id: current.wallet_id,
                    amount_minor: current.amount_minor,
                    tx_type: TransactionType::BtcDepositTopup,
                    reference: Reference::Deposit(deposit.id),
                });
                Ok(true)
            }
            CreditOutcome::AlreadyCredited => Ok(false),
        }
    }

    /// Scan until `shutdown` flips true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            confirmation_threshold = self.confirmation_threshold,
            "chain deposit adapter started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("chain deposit adapter stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clearhouse_types::{AddressPurpose, Currency, MerchantId, WalletId};

    use super::*;
    use crate::allocator::{AddressAllocator, XpubDeriver};

    /// In-memory explorer: outputs keyed by address, plus per-address
    /// outage injection.
    #[derive(Default)]
    struct FakeExplorer {
        outputs: Mutex<HashMap<String, Vec<ChainTxOut>>>,
        fail_addresses: Mutex<Vec<String>>,
    }

    impl FakeExplorer {
        fn pay(&self, address: &str, txid: &str, vout: u32, value_minor: i64, confirmations: u32) {
            self.outputs
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_default()
                .push(ChainTxOut {
                    txid: txid.to_string(),
                    vout,
                    value_minor,
                    confirmations,
                });
        }

        fn confirm(&self, txid: &str, confirmations: u32) {
            for outputs in self.outputs.lock().unwrap().values_mut() {
                for out in outputs.iter_mut().filter(|o| o.txid == txid) {
                    out.confirmations = confirmations;
                }
            }
        }
    }

    #[async_trait]
    impl ChainExplorer for FakeExplorer {
        async fn address_transactions(&self, address: &str) -> Result<Vec<ChainTxOut>> {
            if self.fail_addresses.lock().unwrap().iter().any(|a| a == address) {
                return Err(ClearhouseError::ExternalUnavailable {
                    service: CHAIN_SERVICE.to_string(),
                    reason: "injected outage".to_string(),
                });
            }
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .unwrap_or_default())
        }
    }

    struct Fixture {
        adapter: ChainDepositAdapter<Arc<FakeExplorer>>,
        explorer: Arc<FakeExplorer>,
        addresses: Arc<AddressStore>,
        deposits: Arc<DepositStore>,
        ledger: Arc<LedgerStore>,
        allocator: AddressAllocator,
        wallet_id: WalletId,
    }

    fn setup() -> Fixture {
        let explorer = Arc::new(FakeExplorer::default());
        let addresses = Arc::new(AddressStore::new());
        let deposits = Arc::new(DepositStore::new());
        let ledger = Arc::new(LedgerStore::new(5));
        let wallet_id = ledger.open_wallet(MerchantId::new(), Currency::Btc);
        let allocator = AddressAllocator::new(
            Arc::new(XpubDeriver::new("xpub-chain-test").unwrap()),
            Arc::clone(&addresses),
            5,
        );
        let adapter = ChainDepositAdapter::new(
            Arc::clone(&explorer),
            &ChainConfig::default(), // threshold 3
            RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
            Arc::clone(&addresses),
            Arc::clone(&deposits),
            Arc::clone(&ledger),
            EventBus::new(),
        );
        Fixture {
            adapter,
            explorer,
            addresses,
            deposits,
            ledger,
            allocator,
            wallet_id,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deposit_is_registered_pending_below_threshold() {
        let f = setup();
        let addr = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        f.explorer.pay(&addr.address, "tx-a", 0, 150_000, 1);

        let report = f.adapter.poll_once().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.credited, 0);

        let deposit = f
            .deposits
            .find_by_outpoint(&OutPoint::new("tx-a", 0))
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Pending);
        assert_eq!(deposit.wallet_id, f.wallet_id);
        assert_eq!(f.ledger.wallet(f.wallet_id).unwrap().balance_minor, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_crossing_credits_exactly_once() {
        let f = setup();
        let addr = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        f.explorer.pay(&addr.address, "tx-b", 0, 150_000, 1);
        f.adapter.poll_once().await;

        f.explorer.confirm("tx-b", 3);
        let report = f.adapter.poll_once().await;
        assert_eq!(report.credited, 1);
        assert_eq!(f.ledger.wallet(f.wallet_id).unwrap().balance_minor, 150_000);

        // Replayed scans of the same outpoint are no-ops.
        f.explorer.confirm("tx-b", 12);
        let report = f.adapter.poll_once().await;
        assert_eq!(report.credited, 0);
        assert_eq!(f.ledger.wallet(f.wallet_id).unwrap().balance_minor, 150_000);
        assert_eq!(f.ledger.transactions(f.wallet_id).len(), 1);
        f.ledger.audit(f.wallet_id).unwrap();

        let deposit = f
            .deposits
            .find_by_outpoint(&OutPoint::new("tx-b", 0))
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Credited);
        assert!(deposit.wallet_transaction_id.is_some());
        assert_eq!(deposit.confirmations, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn one_transaction_funding_two_addresses_is_two_deposits() {
        let f = setup();
        let a = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        let b = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        f.explorer.pay(&a.address, "tx-c", 0, 40_000, 5);
        f.explorer.pay(&b.address, "tx-c", 1, 60_000, 5);

        let report = f.adapter.poll_once().await;
        assert_eq!(report.credited, 2);
        assert_eq!(f.deposits.all().len(), 2);
        assert_eq!(f.ledger.wallet(f.wallet_id).unwrap().balance_minor, 100_000);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_outpoint_insert_is_integrity_violation() {
        let f = setup();
        let deposit = Deposit::new(
            OutPoint::new("tx-d", 0),
            "addr-x",
            0,
            f.wallet_id,
            1_000,
            0,
        );
        f.deposits.insert(deposit).unwrap();

        let replay = Deposit::new(OutPoint::new("tx-d", 0), "addr-x", 0, f.wallet_id, 1_000, 0);
        assert!(matches!(
            f.deposits.insert(replay).unwrap_err(),
            ClearhouseError::DataIntegrityViolation { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retired_addresses_without_deposits_are_not_scanned() {
        let f = setup();
        let addr = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        f.explorer.pay(&addr.address, "tx-e", 0, 10_000, 5);
        f.addresses.retire(&addr.address).unwrap();

        let report = f.adapter.poll_once().await;
        assert_eq!(report.checked, 0);
        assert!(f.deposits.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_deposit_survives_address_retirement() {
        let f = setup();
        let addr = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        f.explorer.pay(&addr.address, "tx-g", 0, 30_000, 1);
        f.adapter.poll_once().await;

        // Retired below the threshold: the deposit is in flight and must
        // still be watched.
        f.addresses.retire(&addr.address).unwrap();
        f.explorer.confirm("tx-g", 3);

        let report = f.adapter.poll_once().await;
        assert_eq!(report.credited, 1);
        assert_eq!(f.ledger.wallet(f.wallet_id).unwrap().balance_minor, 30_000);

        // Once credited, the retired address drops out of the scan set.
        let report = f.adapter.poll_once().await;
        assert_eq!(report.checked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_address_does_not_block_the_cycle() {
        let f = setup();
        let broken = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        let healthy = f
            .allocator
            .allocate(AddressPurpose::Topup, f.wallet_id)
            .unwrap();
        f.explorer.pay(&healthy.address, "tx-f", 0, 20_000, 5);
        f.explorer
            .fail_addresses
            .lock()
            .unwrap()
            .push(broken.address.clone());

        let report = f.adapter.poll_once().await;
        assert_eq!(report.credited, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(f.ledger.wallet(f.wallet_id).unwrap().balance_minor, 20_000);
    }
}
