//! Wallet table and transaction log.
//!
//! The store models a relational table with row-level conditional updates:
//! the internal lock spans exactly one row operation, and cross-operation
//! coordination happens through the compare-and-swap on the read balance
//! value — never through locks held across an operation. Handlers on other
//! threads (or, with a SQL backend, other processes) serialize on the wallet
//! row only at the moment of the conditional write.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use clearhouse_types::{
    ClearhouseError, Currency, MerchantId, Reference, Result, TransactionId, TransactionType,
    WalletAccount, WalletId, WalletStatus, WalletTransaction,
};

#[derive(Default)]
struct Tables {
    wallets: HashMap<WalletId, WalletAccount>,
    by_owner: HashMap<(MerchantId, Currency), WalletId>,
    /// Append-only. Entries are never mutated or deleted.
    transactions: Vec<WalletTransaction>,
    /// Unique index over `WalletTransaction::idempotency_key`.
    idempotency_keys: HashSet<String>,
}

/// The durable wallet store. `Arc`-shareable across handlers.
pub struct LedgerStore {
    inner: Mutex<Tables>,
    /// Bound on the `apply_delta` read-compute-write retry loop.
    max_cas_retries: u32,
}

impl LedgerStore {
    #[must_use]
    pub fn new(max_cas_retries: u32) -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
            max_cas_retries,
        }
    }

    /// Get or lazily create the wallet for a (merchant, currency) pair.
    /// Idempotent: repeated calls return the same wallet.
    pub fn open_wallet(&self, merchant_id: MerchantId, currency: Currency) -> WalletId {
        let mut tables = self.lock();
        if let Some(id) = tables.by_owner.get(&(merchant_id, currency)) {
            return *id;
        }
        let wallet = WalletAccount::new(merchant_id, currency);
        let id = wallet.id;
        tables.by_owner.insert((merchant_id, currency), id);
        tables.wallets.insert(id, wallet);
        id
    }

    /// Snapshot read of a wallet row.
    pub fn wallet(&self, wallet_id: WalletId) -> Result<WalletAccount> {
        let tables = self.lock();
        tables
            .wallets
            .get(&wallet_id)
            .cloned()
            .ok_or(ClearhouseError::WalletNotFound(wallet_id))
    }

    /// Look up a merchant's wallet for a currency, if it exists.
    pub fn find_wallet(&self, merchant_id: MerchantId, currency: Currency) -> Option<WalletId> {
        self.lock().by_owner.get(&(merchant_id, currency)).copied()
    }

    /// Flag a wallet closed. Wallets are never deleted.
    pub fn close_wallet(&self, wallet_id: WalletId) -> Result<()> {
        let mut tables = self.lock();
        let wallet = tables
            .wallets
            .get_mut(&wallet_id)
            .ok_or(ClearhouseError::WalletNotFound(wallet_id))?;
        wallet.status = WalletStatus::Closed;
        wallet.updated_at = Utc::now();
        Ok(())
    }

    /// Increase `reserved_minor` by `amount_minor`. Atomic with respect to
    /// concurrent reservations on the same wallet. No capacity check at this
    /// layer — capacity policy lives in order intake.
    pub fn reserve(&self, wallet_id: WalletId, amount_minor: i64) -> Result<()> {
        if amount_minor <= 0 {
            return Err(ClearhouseError::InvalidAmount { amount_minor });
        }
        let mut tables = self.lock();
        let wallet = tables
            .wallets
            .get_mut(&wallet_id)
            .ok_or(ClearhouseError::WalletNotFound(wallet_id))?;
        if !wallet.is_active() {
            return Err(ClearhouseError::WalletClosed(wallet_id));
        }
        wallet.reserved_minor += amount_minor;
        wallet.updated_at = Utc::now();
        Ok(())
    }

    /// Decrease `reserved_minor` by `amount_minor`, floored at zero.
    /// A double-release therefore cannot drive the reservation negative.
    pub fn release(&self, wallet_id: WalletId, amount_minor: i64) -> Result<()> {
        if amount_minor <= 0 {
            return Err(ClearhouseError::InvalidAmount { amount_minor });
        }
        let mut tables = self.lock();
        let wallet = tables
            .wallets
            .get_mut(&wallet_id)
            .ok_or(ClearhouseError::WalletNotFound(wallet_id))?;
        wallet.reserved_minor = (wallet.reserved_minor - amount_minor).max(0);
        wallet.updated_at = Utc::now();
        Ok(())
    }

    /// The sole mutation path for `balance_minor`: a conditional update.
    ///
    /// Writes `expected_balance_minor + amount_minor` only if the stored
    /// balance still equals `expected_balance_minor`, and appends exactly one
    /// ledger entry (with `balance_after_minor` computed under the same row
    /// lock) in the same logical operation.
    ///
    /// # Errors
    /// - `ConcurrentModification` if the stored balance no longer matches —
    ///   the caller must retry the whole read-compute-write cycle.
    /// - `DataIntegrityViolation` if `idempotency_key` was already used.
    #[allow(clippy::too_many_arguments)]
    pub fn try_apply_delta(
        &self,
        wallet_id: WalletId,
        expected_balance_minor: i64,
        amount_minor: i64,
        tx_type: TransactionType,
        reference: Reference,
        idempotency_key: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<WalletTransaction> {
        if amount_minor == 0 {
            return Err(ClearhouseError::InvalidAmount { amount_minor });
        }
        let mut tables = self.lock();

        if let Some(key) = idempotency_key {
            if tables.idempotency_keys.contains(key) {
                return Err(ClearhouseError::DataIntegrityViolation {
                    constraint: "wallet_transaction.idempotency_key".to_string(),
                    value: key.to_string(),
                });
            }
        }

        let wallet = tables
            .wallets
            .get_mut(&wallet_id)
            .ok_or(ClearhouseError::WalletNotFound(wallet_id))?;
        if !wallet.is_active() {
            return Err(ClearhouseError::WalletClosed(wallet_id));
        }
        if wallet.balance_minor != expected_balance_minor {
            return Err(ClearhouseError::ConcurrentModification {
                resource: wallet_id.to_string(),
            });
        }

        let balance_after = expected_balance_minor + amount_minor;
        wallet.balance_minor = balance_after;
        wallet.updated_at = Utc::now();

        let entry = WalletTransaction {
            id: TransactionId::new(),
            wallet_id,
            tx_type,
            amount_minor,
            balance_after_minor: balance_after,
            reference,
            idempotency_key: idempotency_key.map(ToString::to_string),
            metadata,
            created_at: Utc::now(),
        };
        if let Some(key) = &entry.idempotency_key {
            tables.idempotency_keys.insert(key.clone());
        }
        tables.transactions.push(entry.clone());
        Ok(entry)
    }

    /// Read-compute-write loop over [`try_apply_delta`](Self::try_apply_delta):
    /// each attempt reads a fresh balance. Bounded by `max_cas_retries`;
    /// exhaustion is fatal for the operation (never silently dropped, since
    /// money is at stake).
    pub fn apply_delta(
        &self,
        wallet_id: WalletId,
        amount_minor: i64,
        tx_type: TransactionType,
        reference: Reference,
        idempotency_key: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<WalletTransaction> {
        for _attempt in 0..self.max_cas_retries {
            let snapshot = self.wallet(wallet_id)?;
            match self.try_apply_delta(
                wallet_id,
                snapshot.balance_minor,
                amount_minor,
                tx_type,
                reference,
                idempotency_key,
                metadata.clone(),
            ) {
                Err(ClearhouseError::ConcurrentModification { .. }) => {
                    tracing::debug!(%wallet_id, "conditional update lost race, retrying");
                }
                other => return other,
            }
        }
        Err(ClearhouseError::RetriesExhausted {
            resource: wallet_id.to_string(),
            attempts: self.max_cas_retries,
        })
    }

    /// All ledger entries for a wallet, oldest first.
    #[must_use]
    pub fn transactions(&self, wallet_id: WalletId) -> Vec<WalletTransaction> {
        self.lock()
            .transactions
            .iter()
            .filter(|tx| tx.wallet_id == wallet_id)
            .cloned()
            .collect()
    }

    /// Verify the ledger invariant for one wallet: the running sum of entry
    /// amounts equals the stored balance, and each entry's snapshot matches
    /// the sum at its position.
    pub fn audit(&self, wallet_id: WalletId) -> Result<()> {
        let tables = self.lock();
        let wallet = tables
            .wallets
            .get(&wallet_id)
            .ok_or(ClearhouseError::WalletNotFound(wallet_id))?;

        let mut running = 0i64;
        for tx in tables.transactions.iter().filter(|t| t.wallet_id == wallet_id) {
            running += tx.amount_minor;
            if tx.balance_after_minor != running {
                return Err(ClearhouseError::LedgerInvariantViolation {
                    wallet_id,
                    balance_minor: tx.balance_after_minor,
                    entry_sum_minor: running,
                });
            }
        }
        if running != wallet.balance_minor {
            return Err(ClearhouseError::LedgerInvariantViolation {
                wallet_id,
                balance_minor: wallet.balance_minor,
                entry_sum_minor: running,
            });
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock means a panic mid-row-update; the tables may be
        // inconsistent and continuing would corrupt money state.
        self.inner.lock().expect("ledger store lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    fn store_with_wallet(balance: i64) -> (LedgerStore, WalletId) {
        let store = LedgerStore::new(5);
        let wallet_id = store.open_wallet(MerchantId::new(), Currency::Usd);
        if balance != 0 {
            store
                .apply_delta(
                    wallet_id,
                    balance,
                    TransactionType::Adjustment,
                    Reference::Manual,
                    None,
                    None,
                )
                .unwrap();
        }
        (store, wallet_id)
    }

    #[test]
    fn open_wallet_is_idempotent_per_pair() {
        let store = LedgerStore::new(5);
        let merchant = MerchantId::new();
        let a = store.open_wallet(merchant, Currency::Usd);
        let b = store.open_wallet(merchant, Currency::Usd);
        assert_eq!(a, b);

        let btc = store.open_wallet(merchant, Currency::Btc);
        assert_ne!(a, btc);
    }

    #[test]
    fn apply_delta_appends_entry_with_snapshot() {
        let (store, wallet_id) = store_with_wallet(0);
        let tx = store
            .apply_delta(
                wallet_id,
                25_000,
                TransactionType::Topup,
                Reference::Manual,
                None,
                None,
            )
            .unwrap();
        assert_eq!(tx.amount_minor, 25_000);
        assert_eq!(tx.balance_after_minor, 25_000);
        assert_eq!(store.wallet(wallet_id).unwrap().balance_minor, 25_000);
        store.audit(wallet_id).unwrap();
    }

    #[test]
    fn stale_expected_balance_is_rejected() {
        let (store, wallet_id) = store_with_wallet(10_000);
        let stale = store.wallet(wallet_id).unwrap().balance_minor;

        // Another handler wins the race.
        store
            .try_apply_delta(
                wallet_id,
                stale,
                500,
                TransactionType::Adjustment,
                Reference::Manual,
                None,
                None,
            )
            .unwrap();

        let err = store
            .try_apply_delta(
                wallet_id,
                stale,
                -300,
                TransactionType::Adjustment,
                Reference::Manual,
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ClearhouseError::ConcurrentModification { .. }));

        // Balance reflects only the winning write.
        assert_eq!(store.wallet(wallet_id).unwrap().balance_minor, 10_500);
        store.audit(wallet_id).unwrap();
    }

    #[test]
    fn concurrent_apply_deltas_converge() {
        let (store, wallet_id) = store_with_wallet(1_000);
        let store = Arc::new(store);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [700i64, -300i64]
            .into_iter()
            .map(|delta| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store.apply_delta(
                        wallet_id,
                        delta,
                        TransactionType::Adjustment,
                        Reference::Manual,
                        None,
                        None,
                    )
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // Equal to applying both deltas sequentially.
        assert_eq!(store.wallet(wallet_id).unwrap().balance_minor, 1_400);
        store.audit(wallet_id).unwrap();
    }

    #[test]
    fn same_read_balance_exactly_one_wins() {
        let (store, wallet_id) = store_with_wallet(5_000);
        let read = store.wallet(wallet_id).unwrap().balance_minor;

        let first = store.try_apply_delta(
            wallet_id,
            read,
            100,
            TransactionType::Adjustment,
            Reference::Manual,
            None,
            None,
        );
        let second = store.try_apply_delta(
            wallet_id,
            read,
            100,
            TransactionType::Adjustment,
            Reference::Manual,
            None,
            None,
        );
        assert!(first.is_ok());
        assert!(matches!(
            second.unwrap_err(),
            ClearhouseError::ConcurrentModification { .. }
        ));
    }

    #[test]
    fn duplicate_idempotency_key_is_integrity_violation() {
        let (store, wallet_id) = store_with_wallet(0);
        store
            .apply_delta(
                wallet_id,
                1_000,
                TransactionType::Topup,
                Reference::Manual,
                Some("invoice:abc"),
                None,
            )
            .unwrap();
        let err = store
            .apply_delta(
                wallet_id,
                1_000,
                TransactionType::Topup,
                Reference::Manual,
                Some("invoice:abc"),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ClearhouseError::DataIntegrityViolation { .. }
        ));
        // Exactly one entry and one balance change.
        assert_eq!(store.transactions(wallet_id).len(), 1);
        assert_eq!(store.wallet(wallet_id).unwrap().balance_minor, 1_000);
    }

    #[test]
    fn reserve_and_release_floor_at_zero() {
        let (store, wallet_id) = store_with_wallet(10_000);
        store.reserve(wallet_id, 4_000).unwrap();
        assert_eq!(store.wallet(wallet_id).unwrap().reserved_minor, 4_000);

        store.release(wallet_id, 4_000).unwrap();
        assert_eq!(store.wallet(wallet_id).unwrap().reserved_minor, 0);

        // Defensive double-release.
        store.release(wallet_id, 4_000).unwrap();
        assert_eq!(store.wallet(wallet_id).unwrap().reserved_minor, 0);
    }

    #[test]
    fn reserve_rejects_non_positive_amounts() {
        let (store, wallet_id) = store_with_wallet(0);
        assert!(matches!(
            store.reserve(wallet_id, 0).unwrap_err(),
            ClearhouseError::InvalidAmount { .. }
        ));
        assert!(matches!(
            store.reserve(wallet_id, -5).unwrap_err(),
            ClearhouseError::InvalidAmount { .. }
        ));
    }

    #[test]
    fn closed_wallet_refuses_mutation() {
        let (store, wallet_id) = store_with_wallet(1_000);
        store.close_wallet(wallet_id).unwrap();

        assert!(matches!(
            store.reserve(wallet_id, 100).unwrap_err(),
            ClearhouseError::WalletClosed(_)
        ));
        assert!(matches!(
            store
                .apply_delta(
                    wallet_id,
                    100,
                    TransactionType::Topup,
                    Reference::Manual,
                    None,
                    None,
                )
                .unwrap_err(),
            ClearhouseError::WalletClosed(_)
        ));
    }

    #[test]
    fn audit_detects_tampering() {
        let (store, wallet_id) = store_with_wallet(2_000);
        store.audit(wallet_id).unwrap();

        // Corrupt the stored balance behind the primitive's back.
        store
            .inner
            .lock()
            .unwrap()
            .wallets
            .get_mut(&wallet_id)
            .unwrap()
            .balance_minor = 9_999;
        let err = store.audit(wallet_id).unwrap_err();
        assert!(matches!(
            err,
            ClearhouseError::LedgerInvariantViolation { .. }
        ));
    }

    #[test]
    fn unknown_wallet_errors() {
        let store = LedgerStore::new(5);
        let missing = WalletId::new();
        assert!(matches!(
            store.wallet(missing).unwrap_err(),
            ClearhouseError::WalletNotFound(_)
        ));
        assert!(matches!(
            store.release(missing, 10).unwrap_err(),
            ClearhouseError::WalletNotFound(_)
        ));
    }
}
