//! Idempotent crediting from asynchronous funding sources.
//!
//! The credit path has two serialization points: the wallet row (conditional
//! balance update) and the funding record's `wallet_credited` flag. The flag
//! is claimed first — a conditional flip from false to true — so a replayed
//! observation of the same invoice or deposit is a no-op success. If the
//! balance credit fails after a successful claim, the claim is rolled back;
//! the flag must never be left stuck claimed-but-uncredited, or the next
//! poll cycle could not retry.

use clearhouse_types::{
    ClearhouseError, Reference, Result, TransactionId, TransactionType, WalletId,
    WalletTransaction,
};

use crate::store::LedgerStore;

/// Result of the atomic claim on a funding record's credited flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The flag flipped false → true; this caller owns the credit.
    Claimed,
    /// The flag was already true; someone credited this record before.
    AlreadyCredited,
}

/// Result of an idempotent credit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    /// The wallet was credited and one ledger entry recorded.
    Credited(WalletTransaction),
    /// The source was credited previously; nothing changed. A success.
    AlreadyCredited,
}

/// The seam between the ledger and a fundable record (invoice, deposit).
///
/// Implementations perform each method as an atomic conditional update on
/// the backing record.
pub trait CreditSource: Send + Sync {
    /// Flip the credited flag false → true only if currently false.
    fn claim(&self) -> Result<ClaimOutcome>;

    /// Undo a claim after a failed credit so the next cycle retries.
    fn rollback(&self) -> Result<()>;

    /// Record the ledger entry produced by the credit on the source.
    fn record(&self, tx_id: TransactionId) -> Result<()>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

impl LedgerStore {
    /// Credit a wallet from a funding source, exactly once per source.
    ///
    /// Safe to call any number of times for the same record: only the call
    /// that wins the claim applies a balance change; every other call
    /// returns [`CreditOutcome::AlreadyCredited`].
    pub fn credit_idempotent(
        &self,
        source: &dyn CreditSource,
        wallet_id: WalletId,
        amount_minor: i64,
        tx_type: TransactionType,
        reference: Reference,
        idempotency_key: &str,
    ) -> Result<CreditOutcome> {
        if amount_minor <= 0 {
            return Err(ClearhouseError::InvalidAmount { amount_minor });
        }

        match source.claim()? {
            ClaimOutcome::AlreadyCredited => {
                tracing::debug!(source = %source.describe(), "credit replay, no-op");
                return Ok(CreditOutcome::AlreadyCredited);
            }
            ClaimOutcome::Claimed => {}
        }

        let applied = self.apply_delta(
            wallet_id,
            amount_minor,
            tx_type,
            reference,
            Some(idempotency_key),
            None,
        );

        match applied {
            Ok(tx) => {
                source.record(tx.id)?;
                tracing::info!(
                    source = %source.describe(),
                    %wallet_id,
                    amount_minor,
                    %tx_type,
                    "wallet credited"
                );
                Ok(CreditOutcome::Credited(tx))
            }
            Err(err) => {
                if let Err(rollback_err) = source.rollback() {
                    // Both the credit and the rollback failed. The flag may
                    // be stuck until an operator intervenes; make it loud.
                    tracing::error!(
                        source = %source.describe(),
                        error = %rollback_err,
                        "claim rollback failed after credit failure"
                    );
                } else {
                    tracing::warn!(
                        source = %source.describe(),
                        error = %err,
                        "credit failed, claim rolled back for next cycle"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use clearhouse_types::{Currency, InvoiceId, MerchantId};

    use super::*;

    /// In-memory stand-in for an invoice/deposit row.
    struct FakeSource {
        credited: Mutex<bool>,
        recorded: Mutex<Option<TransactionId>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                credited: Mutex::new(false),
                recorded: Mutex::new(None),
            }
        }
    }

    impl CreditSource for FakeSource {
        fn claim(&self) -> Result<ClaimOutcome> {
            let mut credited = self.credited.lock().unwrap();
            if *credited {
                Ok(ClaimOutcome::AlreadyCredited)
            } else {
                *credited = true;
                Ok(ClaimOutcome::Claimed)
            }
        }

        fn rollback(&self) -> Result<()> {
            *self.credited.lock().unwrap() = false;
            Ok(())
        }

        fn record(&self, tx_id: TransactionId) -> Result<()> {
            *self.recorded.lock().unwrap() = Some(tx_id);
            Ok(())
        }

        fn describe(&self) -> String {
            "fake-source".to_string()
        }
    }

    fn setup() -> (LedgerStore, WalletId) {
        let store = LedgerStore::new(5);
        let wallet_id = store.open_wallet(MerchantId::new(), Currency::Usd);
        (store, wallet_id)
    }

    #[test]
    fn first_credit_applies_once() {
        let (store, wallet_id) = setup();
        let source = FakeSource::new();
        let reference = Reference::Invoice(InvoiceId::new());

        let outcome = store
            .credit_idempotent(
                &source,
                wallet_id,
                25_000,
                TransactionType::Topup,
                reference,
                "invoice:1",
            )
            .unwrap();

        let CreditOutcome::Credited(tx) = outcome else {
            panic!("expected Credited");
        };
        assert_eq!(tx.amount_minor, 25_000);
        assert_eq!(store.wallet(wallet_id).unwrap().balance_minor, 25_000);
        assert_eq!(*source.recorded.lock().unwrap(), Some(tx.id));
    }

    #[test]
    fn replayed_credit_is_noop_success() {
        let (store, wallet_id) = setup();
        let source = FakeSource::new();
        let reference = Reference::Invoice(InvoiceId::new());

        store
            .credit_idempotent(
                &source,
                wallet_id,
                25_000,
                TransactionType::Topup,
                reference,
                "invoice:2",
            )
            .unwrap();
        let replay = store
            .credit_idempotent(
                &source,
                wallet_id,
                25_000,
                TransactionType::Topup,
                reference,
                "invoice:2",
            )
            .unwrap();

        assert_eq!(replay, CreditOutcome::AlreadyCredited);
        // Exactly one transaction and one balance change.
        assert_eq!(store.transactions(wallet_id).len(), 1);
        assert_eq!(store.wallet(wallet_id).unwrap().balance_minor, 25_000);
        store.audit(wallet_id).unwrap();
    }

    #[test]
    fn failed_credit_rolls_back_claim() {
        let (store, wallet_id) = setup();
        store.close_wallet(wallet_id).unwrap(); // force the delta to fail
        let source = FakeSource::new();

        let err = store
            .credit_idempotent(
                &source,
                wallet_id,
                1_000,
                TransactionType::Topup,
                Reference::Invoice(InvoiceId::new()),
                "invoice:3",
            )
            .unwrap_err();
        assert!(matches!(err, ClearhouseError::WalletClosed(_)));

        // Flag is back to uncredited so the next cycle retries.
        assert!(!*source.credited.lock().unwrap());
    }

    #[test]
    fn non_positive_credit_rejected_before_claim() {
        let (store, wallet_id) = setup();
        let source = FakeSource::new();
        let err = store
            .credit_idempotent(
                &source,
                wallet_id,
                0,
                TransactionType::Topup,
                Reference::Manual,
                "invoice:4",
            )
            .unwrap_err();
        assert!(matches!(err, ClearhouseError::InvalidAmount { .. }));
        assert!(!*source.credited.lock().unwrap());
    }
}
