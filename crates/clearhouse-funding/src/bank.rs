//! Bank-invoice funding channel.
//!
//! Merchants fund their wallets by paying invoices issued through an
//! external banking API. The engine learns about payment two ways — the
//! periodic poll over open invoices and ad-hoc webhook notifications — and
//! both are funneled through the same fetch-verified, forward-only status
//! advance plus claim-guarded credit, so the channels can overlap or replay
//! freely without double-crediting. A webhook is never trusted on its own:
//! it only triggers the same re-fetch the poll performs.
//!
//! A failure while syncing one invoice is logged and skipped for the cycle;
//! it never aborts the rest of the poll, and the untouched credited flag
//! means the next cycle simply retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clearhouse_ledger::{ClaimOutcome, CreditOutcome, CreditSource, LedgerStore};
use clearhouse_types::{
    BankConfig, ClearhouseError, Currency, EventBus, Invoice, InvoiceId, InvoiceStatus,
    LedgerEvent, MerchantId, Reference, Result, RetryPolicy, TransactionId, TransactionType,
    WalletId,
};
use tokio::sync::watch;

use crate::CycleReport;
use crate::retry::with_backoff;

/// Service label used in errors and logs.
pub const BANK_SERVICE: &str = "bank";

// ---------------------------------------------------------------------------
// External API surface
// ---------------------------------------------------------------------------

/// An invoice as the external banking system reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInvoice {
    pub external_ref: String,
    pub status: InvoiceStatus,
    pub amount_minor: i64,
}

/// The banking API the adapter polls. Implementations wrap the real HTTP
/// client; tests substitute an in-memory fake.
#[async_trait]
pub trait BankApi: Send + Sync {
    /// Issue a new invoice under `account_id`; returns its external
    /// reference.
    async fn create_invoice(
        &self,
        account_id: &str,
        amount_minor: i64,
        currency: Currency,
    ) -> Result<String>;

    /// Fetch the current remote state of one invoice.
    async fn fetch_invoice(&self, account_id: &str, external_ref: &str) -> Result<RemoteInvoice>;

    /// Cancel an unpaid invoice remotely.
    async fn cancel_invoice(&self, account_id: &str, external_ref: &str) -> Result<()>;
}

#[async_trait]
impl<T: BankApi + ?Sized> BankApi for Arc<T> {
    async fn create_invoice(
        &self,
        account_id: &str,
        amount_minor: i64,
        currency: Currency,
    ) -> Result<String> {
        (**self).create_invoice(account_id, amount_minor, currency).await
    }

    async fn fetch_invoice(&self, account_id: &str, external_ref: &str) -> Result<RemoteInvoice> {
        (**self).fetch_invoice(account_id, external_ref).await
    }

    async fn cancel_invoice(&self, account_id: &str, external_ref: &str) -> Result<()> {
        (**self).cancel_invoice(account_id, external_ref).await
    }
}

// ---------------------------------------------------------------------------
// Invoice table
// ---------------------------------------------------------------------------

struct Tables {
    invoices: HashMap<InvoiceId, Invoice>,
    by_external_ref: HashMap<String, InvoiceId>,
}

/// The invoice table. Rows mutate only through conditional, forward-only
/// operations; the `wallet_credited` flag flips under the row lock.
pub struct InvoiceStore {
    inner: Mutex<Tables>,
}

impl InvoiceStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables {
                invoices: HashMap::new(),
                by_external_ref: HashMap::new(),
            }),
        }
    }

    /// Insert a new invoice. The external reference is unique — the banking
    /// system must never hand out the same one twice.
    pub fn insert(&self, invoice: Invoice) -> Result<()> {
        let mut tables = self.lock();
        if tables.by_external_ref.contains_key(&invoice.external_ref) {
            return Err(ClearhouseError::DataIntegrityViolation {
                constraint: "invoice_external_ref_unique".to_string(),
                value: invoice.external_ref,
            });
        }
        tables
            .by_external_ref
            .insert(invoice.external_ref.clone(), invoice.id);
        tables.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    pub fn get(&self, invoice_id: InvoiceId) -> Result<Invoice> {
        self.lock()
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or(ClearhouseError::InvoiceNotFound(invoice_id))
    }

    #[must_use]
    pub fn find_by_external_ref(&self, external_ref: &str) -> Option<Invoice> {
        let tables = self.lock();
        let id = tables.by_external_ref.get(external_ref)?;
        tables.invoices.get(id).cloned()
    }

    /// Invoices the external system may still move; the poll working set.
    #[must_use]
    pub fn open(&self) -> Vec<Invoice> {
        self.lock()
            .invoices
            .values()
            .filter(|inv| inv.status.is_open())
            .cloned()
            .collect()
    }

    /// Apply an observed external status, forward-only.
    ///
    /// Returns whether the row moved; a stale observation (re-polled UNPAID
    /// after PAID, an out-of-order webhook) is dropped as a no-op.
    pub fn advance(&self, invoice_id: InvoiceId, observed: InvoiceStatus) -> Result<bool> {
        let mut tables = self.lock();
        let invoice = tables
            .invoices
            .get_mut(&invoice_id)
            .ok_or(ClearhouseError::InvoiceNotFound(invoice_id))?;
        if invoice.status == observed {
            return Ok(false);
        }
        if !invoice.status.may_advance_to(observed) {
            tracing::debug!(
                %invoice_id,
                current = %invoice.status,
                observed = %observed,
                "stale invoice observation dropped"
            );
            return Ok(false);
        }
        invoice.status = observed;
        invoice.updated_at = Utc::now();
        Ok(true)
    }

    fn claim_credit(&self, invoice_id: InvoiceId) -> Result<ClaimOutcome> {
        let mut tables = self.lock();
        let invoice = tables
            .invoices
            .get_mut(&invoice_id)
            .ok_or(ClearhouseError::InvoiceNotFound(invoice_id))?;
        if invoice.wallet_credited {
            return Ok(ClaimOutcome::AlreadyCredited);
        }
        invoice.wallet_credited = true;
        invoice.updated_at = Utc::now();
        Ok(ClaimOutcome::Claimed)
    }

    fn rollback_credit(&self, invoice_id: InvoiceId) -> Result<()> {
        let mut tables = self.lock();
        let invoice = tables
            .invoices
            .get_mut(&invoice_id)
            .ok_or(ClearhouseError::InvoiceNotFound(invoice_id))?;
        invoice.wallet_credited = false;
        invoice.updated_at = Utc::now();
        Ok(())
    }

    fn record_credit(&self, invoice_id: InvoiceId, tx_id: TransactionId) -> Result<()> {
        let mut tables = self.lock();
        let invoice = tables
            .invoices
            .get_mut(&invoice_id)
            .ok_or(ClearhouseError::InvoiceNotFound(invoice_id))?;
        invoice.wallet_transaction_id = Some(tx_id);
        invoice.updated_at = Utc::now();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().expect("invoice store lock poisoned")
    }
}

impl Default for InvoiceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of one invoice row as a creditable funding source.
struct InvoiceCredit<'a> {
    store: &'a InvoiceStore,
    invoice_id: InvoiceId,
}

impl CreditSource for InvoiceCredit<'_> {
    fn claim(&self) -> Result<ClaimOutcome> {
        self.store.claim_credit(self.invoice_id)
    }

    fn rollback(&self) -> Result<()> {
        self.store.rollback_credit(self.invoice_id)
    }

    fn record(&self, tx_id: TransactionId) -> Result<()> {
        self.store.record_credit(self.invoice_id, tx_id)
    }

    fn describe(&self) -> String {
        self.invoice_id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Syncs bank invoices against the external banking API and credits
/// merchant wallets when they are paid.
pub struct BankInvoiceAdapter<B> {
    api: B,
    /// The banking account invoices are issued under. Resolved once from
    /// configuration; [`replace_account_id`](Self::replace_account_id) is
    /// the only way it changes afterwards.
    account_id: Mutex<String>,
    invoices: Arc<InvoiceStore>,
    ledger: Arc<LedgerStore>,
    events: EventBus,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl<B: BankApi> BankInvoiceAdapter<B> {
    pub fn new(
        api: B,
        config: &BankConfig,
        retry: RetryPolicy,
        invoices: Arc<InvoiceStore>,
        ledger: Arc<LedgerStore>,
        events: EventBus,
    ) -> Result<Self> {
        if config.account_id.trim().is_empty() {
            return Err(ClearhouseError::Configuration(
                "bank account id is not configured".to_string(),
            ));
        }
        Ok(Self {
            api,
            account_id: Mutex::new(config.account_id.clone()),
            invoices,
            ledger,
            events,
            retry,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    #[must_use]
    pub fn account_id(&self) -> String {
        self.account_id
            .lock()
            .expect("account id lock poisoned")
            .clone()
    }

    /// Swap the banking account. Open invoices keep the references they were
    /// issued under; only new API calls use the replacement.
    pub fn replace_account_id(&self, account_id: impl Into<String>) {
        let account_id = account_id.into();
        tracing::info!(account_id, "bank account id replaced");
        *self.account_id.lock().expect("account id lock poisoned") = account_id;
    }

    /// Issue a funding invoice for a merchant wallet.
    pub async fn open_invoice(
        &self,
        merchant_id: MerchantId,
        wallet_id: WalletId,
        amount_minor: i64,
        currency: Currency,
    ) -> Result<Invoice> {
        if amount_minor <= 0 {
            return Err(ClearhouseError::InvalidAmount { amount_minor });
        }
        let account = self.account_id();
        let external_ref = with_backoff(&self.retry, "bank.create_invoice", || {
            self.api.create_invoice(&account, amount_minor, currency)
        })
        .await?;

        let invoice = Invoice::new(merchant_id, wallet_id, external_ref, amount_minor, currency);
        self.invoices.insert(invoice.clone())?;
        tracing::info!(
            invoice_id = %invoice.id,
            external_ref = %invoice.external_ref,
            amount_minor,
            "funding invoice opened"
        );
        Ok(invoice)
    }

    /// Cancel an open invoice remotely and locally. A paid invoice can no
    /// longer be cancelled.
    pub async fn cancel_invoice(&self, invoice_id: InvoiceId) -> Result<Invoice> {
        let invoice = self.invoices.get(invoice_id)?;
        if !invoice.status.is_open() {
            return Err(ClearhouseError::Internal(format!(
                "{invoice_id}: cannot cancel a {} invoice",
                invoice.status
            )));
        }
        let account = self.account_id();
        with_backoff(&self.retry, "bank.cancel_invoice", || {
            self.api.cancel_invoice(&account, &invoice.external_ref)
        })
        .await?;
        self.invoices.advance(invoice_id, InvoiceStatus::Cancelled)?;
        self.invoices.get(invoice_id)
    }

    /// One poll cycle over all open invoices.
    ///
    /// Each invoice is synced in isolation: a failure is logged, counted,
    /// and retried next cycle without touching the rest of the batch.
    pub async fn poll_once(&self) -> CycleReport {
        let mut report = CycleReport::default();
        for invoice in self.invoices.open() {
            report.checked += 1;
            match self.sync_invoice(&invoice).await {
                Ok(true) => report.credited += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        invoice_id = %invoice.id,
                        external_ref = %invoice.external_ref,
                        error = %err,
                        "invoice sync failed; retrying next cycle"
                    );
                    report.failed += 1;
                }
            }
        }
        tracing::debug!(
            checked = report.checked,
            credited = report.credited,
            failed = report.failed,
            "bank poll cycle complete"
        );
        report
    }

    /// React to a pushed notification from the bank's webhook.
    ///
    /// The pushed status is a hint, never truth: the invoice is re-fetched
    /// from the bank and the fetched state — amount cross-check included —
    /// is what drives the advance and credit, exactly like a poll. A forged
    /// or replayed delivery therefore cannot credit anything the bank does
    /// not confirm.
    ///
    /// Returns whether a wallet credit was applied.
    pub async fn handle_webhook(&self, external_ref: &str, pushed: InvoiceStatus) -> Result<bool> {
        let invoice = self.invoices.find_by_external_ref(external_ref).ok_or_else(|| {
            ClearhouseError::DataIntegrityViolation {
                constraint: "invoice_external_ref_known".to_string(),
                value: external_ref.to_string(),
            }
        })?;
        tracing::debug!(
            invoice_id = %invoice.id,
            %pushed,
            "webhook received; verifying against the bank"
        );
        self.sync_invoice(&invoice).await
    }

    async fn sync_invoice(&self, invoice: &Invoice) -> Result<bool> {
        let account = self.account_id();
        let remote = with_backoff(&self.retry, "bank.fetch_invoice", || {
            self.api.fetch_invoice(&account, &invoice.external_ref)
        })
        .await?;

        if remote.status == InvoiceStatus::Paid && remote.amount_minor != invoice.amount_minor {
            return Err(ClearhouseError::DataIntegrityViolation {
                constraint: "invoice_amount_matches_remote".to_string(),
                value: format!(
                    "{}: local {} remote {}",
                    invoice.id, invoice.amount_minor, remote.amount_minor
                ),
            });
        }
        self.apply_observation(invoice.id, remote.status)
    }

    /// Advance the invoice and credit the wallet if it just became payable.
    fn apply_observation(&self, invoice_id: InvoiceId, observed: InvoiceStatus) -> Result<bool> {
        self.invoices.advance(invoice_id, observed)?;
        let invoice = self.invoices.get(invoice_id)?;
        if invoice.status != InvoiceStatus::Paid || invoice.wallet_credited {
            return Ok(false);
        }

        let source = InvoiceCredit {
            store: self.invoices.as_ref(),
            invoice_id,
        };
        let outcome = self.ledger.credit_idempotent(
            &source,
            invoice.wallet_id,
            invoice.amount_minor,
            TransactionType::Topup,
            Reference::Invoice(invoice_id),
            &invoice_id.to_string(),
        )?;

        match outcome {
            CreditOutcome::Credited(_) => {
                self.events.publish(LedgerEvent::InvoicePaid { invoice_id });
                self.events.publish(LedgerEvent::WalletCredited {
                    wallet_id: invoice.wallet_id,
                    amount_minor: invoice.amount_minor,
                    tx_type: TransactionType::Topup,
                    reference: Reference::Invoice(invoice_id),
                });
                Ok(true)
            }
            CreditOutcome::AlreadyCredited => Ok(false),
        }
    }

    /// Poll until `shutdown` flips true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "bank invoice adapter started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("bank invoice adapter stopping");
                        return;
                    }
                }
            }
        }
    }
}
