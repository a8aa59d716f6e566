//! Deterministic receive-address allocation.
//!
//! Addresses are a pure function of (extended public key, purpose, index):
//! re-deriving the same coordinates always yields the same address, so the
//! only mutable state is the per-purpose `next_index` counter. The counter
//! advances through a conditional update — an allocator that raced another
//! one re-reads and re-derives rather than burning or reusing an index.
//! The store enforces global address uniqueness and per-purpose index
//! uniqueness at insert; a violation there means the derivation itself is
//! defective and is reported as a data-integrity error, never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use clearhouse_types::{
    AddressPurpose, ClearhouseError, DepositAddress, Result, WalletId,
};
use sha2::{Digest, Sha256};

/// Domain tag for address derivation hashing.
const DERIVATION_TAG: &[u8] = b"clearhouse:address:v1:";

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derives an address string from purpose-scoped coordinates.
pub trait AddressDeriver: Send + Sync {
    /// Derive the address at `(purpose, index)`. Must be deterministic.
    fn derive(&self, purpose: AddressPurpose, index: u32) -> Result<String>;
}

/// Derivation from an extended public key.
///
/// The key material, a purpose tag, and the index are hashed into a 20-byte
/// payload which is rendered as a Base58Check string with a purpose-specific
/// version byte. No private key ever enters the engine.
pub struct XpubDeriver {
    xpub: String,
}

impl XpubDeriver {
    pub fn new(xpub: impl Into<String>) -> Result<Self> {
        let xpub = xpub.into();
        if xpub.trim().is_empty() {
            return Err(ClearhouseError::Configuration(
                "extended public key must not be empty".to_string(),
            ));
        }
        Ok(Self { xpub })
    }

    /// Short hex fingerprint of the key for logs; never logs the key itself.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.xpub.as_bytes());
        hex::encode(&digest[..4])
    }

    fn version_byte(purpose: AddressPurpose) -> u8 {
        match purpose {
            AddressPurpose::Topup => 0x00,
            AddressPurpose::Tip => 0x05,
        }
    }
}

/// Renders the fingerprint, never the key material.
impl std::fmt::Debug for XpubDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XpubDeriver")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl AddressDeriver for XpubDeriver {
    fn derive(&self, purpose: AddressPurpose, index: u32) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(DERIVATION_TAG);
        hasher.update(self.xpub.as_bytes());
        hasher.update([purpose.tag()]);
        hasher.update(index.to_le_bytes());
        let digest = hasher.finalize();

        // version byte + 20-byte payload + 4-byte double-SHA checksum
        let mut payload = Vec::with_capacity(25);
        payload.push(Self::version_byte(purpose));
        payload.extend_from_slice(&digest[..20]);
        let checksum = Sha256::digest(Sha256::digest(&payload));
        payload.extend_from_slice(&checksum[..4]);

        Ok(bs58::encode(payload).into_string())
    }
}

// ---------------------------------------------------------------------------
// Address table
// ---------------------------------------------------------------------------

struct Tables {
    /// Address string → record. The primary key is the address itself.
    addresses: HashMap<String, DepositAddress>,
    /// Unique index on (purpose, derivation index).
    by_coordinates: HashMap<(AddressPurpose, u32), String>,
    /// Which wallet each address credits.
    bindings: HashMap<String, WalletId>,
    /// Next free derivation index per purpose.
    next_index: HashMap<AddressPurpose, u32>,
}

/// The receive-address table, shared by the allocator and the chain adapter.
pub struct AddressStore {
    inner: Mutex<Tables>,
}

impl AddressStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables {
                addresses: HashMap::new(),
                by_coordinates: HashMap::new(),
                bindings: HashMap::new(),
                next_index: HashMap::new(),
            }),
        }
    }

    /// Current value of the per-purpose index counter.
    #[must_use]
    pub fn next_index(&self, purpose: AddressPurpose) -> u32 {
        *self.lock().next_index.get(&purpose).unwrap_or(&0)
    }

    /// Advance the counter past `expected` only if it still equals
    /// `expected`; a concurrent allocation moves it first and loses us the
    /// race.
    pub fn claim_index(&self, purpose: AddressPurpose, expected: u32) -> Result<()> {
        let mut tables = self.lock();
        let current = tables.next_index.entry(purpose).or_insert(0);
        if *current != expected {
            return Err(ClearhouseError::ConcurrentModification {
                resource: format!("address_index:{purpose}"),
            });
        }
        *current = expected + 1;
        Ok(())
    }

    /// Insert an allocated address bound to the wallet it credits.
    ///
    /// Enforces global address uniqueness and per-purpose index uniqueness.
    /// Either violation means two distinct coordinate pairs derived the same
    /// output or an index was reused — defects, not races.
    pub fn insert(&self, address: DepositAddress, wallet_id: WalletId) -> Result<()> {
        let mut tables = self.lock();
        if tables.addresses.contains_key(&address.address) {
            return Err(ClearhouseError::DataIntegrityViolation {
                constraint: "address_unique".to_string(),
                value: address.address,
            });
        }
        let coordinates = (address.purpose, address.derivation_index);
        if tables.by_coordinates.contains_key(&coordinates) {
            return Err(ClearhouseError::DataIntegrityViolation {
                constraint: "address_purpose_index_unique".to_string(),
                value: format!("{}:{}", address.purpose, address.derivation_index),
            });
        }
        tables
            .by_coordinates
            .insert(coordinates, address.address.clone());
        tables.bindings.insert(address.address.clone(), wallet_id);
        tables.addresses.insert(address.address.clone(), address);
        Ok(())
    }

    /// Snapshot read of one address.
    pub fn get(&self, address: &str) -> Result<DepositAddress> {
        self.lock()
            .addresses
            .get(address)
            .cloned()
            .ok_or_else(|| ClearhouseError::UnknownAddress {
                address: address.to_string(),
            })
    }

    /// The wallet an address credits.
    pub fn wallet_for(&self, address: &str) -> Result<WalletId> {
        self.lock()
            .bindings
            .get(address)
            .copied()
            .ok_or_else(|| ClearhouseError::UnknownAddress {
                address: address.to_string(),
            })
    }

    /// All addresses still being scanned.
    #[must_use]
    pub fn active(&self) -> Vec<DepositAddress> {
        self.lock()
            .addresses
            .values()
            .filter(|a| a.is_active())
            .cloned()
            .collect()
    }

    /// Stop scanning an address. Existing deposits on it are unaffected.
    pub fn retire(&self, address: &str) -> Result<()> {
        let mut tables = self.lock();
        let record = tables.addresses.get_mut(address).ok_or_else(|| {
            ClearhouseError::UnknownAddress {
                address: address.to_string(),
            }
        })?;
        record.status = clearhouse_types::AddressStatus::Retired;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().expect("address store lock poisoned")
    }
}

impl Default for AddressStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Hands out fresh receive addresses, one derivation index at a time.
pub struct AddressAllocator {
    deriver: Arc<dyn AddressDeriver>,
    store: Arc<AddressStore>,
    max_retries: u32,
}

impl AddressAllocator {
    #[must_use]
    pub fn new(deriver: Arc<dyn AddressDeriver>, store: Arc<AddressStore>, max_retries: u32) -> Self {
        Self {
            deriver,
            store,
            max_retries,
        }
    }

    /// Allocate the next address for `purpose`, crediting `wallet_id`.
    ///
    /// Races on the index counter re-read and re-derive; only a spent retry
    /// budget or a derivation/integrity defect surfaces as an error.
    pub fn allocate(
        &self,
        purpose: AddressPurpose,
        wallet_id: WalletId,
    ) -> Result<DepositAddress> {
        for _ in 0..self.max_retries {
            let index = self.store.next_index(purpose);
            let derived = self.deriver.derive(purpose, index)?;

            match self.store.claim_index(purpose, index) {
                Ok(()) => {}
                Err(ClearhouseError::ConcurrentModification { .. }) => continue,
                Err(err) => return Err(err),
            }

            let record = DepositAddress::new(derived, purpose, index);
            self.store.insert(record.clone(), wallet_id)?;
            tracing::info!(
                address = %record.address,
                %purpose,
                index,
                %wallet_id,
                "receive address allocated"
            );
            return Ok(record);
        }
        Err(ClearhouseError::RetriesExhausted {
            resource: format!("address_index:{purpose}"),
            attempts: self.max_retries,
        })
    }
}
