//! Token ledger
//!
//! Local wallet state: unspent proofs, known mints, transaction history and the
//! proof -> event map. Persisted as JSON values under fixed keys in a key-value
//! store (browser LocalStorage in the app, memory in tests).
//!
//! Writes of the individual keys are not atomic as a group. A crash between the
//! proofs write and the history write leaves them diverged; the mint stays the
//! source of truth for spendability. Within one process all mutations go
//! through [`TokenLedger::begin`], which serializes read-modify-write cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, MutexGuard};

use super::errors::{CashuResult, CashuWalletError};
use super::types::{HistoryEntry, HistoryType, LedgerSnapshot, ProofData, SendSplit};
use super::utils::{mint_matches, normalize_mint_url, sum_proofs};

pub const STORAGE_KEY_TOKENS: &str = "tokens";
pub const STORAGE_KEY_HISTORY: &str = "history";
pub const STORAGE_KEY_MINTS: &str = "mints";
pub const STORAGE_KEY_PROOF_EVENTS: &str = "proofEvents";

// =============================================================================
// Storage Backends
// =============================================================================

/// Key-value persistence for ledger state
pub trait LedgerStore: Send + Sync {
    fn load(&self, key: &str) -> CashuResult<Option<serde_json::Value>>;
    fn save(&self, key: &str, value: serde_json::Value) -> CashuResult<()>;
}

/// In-memory store, used by tests and native hosts without persistence
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    values: StdMutex<HashMap<String, serde_json::Value>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self, key: &str) -> CashuResult<Option<serde_json::Value>> {
        let values = self
            .values
            .lock()
            .map_err(|e| CashuWalletError::Storage(format!("Store lock poisoned: {}", e)))?;
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, value: serde_json::Value) -> CashuResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| CashuWalletError::Storage(format!("Store lock poisoned: {}", e)))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Browser LocalStorage backend
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorageLedgerStore;

#[cfg(target_arch = "wasm32")]
impl LedgerStore for LocalStorageLedgerStore {
    fn load(&self, key: &str) -> CashuResult<Option<serde_json::Value>> {
        use gloo_storage::errors::StorageError;
        use gloo_storage::{LocalStorage, Storage};

        match LocalStorage::get::<serde_json::Value>(key) {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(CashuWalletError::Storage(format!(
                "Failed to read {} from LocalStorage: {}",
                key, e
            ))),
        }
    }

    fn save(&self, key: &str, value: serde_json::Value) -> CashuResult<()> {
        use gloo_storage::{LocalStorage, Storage};

        LocalStorage::set(key, value).map_err(|e| {
            CashuWalletError::Storage(format!("Failed to write {} to LocalStorage: {}", key, e))
        })
    }
}

fn load_key<T: serde::de::DeserializeOwned + Default>(
    store: &dyn LedgerStore,
    key: &str,
) -> CashuResult<T> {
    match store.load(key)? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| CashuWalletError::Storage(format!("Corrupt {} entry: {}", key, e))),
        None => Ok(T::default()),
    }
}

fn save_key<T: serde::Serialize>(store: &dyn LedgerStore, key: &str, value: &T) -> CashuResult<()> {
    let json = serde_json::to_value(value)?;
    store.save(key, json)
}

/// Read every ledger key into a snapshot
pub fn load_snapshot(store: &dyn LedgerStore) -> CashuResult<LedgerSnapshot> {
    Ok(LedgerSnapshot {
        mints: load_key(store, STORAGE_KEY_MINTS)?,
        proofs: load_key(store, STORAGE_KEY_TOKENS)?,
        history: load_key(store, STORAGE_KEY_HISTORY)?,
        proof_events: load_key(store, STORAGE_KEY_PROOF_EVENTS)?,
    })
}

/// Write every ledger key, proofs first
pub fn save_snapshot(store: &dyn LedgerStore, snapshot: &LedgerSnapshot) -> CashuResult<()> {
    save_key(store, STORAGE_KEY_TOKENS, &snapshot.proofs)?;
    save_key(store, STORAGE_KEY_HISTORY, &snapshot.history)?;
    save_key(store, STORAGE_KEY_MINTS, &snapshot.mints)?;
    save_key(store, STORAGE_KEY_PROOF_EVENTS, &snapshot.proof_events)?;
    Ok(())
}

// =============================================================================
// Mutation Rules
// =============================================================================

/// Replace the spent candidates with what the mint told us to keep
///
/// Proofs outside `candidates` (other mints, retired keysets) are left as they
/// are. Returns the proof event IDs that referenced any candidate; those events
/// no longer describe the wallet and should be retired.
pub fn apply_send(
    snapshot: &mut LedgerSnapshot,
    candidates: &[ProofData],
    split: &SendSplit,
) -> Vec<String> {
    let spent_event_ids = snapshot.event_ids_for_proofs(candidates);

    snapshot
        .proofs
        .retain(|p| !candidates.iter().any(|c| c.secret == p.secret));

    for candidate in candidates {
        snapshot.proof_events.remove(&candidate.secret);
    }

    for proof in &split.keep {
        if !snapshot.proofs.iter().any(|p| p.secret == proof.secret) {
            snapshot.proofs.push(proof.clone());
        }
    }

    spent_event_ids
}

/// Add freshly minted proofs and note the mint
///
/// Records a `Mint` history row for the received amount.
pub fn apply_receive(
    snapshot: &mut LedgerSnapshot,
    mint_url: &str,
    minted: &[ProofData],
    date: u64,
) -> u64 {
    let mint_url = normalize_mint_url(mint_url);
    if !snapshot.mints.iter().any(|m| mint_matches(m, &mint_url)) {
        snapshot.mints.push(mint_url);
    }

    snapshot.proofs.extend(minted.iter().cloned());

    let amount = sum_proofs(minted);
    record_history(snapshot, HistoryEntry::new(HistoryType::Mint, amount, date));
    amount
}

/// Prepend a history row
///
/// Never deduplicated and never reconciled against mint state: recording the
/// same entry twice yields two rows.
pub fn record_history(snapshot: &mut LedgerSnapshot, entry: HistoryEntry) {
    snapshot.history.insert(0, entry);
}

/// Local proofs still mapped to any of `event_ids`
///
/// After a send these are the untouched proofs that shared a proof event with
/// the spent candidates; they have to move to the replacement event.
pub fn proofs_in_events(snapshot: &LedgerSnapshot, event_ids: &[String]) -> Vec<ProofData> {
    snapshot
        .proofs
        .iter()
        .filter(|p| {
            snapshot
                .proof_events
                .get(&p.secret)
                .is_some_and(|event_id| event_ids.contains(event_id))
        })
        .cloned()
        .collect()
}

/// Point the given proofs at a newly published proof event
pub fn register_proof_event(snapshot: &mut LedgerSnapshot, event_id: &str, proofs: &[ProofData]) {
    for proof in proofs {
        snapshot
            .proof_events
            .insert(proof.secret.clone(), event_id.to_string());
    }
}

// =============================================================================
// Ledger Service
// =============================================================================

/// Serialized access to the persisted wallet state
pub struct TokenLedger {
    store: Arc<dyn LedgerStore>,
    write_lock: Mutex<()>,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Ledger backed by process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new()))
    }

    /// Ledger backed by browser LocalStorage
    #[cfg(target_arch = "wasm32")]
    pub fn local_storage() -> Self {
        Self::new(Arc::new(LocalStorageLedgerStore))
    }

    /// Current state; may be stale by the time the caller acts on it
    pub async fn read(&self) -> CashuResult<LedgerSnapshot> {
        let _guard = self.write_lock.lock().await;
        load_snapshot(self.store.as_ref())
    }

    /// Start a read-modify-write cycle
    ///
    /// Holds the ledger lock until the transaction is committed or dropped, so
    /// a send can span the mint round trip without another task reading the
    /// same proofs.
    pub async fn begin(&self) -> CashuResult<LedgerTxn<'_>> {
        let guard = self.write_lock.lock().await;
        let snapshot = load_snapshot(self.store.as_ref())?;
        Ok(LedgerTxn {
            _guard: guard,
            store: self.store.as_ref(),
            snapshot,
        })
    }

    /// Apply a synchronous mutation and persist the result
    pub async fn write_atomic<T, F>(&self, mutator: F) -> CashuResult<T>
    where
        F: FnOnce(&mut LedgerSnapshot) -> CashuResult<T>,
    {
        let mut txn = self.begin().await?;
        let result = mutator(txn.snapshot_mut())?;
        txn.commit()?;
        Ok(result)
    }

    pub async fn record_history(&self, entry: HistoryEntry) -> CashuResult<()> {
        self.write_atomic(|snapshot| {
            record_history(snapshot, entry);
            Ok(())
        })
        .await
    }

    pub async fn apply_receive(&self, mint_url: &str, minted: &[ProofData], date: u64) -> CashuResult<u64> {
        self.write_atomic(|snapshot| Ok(apply_receive(snapshot, mint_url, minted, date)))
            .await
    }

    pub async fn register_proof_event(&self, event_id: &str, proofs: &[ProofData]) -> CashuResult<()> {
        self.write_atomic(|snapshot| {
            register_proof_event(snapshot, event_id, proofs);
            Ok(())
        })
        .await
    }
}

/// An open ledger transaction; dropping it without `commit` discards changes
pub struct LedgerTxn<'a> {
    _guard: MutexGuard<'a, ()>,
    store: &'a dyn LedgerStore,
    snapshot: LedgerSnapshot,
}

impl<'a> LedgerTxn<'a> {
    pub fn snapshot(&self) -> &LedgerSnapshot {
        &self.snapshot
    }

    pub fn snapshot_mut(&mut self) -> &mut LedgerSnapshot {
        &mut self.snapshot
    }

    pub fn commit(self) -> CashuResult<()> {
        save_snapshot(self.store, &self.snapshot)?;
        log::debug!(
            "Ledger committed: {} proofs, {} history rows",
            self.snapshot.proofs.len(),
            self.snapshot.history.len()
        );
        Ok(())
    }
}
