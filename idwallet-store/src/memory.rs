//! In-memory store driver for tests and software-only deployments.
//!
//! Behaves like the production driver in the ways the core cares about:
//! scheme checks on open, a pass-key check value so a wrong wallet key
//! is rejected deterministically, duplicate detection, and tag filters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::driver::{StoreDriver, StoreSession};
use crate::error::{StoreError, StoreResult};
use crate::types::{KeyEntry, KeyWrapScheme, PassKey, Record, StoreId, TagFilter};

/// Domain separation label for the pass-key check value.
const PASS_KEY_CHECK_LABEL: &[u8] = b"wallet-store:passkey-check";

struct StoreState {
    scheme: KeyWrapScheme,
    key_check: [u8; 32],
    records: HashMap<(String, String), Record>,
    keys: HashMap<String, KeyEntry>,
}

type SharedStores = Arc<Mutex<HashMap<String, StoreState>>>;

/// A [`StoreDriver`] holding every store in process memory.
///
/// Clones share the same backing map, so a driver handed to the unlock
/// machine and one handed to the migration engine see the same stores.
#[derive(Clone, Default)]
pub struct MemoryStoreDriver {
    stores: SharedStores,
}

impl MemoryStoreDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key_check(id: &StoreId, pass_key: &PassKey) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(PASS_KEY_CHECK_LABEL);
        hasher.update(id.to_string().as_bytes());
        hasher.update(pass_key.as_bytes());
        hasher.finalize().into()
    }
}

#[async_trait]
impl StoreDriver for MemoryStoreDriver {
    async fn provision(
        &self,
        id: &StoreId,
        scheme: KeyWrapScheme,
        pass_key: &PassKey,
        _profile: &str,
    ) -> StoreResult<Box<dyn StoreSession>> {
        let key = id.to_string();
        let mut stores = self.stores.lock().expect("store map poisoned");
        if stores.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        stores.insert(
            key.clone(),
            StoreState {
                scheme,
                key_check: Self::key_check(id, pass_key),
                records: HashMap::new(),
                keys: HashMap::new(),
            },
        );
        drop(stores);
        Ok(Box::new(MemorySession {
            stores: Arc::clone(&self.stores),
            store_key: key,
            closed: false,
        }))
    }

    async fn open(
        &self,
        id: &StoreId,
        scheme: KeyWrapScheme,
        pass_key: &PassKey,
        _profile: &str,
    ) -> StoreResult<Box<dyn StoreSession>> {
        let key = id.to_string();
        let stores = self.stores.lock().expect("store map poisoned");
        let state = stores
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if state.scheme != scheme {
            return Err(StoreError::SchemeMismatch {
                store: key,
                expected: state.scheme.to_string(),
                actual: scheme.to_string(),
            });
        }
        if state.key_check != Self::key_check(id, pass_key) {
            return Err(StoreError::InvalidKey(key));
        }
        drop(stores);
        Ok(Box::new(MemorySession {
            stores: Arc::clone(&self.stores),
            store_key: key,
            closed: false,
        }))
    }

    async fn exists(&self, id: &StoreId) -> StoreResult<bool> {
        let stores = self.stores.lock().expect("store map poisoned");
        Ok(stores.contains_key(&id.to_string()))
    }

    async fn delete(&self, id: &StoreId) -> StoreResult<()> {
        let mut stores = self.stores.lock().expect("store map poisoned");
        stores.remove(&id.to_string());
        Ok(())
    }
}

struct MemorySession {
    stores: SharedStores,
    store_key: String,
    closed: bool,
}

impl MemorySession {
    fn with_state<R>(
        &self,
        f: impl FnOnce(&StoreState) -> StoreResult<R>,
    ) -> StoreResult<R> {
        if self.closed {
            return Err(StoreError::SessionClosed);
        }
        let stores = self.stores.lock().expect("store map poisoned");
        let state = stores
            .get(&self.store_key)
            .ok_or_else(|| StoreError::NotFound(self.store_key.clone()))?;
        f(state)
    }

    fn with_state_mut<R>(
        &mut self,
        f: impl FnOnce(&mut StoreState) -> StoreResult<R>,
    ) -> StoreResult<R> {
        if self.closed {
            return Err(StoreError::SessionClosed);
        }
        let mut stores = self.stores.lock().expect("store map poisoned");
        let state = stores
            .get_mut(&self.store_key)
            .ok_or_else(|| StoreError::NotFound(self.store_key.clone()))?;
        f(state)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn fetch(&self, category: &str, id: &str) -> StoreResult<Option<Record>> {
        self.with_state(|state| {
            Ok(state
                .records
                .get(&(category.to_string(), id.to_string()))
                .cloned())
        })
    }

    async fn fetch_all(&self, filter: &TagFilter) -> StoreResult<Vec<Record>> {
        self.with_state(|state| {
            let mut records: Vec<Record> = state
                .records
                .values()
                .filter(|r| filter.matches(&r.tags))
                .cloned()
                .collect();
            records.sort_by(|a, b| (&a.category, &a.id).cmp(&(&b.category, &b.id)));
            Ok(records)
        })
    }

    async fn insert(&mut self, record: Record) -> StoreResult<()> {
        self.with_state_mut(|state| {
            let key = (record.category.clone(), record.id.clone());
            if state.records.contains_key(&key) {
                return Err(StoreError::DuplicateRecord {
                    category: record.category,
                    id: record.id,
                });
            }
            state.records.insert(key, record);
            Ok(())
        })
    }

    async fn fetch_all_keys(&self, filter: &TagFilter) -> StoreResult<Vec<KeyEntry>> {
        self.with_state(|state| {
            let mut keys: Vec<KeyEntry> = state
                .keys
                .values()
                .filter(|k| filter.matches(&k.tags))
                .cloned()
                .collect();
            keys.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(keys)
        })
    }

    async fn insert_key(&mut self, entry: KeyEntry) -> StoreResult<()> {
        self.with_state_mut(|state| {
            if state.keys.contains_key(&entry.name) {
                return Err(StoreError::DuplicateKey(entry.name));
            }
            state.keys.insert(entry.name.clone(), entry);
            Ok(())
        })
    }

    async fn remove_key(&mut self, name: &str) -> StoreResult<()> {
        self.with_state_mut(|state| {
            state
                .keys
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StoreError::KeyNotFound(name.to_string()))
        })
    }

    async fn close(&mut self) -> StoreResult<()> {
        self.closed = true;
        Ok(())
    }
}
