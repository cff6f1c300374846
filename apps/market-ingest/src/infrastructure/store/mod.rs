//! In-Memory Order Store
//!
//! [`OrderStore`] adapter holding hashes and sets in process memory. Used
//! when no durable backend is configured, and by tests. Missing keys and
//! fields answer [`StoreError::NotFound`] like a real hash/set server, and a
//! key holding the wrong type answers [`StoreError::Backend`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{OrderStore, StoreError};

#[derive(Debug, Clone)]
enum Entry {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

/// Process-local hash/set store.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    entries: RwLock<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!("wrong type for key {key}"))
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn hset_many(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        let Entry::Hash(hash) = entry else {
            return Err(wrong_type(key));
        };
        hash.extend(fields);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<String, StoreError> {
        self.check_available()?;
        match self.entries.read().get(key) {
            Some(Entry::Hash(hash)) => hash.get(field).cloned().ok_or_else(|| StoreError::NotFound {
                key: format!("{key}/{field}"),
            }),
            Some(Entry::Set(_)) => Err(wrong_type(key)),
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        match self.entries.read().get(key) {
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Entry::Hash(_)) => Err(wrong_type(key)),
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn sadd(&self, key: &str, members: Vec<String>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()));
        let Entry::Set(set) = entry else {
            return Err(wrong_type(key));
        };
        set.extend(members);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.write().remove(key);
        Ok(())
    }
}
