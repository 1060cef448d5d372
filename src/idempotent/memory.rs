//! In-memory idempotent store backed by a concurrent map.

use super::{IdempotentStore, StoreError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Process-local store. The entry value is the confirmed flag.
#[derive(Debug, Default)]
pub struct MemoryIdempotentStore {
    entries: DashMap<String, bool>,
}

impl MemoryIdempotentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdempotentStore for MemoryIdempotentStore {
    async fn add(&self, key: &str) -> Result<bool, StoreError> {
        // the entry API holds the shard lock across the check-then-insert
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(false);
                Ok(true)
            }
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(key))
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn confirm(&self, key: &str) -> Result<bool, StoreError> {
        match self.entries.get_mut(key) {
            Some(mut entry) if !*entry => {
                *entry = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_is_first_wins() {
        let store = MemoryIdempotentStore::new();
        assert!(store.add("k").await.unwrap());
        assert!(!store.add("k").await.unwrap());
        assert!(store.contains("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_confirm_requires_prior_add() {
        let store = MemoryIdempotentStore::new();
        assert!(!store.confirm("missing").await.unwrap());

        store.add("k").await.unwrap();
        assert!(store.confirm("k").await.unwrap());
        // already confirmed
        assert!(!store.confirm("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let store = MemoryIdempotentStore::new();
        store.add("a").await.unwrap();
        store.add("b").await.unwrap();

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_add_single_winner() {
        let store = Arc::new(MemoryIdempotentStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(
                async move { store.add("contended").await.unwrap() },
            ));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
