//! Key/value persistence seam with per-key TTL, plus an in-process store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CollaboratorError;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a live value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, CollaboratorError>;

    /// Insert or overwrite `key`, expiring it after `ttl_secs`.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CollaboratorError>;

    /// Remove `key`. Returns whether a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool, CollaboratorError>;

    /// All live keys beginning with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CollaboratorError>;
}

struct Entry {
    value: String,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

/// Process-local store. Entries vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CollaboratorError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now().checked_add(Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CollaboratorError> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live()))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CollaboratorError> {
        self.entries.retain(|_, e| e.is_live());
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        store.set("scheduled_job:1", "{}", 60).await.unwrap();
        assert_eq!(store.get("scheduled_job:1").await.unwrap().as_deref(), Some("{}"));
        assert!(store.delete("scheduled_job:1").await.unwrap());
        assert!(!store.delete("scheduled_job:1").await.unwrap());
        assert!(store.get("scheduled_job:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let store = MemoryStore::new();
        store.set("k", "v", 0).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.list_keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("scheduled_job:b", "1", 60).await.unwrap();
        store.set("scheduled_job:a", "1", 60).await.unwrap();
        store.set("other:c", "1", 60).await.unwrap();
        let keys = store.list_keys("scheduled_job:").await.unwrap();
        assert_eq!(keys, vec!["scheduled_job:a", "scheduled_job:b"]);
    }

    #[tokio::test]
    async fn huge_ttl_never_expires() {
        let store = MemoryStore::new();
        store.set("k", "v", u64::MAX).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.list_keys("").await.unwrap(), vec!["k"]);
    }
}
