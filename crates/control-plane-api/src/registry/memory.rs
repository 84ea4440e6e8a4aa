//! In-memory registry store for tests and single-node development.
//!
//! Honors the same TTL semantics as the redis backend. Expiry uses the
//! tokio clock, so paused-clock tests can advance time and observe records
//! vanishing.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use control_plane_core::error::Result;

use super::RegistryStore;

enum Stored {
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
    Value(String),
}

struct Entry {
    stored: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

/// Registry store held entirely in process memory.
#[derive(Default)]
pub struct InMemoryRegistryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn purge_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !entry.expired());
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn set_add(&self, key: &str, value: &str) -> Result<()> {
        self.purge_expired().await;
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            stored: Stored::Set(BTreeSet::new()),
            expires_at: None,
        });
        if let Stored::Set(members) = &mut entry.stored {
            members.insert(value.to_string());
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, value: &str) -> Result<()> {
        self.purge_expired().await;
        let mut entries = self.entries.write().await;
        let mut emptied = false;
        if let Some(Entry {
            stored: Stored::Set(members),
            ..
        }) = entries.get_mut(key)
        {
            members.remove(value);
            emptied = members.is_empty();
        }
        if emptied {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.purge_expired().await;
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some(Entry {
                stored: Stored::Set(members),
                ..
            }) => members.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn set_size(&self, key: &str) -> Result<usize> {
        Ok(self.set_members(key).await?.len())
    }

    async fn hash_put_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        self.purge_expired().await;
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            stored: Stored::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.stored {
            Stored::Hash(existing) => {
                existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            other => {
                *other = Stored::Hash(fields.clone());
                entry.expires_at = None;
            }
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.purge_expired().await;
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some(Entry {
                stored: Stored::Hash(fields),
                ..
            }) => fields.clone(),
            _ => HashMap::new(),
        })
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash_get_all(key).await?.remove(field))
    }

    async fn put_value(&self, key: &str, value: &str) -> Result<()> {
        self.purge_expired().await;
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                stored: Stored::Value(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.purge_expired().await;
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some(Entry {
                stored: Stored::Value(value),
                ..
            }) => Some(value.clone()),
            _ => None,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.purge_expired().await;
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_operations() {
        let store = InMemoryRegistryStore::new();
        store.set_add("route:command:T", "w-B").await.unwrap();
        store.set_add("route:command:T", "w-A").await.unwrap();
        store.set_add("route:command:T", "w-A").await.unwrap();

        assert_eq!(store.set_size("route:command:T").await.unwrap(), 2);
        assert_eq!(
            store.set_members("route:command:T").await.unwrap(),
            vec!["w-A".to_string(), "w-B".to_string()]
        );

        store.set_remove("route:command:T", "w-A").await.unwrap();
        assert_eq!(store.set_size("route:command:T").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hash_merge_semantics() {
        let store = InMemoryRegistryStore::new();
        let mut first = HashMap::new();
        first.insert("status".to_string(), "HEALTHY".to_string());
        store.hash_put_all("health:w-A", &first).await.unwrap();

        let mut second = HashMap::new();
        second.insert("host".to_string(), "10.0.0.1".to_string());
        store.hash_put_all("health:w-A", &second).await.unwrap();

        let all = store.hash_get_all("health:w-A").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(
            store.hash_get("health:w-A", "status").await.unwrap(),
            Some("HEALTHY".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryRegistryStore::new();
        store.put_value("instance:w-A", "{}").await.unwrap();
        store
            .expire("instance:w-A", Duration::from_secs(120))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(store.get_value("instance:w-A").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get_value("instance:w-A").await.unwrap().is_none());
        assert!(store.keys("instance:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = InMemoryRegistryStore::new();
        store.put_value("instance:w-A", "{}").await.unwrap();
        store.put_value("instance:w-B", "{}").await.unwrap();
        store.set_add("service:users", "w-A").await.unwrap();

        let keys = store.keys("instance:").await.unwrap();
        assert_eq!(keys, vec!["instance:w-A".to_string(), "instance:w-B".to_string()]);
    }
}
