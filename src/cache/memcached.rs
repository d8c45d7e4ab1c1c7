use super::{CacheError, Entry, ResponseCache, pack_entry, unpack_entry};
use crate::error::MimirError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// Memcached cache backend. The client is a pooled blocking client, so
/// every call hops onto the blocking thread pool. Like the Redis backend
/// it is never full; the store evicts on its own.
pub struct MemcachedCache {
    client: Arc<memcache::Client>,
    key_prefix: String,
    expire: u32,
}

impl MemcachedCache {
    pub fn connect(servers: &[String], key_prefix: &str, expire: u32) -> Result<Self, MimirError> {
        if servers.is_empty() {
            return Err(MimirError::Memcached(
                "no memcache servers configured".to_string(),
            ));
        }
        let urls: Vec<String> = servers
            .iter()
            .map(|s| {
                if s.contains("://") {
                    s.clone()
                } else {
                    format!("memcache://{s}")
                }
            })
            .collect();
        let client = memcache::Client::connect(urls)
            .map_err(|e| MimirError::Memcached(e.to_string()))?;
        info!("connected to memcached cache backend");

        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.to_string(),
            expire,
        })
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl ResponseCache for MemcachedCache {
    async fn get(&self, key: &str) -> Result<Entry, CacheError> {
        let client = self.client.clone();
        let store_key = self.store_key(key);
        let data = tokio::task::spawn_blocking(move || client.get::<Vec<u8>>(&store_key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        match data {
            Some(bytes) => unpack_entry(&bytes),
            None => Err(CacheError::KeyNotFound(key.to_string())),
        }
    }

    async fn set(&self, key: &str, entry: Entry) -> Result<(), CacheError> {
        let bytes = pack_entry(&entry)?;
        let client = self.client.clone();
        let store_key = self.store_key(key);
        let expire = self.expire;
        tokio::task::spawn_blocking(move || client.set(&store_key, &bytes[..], expire))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn exists(&self, key: &str) -> bool {
        let client = self.client.clone();
        let store_key = self.store_key(key);
        tokio::task::spawn_blocking(move || client.get::<Vec<u8>>(&store_key))
            .await
            .map(|result| matches!(result, Ok(Some(_))))
            .unwrap_or(false)
    }

    async fn remove(&self, key: &str) {
        let client = self.client.clone();
        let store_key = self.store_key(key);
        let result = tokio::task::spawn_blocking(move || client.delete(&store_key)).await;
        if let Ok(Err(e)) = result {
            error!("failed to remove cache entry from memcached: {}", e);
        }
    }

    async fn full(&self) -> bool {
        false
    }

    async fn len(&self) -> usize {
        // memcached has no cheap prefixed count; the handler never needs one
        0
    }
}
