use super::{CacheError, Entry, ResponseCache};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Stored {
    entry: Entry,
    expires_at: Instant,
}

/// In-memory cache backend. Expiry is lazy (checked on `get`); capacity
/// overflow rejects new keys rather than evicting old ones.
pub struct MemoryCache {
    table: RwLock<HashMap<String, Stored>>,
    expire: Duration,
    maxcount: usize,
}

impl MemoryCache {
    /// `maxcount == 0` disables the capacity check.
    pub fn new(expire: Duration, maxcount: usize) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            expire,
            maxcount,
        }
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Entry, CacheError> {
        let (entry, expires_at) = {
            let table = self.table.read();
            match table.get(key) {
                Some(stored) => (stored.entry.clone(), stored.expires_at),
                None => return Err(CacheError::KeyNotFound(key.to_string())),
            }
        };

        if expires_at < Instant::now() {
            self.table.write().remove(key);
            return Err(CacheError::KeyExpired(key.to_string()));
        }

        Ok(entry)
    }

    async fn set(&self, key: &str, entry: Entry) -> Result<(), CacheError> {
        if self.full().await && !self.exists(key).await {
            return Err(CacheError::CacheIsFull);
        }

        let stored = Stored {
            entry,
            expires_at: Instant::now() + self.expire,
        };
        self.table.write().insert(key.to_string(), stored);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.table.read().contains_key(key)
    }

    async fn remove(&self, key: &str) {
        self.table.write().remove(key);
    }

    async fn full(&self) -> bool {
        if self.maxcount == 0 {
            return false;
        }
        self.table.read().len() >= self.maxcount
    }

    async fn len(&self) -> usize {
        self.table.read().len()
    }
}
