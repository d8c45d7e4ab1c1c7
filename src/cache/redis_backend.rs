use super::{CacheError, Entry, ResponseCache, pack_entry, unpack_entry};
use crate::error::MimirError;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{error, info};

/// Redis cache backend. Stores packed wire messages under a prefixed key
/// and leans on the store's own TTL eviction, so it is never full.
pub struct RedisCache {
    conn: ConnectionManager,
    key_prefix: String,
    expire: u64,
}

impl RedisCache {
    pub async fn connect(url: &str, key_prefix: &str, expire: u64) -> Result<Self, MimirError> {
        let client = redis::Client::open(url)
            .map_err(|e| MimirError::Redis(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| MimirError::Redis(format!("failed to connect: {e}")))?;
        info!("connected to redis cache backend at {}", url);

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            expire,
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl ResponseCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Entry, CacheError> {
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn
            .get(self.redis_key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        match data {
            Some(bytes) => unpack_entry(&bytes),
            None => Err(CacheError::KeyNotFound(key.to_string())),
        }
    }

    async fn set(&self, key: &str, entry: Entry) -> Result<(), CacheError> {
        let bytes = pack_entry(&entry)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.redis_key(key), bytes, self.expire)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn exists(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        conn.exists(self.redis_key(key)).await.unwrap_or(false)
    }

    async fn remove(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(self.redis_key(key)).await {
            error!("failed to remove cache entry from redis: {}", e);
        }
    }

    async fn full(&self) -> bool {
        false
    }

    async fn len(&self) -> usize {
        let pattern = format!("{}:*", self.key_prefix);
        let mut conn = self.conn.clone();
        let mut count = 0;
        let mut cursor = 0;

        loop {
            let result: redis::RedisResult<(i32, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await;

            match result {
                Ok((next_cursor, keys)) => {
                    count += keys.len();
                    cursor = next_cursor;
                    if cursor == 0 {
                        break;
                    }
                }
                Err(e) => {
                    error!("failed to count redis keys: {}", e);
                    break;
                }
            }
        }

        count
    }
}
