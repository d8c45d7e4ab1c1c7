pub mod memcached;
pub mod memory;
pub mod redis_backend;

pub use memcached::MemcachedCache;
pub use memory::MemoryCache;
pub use redis_backend::RedisCache;

use crate::util::unfqdn;
use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("{0} not found")]
    KeyNotFound(String),

    #[error("{0} expired")]
    KeyExpired(String),

    #[error("cache is full")]
    CacheIsFull,

    #[error("serializer error: {0}")]
    Serializer(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// A cached resolution outcome. `Negative` marks a name whose upstream
/// resolution failed; retries are suppressed while the entry lives.
#[derive(Debug, Clone)]
pub enum Entry {
    Positive(Message),
    Negative,
}

impl Entry {
    pub fn is_negative(&self) -> bool {
        matches!(self, Entry::Negative)
    }
}

/// The question triple a query is reduced to for caching and routing.
/// The name is unqualified and lowercased so `WWW.Example.Com.` and
/// `www.example.com` land on the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: String,
    pub qtype: String,
    pub qclass: String,
}

impl Question {
    pub fn from_query(query: &Query) -> Self {
        Self {
            qname: unfqdn(&query.name().to_ascii()).to_ascii_lowercase(),
            qtype: query.query_type().to_string(),
            qclass: query.query_class().to_string(),
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.qname, self.qclass, self.qtype)
    }
}

/// Cache key: hex MD5 of the canonical question string. A fingerprint
/// against accidental collisions, not a security primitive.
pub fn key_gen(question: &Question) -> String {
    format!("{:x}", md5::compute(question.to_string()))
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Entry, CacheError>;
    async fn set(&self, key: &str, entry: Entry) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> bool;
    async fn remove(&self, key: &str);
    async fn full(&self) -> bool;
    async fn len(&self) -> usize;
}

/// Sentinel the remote backends store for a negative entry.
const NEGATIVE_SENTINEL: &[u8] = b"nil";

/// Pack an entry into the byte form the remote backends store.
pub(crate) fn pack_entry(entry: &Entry) -> Result<Vec<u8>, CacheError> {
    match entry {
        Entry::Negative => Ok(NEGATIVE_SENTINEL.to_vec()),
        Entry::Positive(message) => message
            .to_vec()
            .map_err(|e| CacheError::Serializer(e.to_string())),
    }
}

pub(crate) fn unpack_entry(bytes: &[u8]) -> Result<Entry, CacheError> {
    if bytes == NEGATIVE_SENTINEL {
        return Ok(Entry::Negative);
    }
    Message::from_vec(bytes)
        .map(Entry::Positive)
        .map_err(|e| CacheError::Serializer(e.to_string()))
}
