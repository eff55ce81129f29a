//! Shared key-value store layer
//!
//! Every worker process coordinates through one [`KvStore`]. The trait only
//! exposes single-key atomic primitives: set add-if-absent and removal,
//! hash fields, a set-if-absent marker with an optional lease, and key
//! enumeration for diagnostics. Empty sets and hashes cease to exist.

pub mod graph;
pub mod memory;
pub mod sled_store;

pub use graph::GraphStore;
pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::core::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key {0} holds a different kind of value")]
    WrongType(String),

    #[error("Invalid UTF-8 stored under {0}")]
    InvalidUtf8(String),

    #[error("Corrupt lease record under {0}")]
    CorruptLease(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Add `member` to `set`; false when it was already present
    async fn sadd(&self, set: &str, member: &str) -> Result<bool>;

    async fn srem(&self, set: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, set: &str) -> Result<Vec<String>>;

    async fn scard(&self, set: &str) -> Result<usize>;

    async fn sismember(&self, set: &str, member: &str) -> Result<bool>;

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>>;

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool>;

    async fn hexists(&self, hash: &str, field: &str) -> Result<bool>;

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>>;

    /// Delete whatever lives under `key`
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Set a marker if absent or if its lease has run out
    async fn set_nx(&self, key: &str, value: &str, lease: Option<Duration>) -> Result<bool>;

    /// Delete a marker only while it still holds `value`
    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool>;

    /// Every live key starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Marker value together with its lease deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Lease {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn new(value: &str, lease: Option<Duration>) -> Self {
        let expires_at = lease.and_then(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
        });
        Self {
            value: value.to_string(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}
