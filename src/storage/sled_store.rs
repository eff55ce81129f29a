use super::{KvStore, Lease, StoreError};
use crate::core::errors::{Result, TreeError};
use async_trait::async_trait;
use chrono::Utc;
use sled::{Db, IVec, Tree};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SEPARATOR: u8 = 0;

/// Persistent store on sled.
///
/// Sets and hashes live in their own trees with compound keys
/// `<name>\0<member>`; markers live in `locks` as JSON lease records and are
/// only ever changed through compare-and-swap.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    sets: Tree,
    hashes: Tree,
    locks: Tree,
}

fn compound(name: &str, member: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + member.len() + 1);
    key.extend_from_slice(name.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(member.as_bytes());
    key
}

fn prefix(name: &str) -> Vec<u8> {
    compound(name, "")
}

fn utf8(key: &str, bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TreeError::store("sled_decode", StoreError::InvalidUtf8(key.to_string())))
}

fn decode_lease(key: &str, bytes: &[u8]) -> Result<Lease> {
    serde_json::from_slice(bytes)
        .map_err(|_| TreeError::store("sled_lease", StoreError::CorruptLease(key.to_string())))
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened sled store");
        Self::from_db(db)
    }

    /// Store that is deleted when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            sets: db.open_tree("jobtree_sets")?,
            hashes: db.open_tree("jobtree_hashes")?,
            locks: db.open_tree("jobtree_locks")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn members(tree: &Tree, name: &str) -> Result<Vec<String>> {
        let prefix = prefix(name);
        let mut members = Vec::new();
        for item in tree.scan_prefix(&prefix) {
            let (key, _) = item?;
            members.push(utf8(name, &key[prefix.len()..])?);
        }
        Ok(members)
    }

    fn remove_prefix(tree: &Tree, name: &str) -> Result<bool> {
        let mut removed = false;
        for item in tree.scan_prefix(prefix(name)) {
            let (key, _) = item?;
            removed |= tree.remove(key)?.is_some();
        }
        Ok(removed)
    }

    fn live_lease(&self, key: &str) -> Result<Option<(IVec, Lease)>> {
        match self.locks.get(key)? {
            None => Ok(None),
            Some(raw) => {
                let lease = decode_lease(key, &raw)?;
                Ok(Some((raw, lease)))
            }
        }
    }

    fn names(tree: &Tree, keys: &mut BTreeSet<String>) -> Result<()> {
        for item in tree.iter() {
            let (key, _) = item?;
            let end = key
                .iter()
                .position(|b| *b == SEPARATOR)
                .unwrap_or(key.len());
            keys.insert(String::from_utf8_lossy(&key[..end]).into_owned());
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for SledStore {
    async fn sadd(&self, set: &str, member: &str) -> Result<bool> {
        let old = self.sets.insert(compound(set, member), Vec::<u8>::new())?;
        Ok(old.is_none())
    }

    async fn srem(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self.sets.remove(compound(set, member))?.is_some())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        Self::members(&self.sets, set)
    }

    async fn scard(&self, set: &str) -> Result<usize> {
        let mut count = 0;
        for item in self.sets.scan_prefix(prefix(set)) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    async fn sismember(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self.sets.contains_key(compound(set, member))?)
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        self.hashes.insert(compound(hash, field), value.as_bytes())?;
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>> {
        match self.hashes.get(compound(hash, field))? {
            Some(raw) => Ok(Some(utf8(hash, &raw)?)),
            None => Ok(None),
        }
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool> {
        Ok(self.hashes.remove(compound(hash, field))?.is_some())
    }

    async fn hexists(&self, hash: &str, field: &str) -> Result<bool> {
        Ok(self.hashes.contains_key(compound(hash, field))?)
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>> {
        let prefix = prefix(hash);
        let mut fields = Vec::new();
        for item in self.hashes.scan_prefix(&prefix) {
            let (key, value) = item?;
            fields.push((utf8(hash, &key[prefix.len()..])?, utf8(hash, &value)?));
        }
        Ok(fields)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let sets = Self::remove_prefix(&self.sets, key)?;
        let hashes = Self::remove_prefix(&self.hashes, key)?;
        let lock = self.locks.remove(key)?.is_some();
        Ok(sets || hashes || lock)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.sets.scan_prefix(prefix(key)).next().transpose()?.is_some() {
            return Ok(true);
        }
        if self.hashes.scan_prefix(prefix(key)).next().transpose()?.is_some() {
            return Ok(true);
        }
        Ok(matches!(self.live_lease(key)?, Some((_, lease)) if !lease.is_expired(Utc::now())))
    }

    async fn set_nx(&self, key: &str, value: &str, lease: Option<Duration>) -> Result<bool> {
        let record = serde_json::to_vec(&Lease::new(value, lease))?;
        loop {
            let swapped = match self.live_lease(key)? {
                None => self
                    .locks
                    .compare_and_swap(key, None::<&[u8]>, Some(record.clone()))?,
                Some((raw, current)) if current.is_expired(Utc::now()) => self
                    .locks
                    .compare_and_swap(key, Some(raw), Some(record.clone()))?,
                Some(_) => return Ok(false),
            };
            if swapped.is_ok() {
                return Ok(true);
            }
            // lost a race with another writer, look again
        }
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        match self.live_lease(key)? {
            Some((raw, current)) if current.value == value => Ok(self
                .locks
                .compare_and_swap(key, Some(raw), None::<IVec>)?
                .is_ok()),
            _ => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        Self::names(&self.sets, &mut names)?;
        Self::names(&self.hashes, &mut names)?;
        let now = Utc::now();
        for item in self.locks.iter() {
            let (key, raw) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if !decode_lease(&key, &raw)?.is_expired(now) {
                names.insert(key);
            }
        }
        Ok(names.into_iter().filter(|k| k.starts_with(prefix)).collect())
    }
}
