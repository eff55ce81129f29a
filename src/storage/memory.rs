use super::{KvStore, Lease, StoreError};
use crate::core::errors::{Result, TreeError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Slot {
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
    Marker(Lease),
}

impl Slot {
    fn is_live(&self) -> bool {
        match self {
            Slot::Set(members) => !members.is_empty(),
            Slot::Hash(fields) => !fields.is_empty(),
            Slot::Marker(lease) => !lease.is_expired(Utc::now()),
        }
    }
}

fn wrong_type(key: &str) -> TreeError {
    TreeError::store("memory_store", StoreError::WrongType(key.to_string()))
}

/// In-process store shared by every clone. Each operation is atomic on its key.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: Arc<DashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_if_empty(&self, key: &str) {
        self.slots.remove_if(key, |_, slot| !slot.is_live());
    }

    fn with_set<T>(
        &self,
        set: &str,
        read: impl FnOnce(&BTreeSet<String>) -> T,
    ) -> Result<Option<T>> {
        match self.slots.get(set) {
            None => Ok(None),
            Some(slot) => match slot.value() {
                Slot::Set(members) => Ok(Some(read(members))),
                _ => Err(wrong_type(set)),
            },
        }
    }

    fn with_hash<T>(
        &self,
        hash: &str,
        read: impl FnOnce(&BTreeMap<String, String>) -> T,
    ) -> Result<Option<T>> {
        match self.slots.get(hash) {
            None => Ok(None),
            Some(slot) => match slot.value() {
                Slot::Hash(fields) => Ok(Some(read(fields))),
                _ => Err(wrong_type(hash)),
            },
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn sadd(&self, set: &str, member: &str) -> Result<bool> {
        let mut slot = self
            .slots
            .entry(set.to_string())
            .or_insert_with(|| Slot::Set(BTreeSet::new()));
        match slot.value_mut() {
            Slot::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(wrong_type(set)),
        }
    }

    async fn srem(&self, set: &str, member: &str) -> Result<bool> {
        let removed = match self.slots.get_mut(set) {
            None => return Ok(false),
            Some(mut slot) => match slot.value_mut() {
                Slot::Set(members) => members.remove(member),
                _ => return Err(wrong_type(set)),
            },
        };
        self.drop_if_empty(set);
        Ok(removed)
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .with_set(set, |members| members.iter().cloned().collect())?
            .unwrap_or_default())
    }

    async fn scard(&self, set: &str) -> Result<usize> {
        Ok(self.with_set(set, BTreeSet::len)?.unwrap_or(0))
    }

    async fn sismember(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .with_set(set, |members| members.contains(member))?
            .unwrap_or(false))
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        let mut slot = self
            .slots
            .entry(hash.to_string())
            .or_insert_with(|| Slot::Hash(BTreeMap::new()));
        match slot.value_mut() {
            Slot::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(hash)),
        }
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .with_hash(hash, |fields| fields.get(field).cloned())?
            .flatten())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool> {
        let removed = match self.slots.get_mut(hash) {
            None => return Ok(false),
            Some(mut slot) => match slot.value_mut() {
                Slot::Hash(fields) => fields.remove(field).is_some(),
                _ => return Err(wrong_type(hash)),
            },
        };
        self.drop_if_empty(hash);
        Ok(removed)
    }

    async fn hexists(&self, hash: &str, field: &str) -> Result<bool> {
        Ok(self
            .with_hash(hash, |fields| fields.contains_key(field))?
            .unwrap_or(false))
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .with_hash(hash, |fields| {
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })?
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.slots.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.slots.get(key).map(|slot| slot.is_live()).unwrap_or(false))
    }

    async fn set_nx(&self, key: &str, value: &str, lease: Option<Duration>) -> Result<bool> {
        match self.slots.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Marker(Lease::new(value, lease)));
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                let expired = match occupied.get() {
                    Slot::Marker(current) => current.is_expired(Utc::now()),
                    _ => return Err(wrong_type(key)),
                };
                if expired {
                    occupied.insert(Slot::Marker(Lease::new(value, lease)));
                }
                Ok(expired)
            }
        }
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        let removed = self
            .slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Marker(lease) if lease.value == value));
        Ok(removed.is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
