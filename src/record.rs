//! # Records and Providers
//!
//! Values stored in the DHT are opaque [`Record`]s. Whether a record is
//! acceptable, and which of several conflicting records wins, is decided by a
//! pluggable [`RecordPolicy`]:
//!
//! | Policy | Accepts | Selects |
//! |--------|---------|---------|
//! | [`AcceptAllPolicy`] | any value up to [`MAX_VALUE_SIZE`] | first |
//! | [`ContentAddressedPolicy`] | `blake3(value) == key` | first |
//! | [`NamespacedPolicy`] | delegates on the `/namespace/` key prefix | delegated |
//!
//! Locally held records and provider announcements live in bounded LRU
//! stores with a time-to-live. Nothing here is persisted.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::identity::{KadKey, PeerId};

/// Largest value any built-in policy accepts (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn kad_key(&self) -> KadKey {
        KadKey::from_raw(&self.key)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("value of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("value hash does not match key")]
    KeyMismatch,
    #[error("record key has no namespace")]
    MissingNamespace,
    #[error("no policy registered for namespace {0:?}")]
    UnknownNamespace(String),
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// Validation and selection of records, supplied by the embedding application.
pub trait RecordPolicy: Send + Sync + 'static {
    /// Accept or reject a value before it is returned by a query or stored.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), RecordError>;

    /// Index of the best value in `values`. Never called with an empty slice.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> usize;
}

/// Accepts every value within [`MAX_VALUE_SIZE`]; the first value seen wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllPolicy;

impl RecordPolicy for AcceptAllPolicy {
    fn validate(&self, _key: &[u8], value: &[u8]) -> Result<(), RecordError> {
        check_size(value)
    }

    fn select(&self, _key: &[u8], _values: &[Vec<u8>]) -> usize {
        0
    }
}

/// Accepts a value only when its BLAKE3 hash is the record key.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContentAddressedPolicy;

impl ContentAddressedPolicy {
    /// Key under which `value` must be stored.
    pub fn key_for(value: &[u8]) -> Vec<u8> {
        blake3::hash(value).as_bytes().to_vec()
    }
}

impl RecordPolicy for ContentAddressedPolicy {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), RecordError> {
        check_size(value)?;
        if blake3::hash(value).as_bytes().as_slice() != key {
            return Err(RecordError::KeyMismatch);
        }
        Ok(())
    }

    fn select(&self, _key: &[u8], _values: &[Vec<u8>]) -> usize {
        0
    }
}

/// Routes keys of the form `/<namespace>/<rest>` to the policy registered for
/// `<namespace>`. Keys without a registered namespace are rejected.
#[derive(Clone, Default)]
pub struct NamespacedPolicy {
    policies: HashMap<String, Arc<dyn RecordPolicy>>,
}

impl NamespacedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, namespace: impl Into<String>, policy: impl RecordPolicy) -> Self {
        self.policies.insert(namespace.into(), Arc::new(policy));
        self
    }

    fn policy_for(&self, key: &[u8]) -> Result<&Arc<dyn RecordPolicy>, RecordError> {
        let namespace = namespace_of(key).ok_or(RecordError::MissingNamespace)?;
        self.policies
            .get(namespace)
            .ok_or_else(|| RecordError::UnknownNamespace(namespace.to_string()))
    }
}

impl RecordPolicy for NamespacedPolicy {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), RecordError> {
        self.policy_for(key)?.validate(key, value)
    }

    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> usize {
        match self.policy_for(key) {
            Ok(policy) => policy.select(key, values),
            Err(_) => 0,
        }
    }
}

/// `"/pk/abc"` -> `Some("pk")`.
fn namespace_of(key: &[u8]) -> Option<&str> {
    let rest = key.strip_prefix(b"/")?;
    let end = rest.iter().position(|b| *b == b'/')?;
    let namespace = std::str::from_utf8(&rest[..end]).ok()?;
    (!namespace.is_empty()).then_some(namespace)
}

fn check_size(value: &[u8]) -> Result<(), RecordError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(RecordError::TooLarge(value.len()));
    }
    Ok(())
}

#[derive(Debug)]
struct StoredRecord {
    record: Record,
    stored_at: Instant,
}

/// Records held by this node, bounded and expiring.
#[derive(Debug)]
pub(crate) struct RecordStore {
    entries: LruCache<Vec<u8>, StoredRecord>,
    ttl: Duration,
}

impl RecordStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Record> {
        let expired = match self.entries.get(key) {
            Some(stored) if stored.stored_at.elapsed() <= self.ttl => {
                return Some(stored.record.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
        }
        None
    }

    pub fn put(&mut self, record: Record) {
        self.entries.put(
            record.key.clone(),
            StoredRecord {
                record,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Copy, Debug)]
struct ProviderEntry {
    peer: PeerId,
    added_at: Instant,
}

/// Provider announcements per key, bounded and expiring.
#[derive(Debug)]
pub(crate) struct ProviderStore {
    entries: LruCache<Vec<u8>, Vec<ProviderEntry>>,
    per_key: usize,
    ttl: Duration,
}

impl ProviderStore {
    pub fn new(max_keys: usize, per_key: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            per_key: per_key.max(1),
            ttl,
        }
    }

    /// Record `peer` as a provider of `key`. Re-adding refreshes the entry; when
    /// the key is at capacity the oldest announcement makes room.
    pub fn add(&mut self, key: &[u8], peer: PeerId) {
        let now = Instant::now();
        let providers = self.entries.get_or_insert_mut(key.to_vec(), Vec::new);
        providers.retain(|entry| entry.peer != peer);
        if providers.len() >= self.per_key {
            providers.remove(0);
        }
        providers.push(ProviderEntry { peer, added_at: now });
    }

    pub fn providers(&mut self, key: &[u8]) -> Vec<PeerId> {
        let ttl = self.ttl;
        let Some(providers) = self.entries.get_mut(key) else {
            return Vec::new();
        };
        providers.retain(|entry| entry.added_at.elapsed() <= ttl);
        let peers: Vec<PeerId> = providers.iter().map(|entry| entry.peer).collect();
        if peers.is_empty() {
            self.entries.pop(key);
        }
        peers
    }
}
