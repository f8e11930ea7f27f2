//! Key-value persistence for overlay state.
//!
//! Two logical stores back the driver: a local store for facts that only
//! matter on this host, and a global store shared by every host in the
//! cluster. Writes are optimistic. Every stored value carries an index, and
//! an atomic put or delete fails with [`StoreError::Conflict`] when the index
//! moved since the caller last read it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors returned by a [`KvStore`] backend or the typed [`Datastore`] layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No value is stored under the key.
    #[error("Key not found: {0}")]
    NotFound(String),

    /// The stored index moved since the caller read it.
    #[error("Key modified concurrently: {0}")]
    Conflict(String),

    /// A value could not be encoded before writing.
    #[error("Failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored value could not be decoded.
    #[error("Failed to decode value for {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The storage engine itself failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Which logical store an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScope {
    /// Facts private to this host.
    Local,
    /// Facts shared by the whole cluster.
    Global,
}

/// A raw stored value together with its modification index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub index: u64,
}

/// A storage engine with compare-and-set semantics.
///
/// Calls are blocking. Callers must not hold in-memory locks across them.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<KvPair, StoreError>;

    /// Write `value` under `key` if the stored index still equals `previous`.
    ///
    /// `previous == None` means the key must not exist yet. Returns the new
    /// index on success.
    fn put_atomic(&self, key: &str, value: Vec<u8>, previous: Option<u64>)
    -> Result<u64, StoreError>;

    /// Delete `key` if its stored index still equals `previous`.
    fn delete_atomic(&self, key: &str, previous: u64) -> Result<(), StoreError>;

    /// List every pair whose key starts with `prefix`, ordered by key.
    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError>;
}

/// Join key segments with `/`.
pub fn key(parts: &[&str]) -> String {
    parts.join("/")
}

// ---------------------------------------------------------------------------
// Typed layer
// ---------------------------------------------------------------------------

/// A decoded object together with the key and index it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub key: String,
    pub value: T,
    pub index: u64,
}

/// JSON-typed access to a [`KvStore`] for one [`DataScope`].
#[derive(Clone)]
pub struct Datastore {
    scope: DataScope,
    backend: Arc<dyn KvStore>,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Datastore {
    pub fn new(scope: DataScope, backend: Arc<dyn KvStore>) -> Self {
        Self { scope, backend }
    }

    pub fn scope(&self) -> DataScope {
        self.scope
    }

    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Versioned<T>, StoreError> {
        let pair = self.backend.get(key)?;
        decode(pair)
    }

    pub fn put_object_atomic<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        index: Option<u64>,
    ) -> Result<u64, StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.backend.put_atomic(key, bytes, index)
    }

    pub fn delete_object_atomic(&self, key: &str, index: u64) -> Result<(), StoreError> {
        self.backend.delete_atomic(key, index)
    }

    /// List and decode every object under `prefix`.
    ///
    /// Values that fail to decode are logged and skipped so one corrupt
    /// record cannot hide the rest.
    pub fn list_objects<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<Versioned<T>>, StoreError> {
        let pairs = self.backend.list(prefix)?;
        let mut objects = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match decode(pair) {
                Ok(object) => objects.push(object),
                Err(e) => warn!("Skipping undecodable {:?} store entry: {e}", self.scope),
            }
        }
        Ok(objects)
    }
}

fn decode<T: DeserializeOwned>(pair: KvPair) -> Result<Versioned<T>, StoreError> {
    let value = serde_json::from_slice(&pair.value).map_err(|source| StoreError::Decode {
        key: pair.key.clone(),
        source,
    })?;
    Ok(Versioned {
        key: pair.key,
        value,
        index: pair.index,
    })
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, (Vec<u8>, u64)>,
    last_index: u64,
}

/// A process-local [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<KvPair, StoreError> {
        let state = self.state.read();
        state
            .entries
            .get(key)
            .map(|(value, index)| KvPair {
                key: key.to_string(),
                value: value.clone(),
                index: *index,
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put_atomic(
        &self,
        key: &str,
        value: Vec<u8>,
        previous: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let current = state.entries.get(key).map(|(_, index)| *index);
        if current != previous {
            return Err(StoreError::Conflict(key.to_string()));
        }
        state.last_index += 1;
        let index = state.last_index;
        state.entries.insert(key.to_string(), (value, index));
        Ok(index)
    }

    fn delete_atomic(&self, key: &str, previous: u64) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.entries.get(key) {
            None => Err(StoreError::NotFound(key.to_string())),
            Some((_, index)) if *index != previous => Err(StoreError::Conflict(key.to_string())),
            Some(_) => {
                state.entries.remove(key);
                Ok(())
            }
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let state = self.state.read();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, index))| KvPair {
                key: key.clone(),
                value: value.clone(),
                index: *index,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
