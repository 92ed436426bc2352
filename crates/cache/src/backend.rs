use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::CacheError;

/// One mutation inside an atomic [`CacheBackend::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        WriteOp::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        WriteOp::Delete { key: key.into() }
    }
}

/// Ordered key-value storage behind the embedding cache.
pub trait CacheBackend: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Applies every op or none of them.
    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), CacheError>;
    /// Visits entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, &[u8]) -> Result<(), CacheError>,
    ) -> Result<(), CacheError>;
    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Selects and builds a backend.
///
/// ```
/// use cache::BackendConfig;
///
/// let config = BackendConfig::in_memory();
/// let config = BackendConfig::redb("/data/frametag.redb");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BackendConfig {
    /// Embedded redb file at `path`. Requires the `backend-redb` feature.
    Redb { path: String },
    #[default]
    InMemory,
}

impl BackendConfig {
    pub fn in_memory() -> Self {
        BackendConfig::InMemory
    }

    pub fn redb<P: Into<String>>(path: P) -> Self {
        BackendConfig::Redb { path: path.into() }
    }

    pub fn build(&self) -> Result<Box<dyn CacheBackend>, CacheError> {
        match self {
            BackendConfig::InMemory => Ok(Box::new(InMemoryBackend::new())),
            BackendConfig::Redb { path } => {
                #[cfg(feature = "backend-redb")]
                {
                    Ok(Box::new(RedbBackend::open(path)?))
                }
                #[cfg(not(feature = "backend-redb"))]
                {
                    let _ = path;
                    Err(CacheError::backend("redb backend disabled at compile time"))
                }
            }
        }
    }
}

/// An in-memory backend using a `RwLock` around a `BTreeMap`.
#[derive(Default)]
pub struct InMemoryBackend {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for InMemoryBackend {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.records
            .write()
            .map_err(|_| CacheError::backend("poisoned lock"))?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let guard = self
            .records
            .read()
            .map_err(|_| CacheError::backend("poisoned lock"))?;
        Ok(guard.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.records
            .write()
            .map_err(|_| CacheError::backend("poisoned lock"))?
            .remove(key);
        Ok(())
    }

    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), CacheError> {
        // One write guard for the whole batch.
        let mut guard = self
            .records
            .write()
            .map_err(|_| CacheError::backend("poisoned lock"))?;
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    guard.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, &[u8]) -> Result<(), CacheError>,
    ) -> Result<(), CacheError> {
        let guard = self
            .records
            .read()
            .map_err(|_| CacheError::backend("poisoned lock"))?;
        for (key, value) in guard.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            visitor(key, value)?;
        }
        Ok(())
    }
}

#[cfg(feature = "backend-redb")]
pub mod redb;

#[cfg(feature = "backend-redb")]
pub use self::redb::RedbBackend;
