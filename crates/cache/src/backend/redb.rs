//! Redb backend for the embedding cache.
//!
//! Every public operation runs in its own redb transaction, so an
//! [`CacheBackend::apply`] batch either commits fully or not at all.
//!
//! ```yaml
//! cache:
//!   backend: redb
//!   path: ./data/frametag.redb
//! ```

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::backend::WriteOp;
use crate::{CacheBackend, CacheError};

const EMBEDDINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("frametag_embeddings");

pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Opens or creates a database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let db = Database::create(path).map_err(CacheError::backend)?;

        let write_txn = db.begin_write().map_err(CacheError::backend)?;
        {
            // Opening the table creates it.
            let _table = write_txn
                .open_table(EMBEDDINGS_TABLE)
                .map_err(CacheError::backend)?;
        }
        write_txn.commit().map_err(CacheError::backend)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl CacheBackend for RedbBackend {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.apply(vec![WriteOp::put(key, value.to_vec())])
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let read_txn = self.db.begin_read().map_err(CacheError::backend)?;
        let table = read_txn
            .open_table(EMBEDDINGS_TABLE)
            .map_err(CacheError::backend)?;

        match table.get(key).map_err(CacheError::backend)? {
            Some(value) => Ok(Some(value.value().to_vec())),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.apply(vec![WriteOp::delete(key)])
    }

    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), CacheError> {
        let write_txn = self.db.begin_write().map_err(CacheError::backend)?;
        {
            let mut table = write_txn
                .open_table(EMBEDDINGS_TABLE)
                .map_err(CacheError::backend)?;
            for op in &ops {
                match op {
                    WriteOp::Put { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(CacheError::backend)?;
                    }
                    WriteOp::Delete { key } => {
                        table.remove(key.as_str()).map_err(CacheError::backend)?;
                    }
                }
            }
        }
        write_txn.commit().map_err(CacheError::backend)?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, &[u8]) -> Result<(), CacheError>,
    ) -> Result<(), CacheError> {
        let read_txn = self.db.begin_read().map_err(CacheError::backend)?;
        let table = read_txn
            .open_table(EMBEDDINGS_TABLE)
            .map_err(CacheError::backend)?;

        for item in table.range(prefix..).map_err(CacheError::backend)? {
            let (key, value) = item.map_err(CacheError::backend)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            visitor(key, value.value())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn redb_backend_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let backend = RedbBackend::open(temp_file.path()).unwrap();

        backend.put("cur/1/clip_vitb32", b"value1").unwrap();
        assert_eq!(
            backend.get("cur/1/clip_vitb32").unwrap(),
            Some(b"value1".to_vec())
        );
        assert_eq!(backend.get("cur/1/missing").unwrap(), None);

        backend.delete("cur/1/clip_vitb32").unwrap();
        assert_eq!(backend.get("cur/1/clip_vitb32").unwrap(), None);
    }

    #[test]
    fn redb_apply_and_prefix_scan() {
        let temp_file = NamedTempFile::new().unwrap();
        let backend = RedbBackend::open(temp_file.path()).unwrap();

        backend
            .apply(vec![
                WriteOp::put("ver/7/p/00000000000000000002", b"b".to_vec()),
                WriteOp::put("ver/7/p/00000000000000000001", b"a".to_vec()),
                WriteOp::put("ver/70/p/00000000000000000003", b"c".to_vec()),
                WriteOp::put("cur/7/p", b"cur".to_vec()),
            ])
            .unwrap();

        let mut seen = Vec::new();
        backend
            .scan_prefix("ver/7/", &mut |key: &str, value: &[u8]| {
                seen.push((key.to_string(), value.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, b"a".to_vec());
        assert_eq!(seen[1].1, b"b".to_vec());
    }

    #[test]
    fn redb_reopen_keeps_data() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let backend = RedbBackend::open(temp_file.path()).unwrap();
            backend.put("k", b"v").unwrap();
        }
        let backend = RedbBackend::open(temp_file.path()).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
