//! Durable cache store backed by redb.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::CacheStore;
use crate::PeerCacheError;

/// Key: encoded `(topic, node id)` pair. Value: encoded node record.
const PEERS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("peers");

/// Peer cache store persisted in a single redb file.
pub struct RedbCacheStore {
    db: Database,
}

impl RedbCacheStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PeerCacheError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PEERS_TABLE)?;
        }
        write_txn.commit()?;

        debug!("opened redb peer cache");
        Ok(Self { db })
    }
}

impl std::fmt::Debug for RedbCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbCacheStore").finish_non_exhaustive()
    }
}

impl CacheStore for RedbCacheStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PeerCacheError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PeerCacheError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;
        Ok(table.get(key)?.map(|value| value.value().to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), PeerCacheError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PeerCacheError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        let mut entries = Vec::new();
        for entry in table.range::<&[u8]>(prefix..)? {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }
}

impl From<redb::DatabaseError> for PeerCacheError {
    fn from(err: redb::DatabaseError) -> Self {
        PeerCacheError::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for PeerCacheError {
    fn from(err: redb::TransactionError) -> Self {
        PeerCacheError::Storage(err.to_string())
    }
}

impl From<redb::TableError> for PeerCacheError {
    fn from(err: redb::TableError) -> Self {
        PeerCacheError::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for PeerCacheError {
    fn from(err: redb::StorageError) -> Self {
        PeerCacheError::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for PeerCacheError {
    fn from(err: redb::CommitError) -> Self {
        PeerCacheError::Storage(err.to_string())
    }
}
