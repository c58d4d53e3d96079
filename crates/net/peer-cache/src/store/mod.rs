//! Ordered key-value backends for the peer cache.

mod memory;
#[cfg(feature = "redb")]
mod redb_store;

use auto_impl::auto_impl;

use crate::PeerCacheError;

pub use memory::MemoryCacheStore;
#[cfg(feature = "redb")]
pub use redb_store::RedbCacheStore;

/// Ordered byte-keyed store with prefix scans.
///
/// Keys are compared lexicographically; `scan_prefix` returns entries in key
/// order.
#[auto_impl(&, Box, Arc)]
pub trait CacheStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PeerCacheError>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PeerCacheError>;

    /// Removing a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), PeerCacheError>;

    /// Up to `limit` entries whose key starts with `prefix`.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PeerCacheError>;

    fn count_prefix(&self, prefix: &[u8], limit: usize) -> Result<usize, PeerCacheError> {
        Ok(self.scan_prefix(prefix, limit)?.len())
    }
}
