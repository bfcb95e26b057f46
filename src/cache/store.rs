//! Persistent split cache using redb.
//!
//! Strategy: a derived train/test split is computed once per test identity
//! and reused by every later run with the same dataset-shaping parameters.
//!
//! Cache structure:
//! - Database: `<cache_dir>/splits.redb`
//! - Key: identity hex digest
//! - Value: bincode-serialized [`DatasetSplit`]
//!
//! The split is keyed by the test identity, which covers the train identity's
//! groups as well, so two runs that share training data but filter the test
//! set differently never overwrite each other.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError};
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};
use crate::matrix::HashedIdentity;

/// Key = identity hex, Value = serialized DatasetSplit
const SPLITS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("splits");

/// Train passwords in order (duplicates kept) and the deduplicated test set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSplit {
    pub train: Vec<String>,
    pub test: HashSet<String>,
}

impl DatasetSplit {
    fn to_bytes(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn test_size(&self) -> usize {
        self.test.len()
    }
}

fn cache_err(identity: &str, reason: impl Display) -> BenchError {
    BenchError::Cache {
        identity: identity.to_string(),
        reason: reason.to_string(),
    }
}

/// Persistent split cache backed by redb.
pub struct SplitCache {
    db: Database,
    path: PathBuf,
    /// One lock per identity currently being built
    building: Mutex<HashMap<HashedIdentity, Arc<Mutex<()>>>>,
}

impl SplitCache {
    /// Open or create `<cache_dir>/splits.redb`.
    pub fn open(cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir)
            .map_err(|e| cache_err("<open>", format!("cannot create {}: {}", cache_dir.display(), e)))?;

        let path = cache_dir.join("splits.redb");
        let db = Database::create(&path)
            .map_err(|e| cache_err("<open>", format!("cannot open {}: {}", path.display(), e)))?;

        Ok(Self {
            db,
            path,
            building: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a split. A missing entry is `Ok(None)`; so is an entry that
    /// no longer deserializes, after a warning.
    pub fn get(&self, identity: &HashedIdentity) -> Result<Option<DatasetSplit>> {
        let key = identity.as_str();
        let read_txn = self.db.begin_read().map_err(|e| cache_err(key, e))?;
        let table = match read_txn.open_table(SPLITS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(cache_err(key, e)),
        };

        let Some(guard) = table.get(key).map_err(|e| cache_err(key, e))? else {
            return Ok(None);
        };

        match DatasetSplit::from_bytes(guard.value()) {
            Ok(split) => Ok(Some(split)),
            Err(e) => {
                tracing::warn!(identity = identity.short(), error = %e, "corrupt split cache entry, rebuilding");
                Ok(None)
            }
        }
    }

    /// Store a split, replacing any previous entry.
    pub fn set(&self, identity: &HashedIdentity, split: &DatasetSplit) -> Result<()> {
        let key = identity.as_str();
        let bytes = split.to_bytes().map_err(|e| cache_err(key, e))?;

        let write_txn = self.db.begin_write().map_err(|e| cache_err(key, e))?;
        {
            let mut table = write_txn.open_table(SPLITS_TABLE).map_err(|e| cache_err(key, e))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| cache_err(key, e))?;
        }
        write_txn.commit().map_err(|e| cache_err(key, e))?;
        Ok(())
    }

    /// Return the cached split, or build, persist and return it.
    ///
    /// Concurrent callers asking for the same identity serialize on a
    /// per-identity lock and re-check the cache once they hold it, so the
    /// builder runs at most once per identity in this process.
    pub fn get_or_build<F>(&self, identity: &HashedIdentity, builder: F) -> Result<DatasetSplit>
    where
        F: FnOnce() -> Result<DatasetSplit>,
    {
        if let Some(split) = self.get(identity)? {
            tracing::debug!(identity = identity.short(), "split cache hit");
            return Ok(split);
        }

        let lock = self.build_lock(identity);
        let _guard = lock_ignoring_poison(&*lock);

        if let Some(split) = self.get(identity)? {
            tracing::debug!(identity = identity.short(), "split built by a concurrent run");
            return Ok(split);
        }

        tracing::info!(identity = identity.short(), "split cache miss, building");
        let split = builder()?;
        self.set(identity, &split)?;
        Ok(split)
    }

    fn build_lock(&self, identity: &HashedIdentity) -> Arc<Mutex<()>> {
        let mut building = lock_ignoring_poison(&self.building);
        building.entry(identity.clone()).or_default().clone()
    }

    /// Remove every entry. The database file itself stays.
    pub fn clear(&self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(|e| cache_err("<clear>", e))?;
        write_txn
            .delete_table(SPLITS_TABLE)
            .map_err(|e| cache_err("<clear>", e))?;
        write_txn.commit().map_err(|e| cache_err("<clear>", e))?;
        Ok(())
    }

    /// Entry count and approximate payload size.
    pub fn stats(&self) -> CacheStats {
        let Ok(read_txn) = self.db.begin_read() else {
            return CacheStats::default();
        };
        let Ok(table) = read_txn.open_table(SPLITS_TABLE) else {
            return CacheStats::default();
        };

        let entries = table.len().unwrap_or(0) as usize;
        let size_bytes = table
            .iter()
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|r| r.ok())
            .map(|(k, v)| k.value().len() + v.value().len())
            .sum::<usize>() as u64;

        CacheStats { entries, size_bytes }
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    /// Keys plus values, in bytes
    pub size_bytes: u64,
}

impl CacheStats {
    pub fn size_human(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        match self.size_bytes {
            b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
            b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
            b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
            b => format!("{} B", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn split(train: &[&str], test: &[&str]) -> DatasetSplit {
        DatasetSplit {
            train: train.iter().map(|s| s.to_string()).collect(),
            test: test.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn id(name: &str) -> HashedIdentity {
        HashedIdentity::of_bytes(name.as_bytes())
    }

    #[test]
    fn test_roundtrip_preserves_order_and_duplicates() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = SplitCache::open(dir.path())?;
        let stored = split(&["b", "a", "b"], &["x", "y"]);

        assert_eq!(cache.get(&id("one"))?, None);
        cache.set(&id("one"), &stored)?;
        assert_eq!(cache.get(&id("one"))?, Some(stored));
        Ok(())
    }

    #[test]
    fn test_builder_runs_once_per_identity() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = SplitCache::open(dir.path())?;
        let calls = AtomicUsize::new(0);

        let build = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(split(&["a"], &["b"]))
        };

        let first = cache.get_or_build(&id("k"), build)?;
        let second = cache.get_or_build(&id("k"), build)?;
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_builds_share_one_builder_call() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = SplitCache::open(dir.path())?;
        let calls = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_build(&id("shared"), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok(split(&["a"], &["b"]))
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_builder_error_is_not_cached() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = SplitCache::open(dir.path())?;

        let err = cache.get_or_build(&id("bad"), || Err(BenchError::config("no datasets")));
        assert!(err.is_err());
        assert_eq!(cache.get(&id("bad"))?, None);
        Ok(())
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = SplitCache::open(dir.path())?;

        let write_txn = cache.db.begin_write().unwrap();
        {
            let mut table = write_txn.open_table(SPLITS_TABLE).unwrap();
            table.insert(id("c").as_str(), &[0xffu8, 0xff, 0xff][..]).unwrap();
        }
        write_txn.commit().unwrap();

        assert_eq!(cache.get(&id("c"))?, None);
        let rebuilt = cache.get_or_build(&id("c"), || Ok(split(&["z"], &[])))?;
        assert_eq!(rebuilt.train, vec!["z"]);
        Ok(())
    }

    #[test]
    fn test_persists_across_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let cache = SplitCache::open(dir.path())?;
            cache.set(&id("p"), &split(&["a"], &["b"]))?;
        }
        let cache = SplitCache::open(dir.path())?;
        assert!(cache.get(&id("p"))?.is_some());
        Ok(())
    }

    #[test]
    fn test_stats_and_clear() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = SplitCache::open(dir.path())?;
        assert_eq!(cache.stats().entries, 0);

        cache.set(&id("1"), &split(&["a"], &["b"]))?;
        cache.set(&id("2"), &split(&["c"], &["d"]))?;
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert!(stats.size_bytes > 0);
        assert!(stats.size_human().ends_with('B'));

        cache.clear()?;
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.get(&id("1"))?, None);
        Ok(())
    }

    #[test]
    fn test_size_human_units() {
        let stats = CacheStats { entries: 1, size_bytes: 3 * 1024 * 1024 };
        assert_eq!(stats.size_human(), "3.00 MB");
        let stats = CacheStats { entries: 1, size_bytes: 512 };
        assert_eq!(stats.size_human(), "512 B");
    }
}
