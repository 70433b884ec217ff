//! On-disk cache of text payloads keyed by arbitrary strings

use chrono::{Days, Local, NaiveDate};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::hasher::KeyHash;
use super::index::IndexLog;
use super::tree::{self, NodeRange};
use super::types::{
    CacheError, CacheOperation, CacheOperationResult, CacheOptions, CacheStatistics, IndexRecord,
    Result,
};

/// State guarded by the rebalancing lock.
#[derive(Debug)]
struct CacheState {
    index_lines: usize,
}

/// Content-addressed disk cache with a self-balancing directory tree.
///
/// Shareable across threads behind an `Arc`. Every mutation of the tree or
/// the index, and every read that depends on where an entry lives, runs under
/// a single lock; [`DiskCache::is_cached`] and [`DiskCache::cache_filename`]
/// do not take it.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    options: CacheOptions,
    index: IndexLog,
    state: Mutex<CacheState>,
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `path` and expire stale entries.
    pub fn open(path: impl AsRef<Path>, options: CacheOptions) -> Result<Self> {
        options.validate()?;
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let index = IndexLog::new(&root);
        let index_lines = index.line_count()?;
        let cache = Self {
            root,
            options,
            index,
            state: Mutex::new(CacheState { index_lines }),
        };

        let expired = cache.invalidate_expired_entries(None)?;
        info!(
            "Opened cache at {} ({} index records, {} expired)",
            cache.root.display(),
            index_lines,
            expired.items_affected
        );
        Ok(cache)
    }

    /// Open with [`CacheOptions::default`].
    pub fn with_defaults(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, CacheOptions::default())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path where `key` is (or would be) stored in the current tree.
    pub fn cache_filename(&self, key: &str) -> Result<PathBuf> {
        let digest = KeyHash::from_key(key);
        Ok(tree::locate(&self.root, &digest)?.join(digest.to_hex()))
    }

    /// Best-effort existence check; a concurrent split may move the entry right after.
    pub fn is_cached(&self, key: &str) -> bool {
        match self.cache_filename(key) {
            Ok(path) => path.is_file(),
            Err(e) => {
                debug!("Existence check for {:?} failed: {}", key, e);
                false
            }
        }
    }

    /// Store `value` under `key`, dated today.
    pub fn add_to_cache(&self, key: &str, value: &str) -> Result<()> {
        self.add_to_cache_on(key, value, Local::now().date_naive())
    }

    /// Store `value` under `key` with an explicit index date.
    pub fn add_to_cache_on(&self, key: &str, value: &str, date: NaiveDate) -> Result<()> {
        let digest = KeyHash::from_key(key);
        let needs_rebalance = {
            let mut state = self.lock();
            let leaf = tree::locate(&self.root, &digest)?;
            // Every data file must have an index record.
            self.index.append(date, &digest, key)?;
            state.index_lines += 1;
            write_entry(&leaf, &digest, value)?;
            debug!("Stored {} in {}", digest, leaf.display());
            state.index_lines % self.options.rebalancing_limit == 0
        };

        if needs_rebalance {
            self.rebalance_cache_tree()?;
        }
        Ok(())
    }

    /// Read a cached value, or `None` when `key` is not cached.
    pub fn lookup(&self, key: &str) -> Result<Option<String>> {
        let digest = KeyHash::from_key(key);
        let _state = self.lock();
        let path = tree::locate(&self.root, &digest)?.join(digest.to_hex());
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a cached value; errors with [`CacheError::NotCached`] on a miss.
    pub fn get_from_cache(&self, key: &str) -> Result<String> {
        self.lookup(key)?.ok_or_else(|| CacheError::NotCached {
            key: key.to_string(),
        })
    }

    /// Drop one key from the tree and the index.
    pub fn invalidate_key(&self, key: &str) -> Result<CacheOperationResult> {
        self.remove_from_cache_multiple(&[key])
    }

    /// Drop several keys in one pass. `items_affected` counts deleted data files.
    pub fn remove_from_cache_multiple<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<CacheOperationResult> {
        let digests: HashSet<String> = keys
            .iter()
            .map(|key| KeyHash::from_key(key.as_ref()).to_hex())
            .collect();
        let mut state = self.lock();
        let (removed, size_freed) = self.remove_digests(&mut state, &digests)?;

        Ok(CacheOperationResult {
            operation: CacheOperation::Delete,
            message: format!("Removed {removed} of {} keys", keys.len()),
            items_affected: removed,
            size_freed_bytes: size_freed,
        })
    }

    /// Delete the data files and index records of `digests`.
    /// Returns the files deleted and the bytes they held.
    fn remove_digests(
        &self,
        state: &mut CacheState,
        digests: &HashSet<String>,
    ) -> Result<(usize, u64)> {
        if digests.is_empty() {
            return Ok((0, 0));
        }

        let mut removed = 0usize;
        let mut size_freed = 0u64;
        for name in digests {
            let digest = KeyHash::parse_hex(name)?;
            let path = tree::locate(&self.root, &digest)?.join(name);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    size_freed += size;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Cache file already gone: {}", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.index_lines = self.index.remove_digests(digests)?;
        debug!("Removed {} of {} cache entries", removed, digests.len());
        Ok((removed, size_freed))
    }

    /// Remove entries whose newest index record predates `as_of - expiry_days`.
    /// `None` means today.
    pub fn invalidate_expired_entries(
        &self,
        as_of: Option<NaiveDate>,
    ) -> Result<CacheOperationResult> {
        let as_of = as_of.unwrap_or_else(|| Local::now().date_naive());
        let cutoff = as_of
            .checked_sub_days(Days::new(u64::from(self.options.expiry_days)))
            .unwrap_or(NaiveDate::MIN);

        let mut state = self.lock();
        let mut newest: HashMap<String, IndexRecord> = HashMap::new();
        for record in self.index.records()? {
            match newest.get(&record.digest) {
                Some(existing) if existing.date >= record.date => {}
                _ => {
                    newest.insert(record.digest.clone(), record);
                }
            }
        }

        let stale: HashSet<String> = newest
            .into_values()
            .filter(|record| record.date < cutoff)
            .map(|record| {
                debug!("Expiring {:?} (stored {})", record.key, record.date);
                record.digest
            })
            .collect();

        let (removed, size_freed) = self.remove_digests(&mut state, &stale)?;
        if !stale.is_empty() {
            info!(
                "Expired {} entries older than {} ({} files deleted)",
                stale.len(),
                cutoff,
                removed
            );
        }

        Ok(CacheOperationResult {
            operation: CacheOperation::Cleanup,
            message: format!("Expired {} entries older than {cutoff}", stale.len()),
            items_affected: stale.len(),
            size_freed_bytes: size_freed,
        })
    }

    /// Split every oversized leaf, top-down. `items_affected` counts splits.
    pub fn rebalance_cache_tree(&self) -> Result<CacheOperationResult> {
        let _state = self.lock();
        let splits = tree::rebalance(&self.root, NodeRange::ROOT, self.options.max_node_files)?;
        if splits > 0 {
            info!(
                "Rebalanced cache tree at {}: {} splits",
                self.root.display(),
                splits
            );
        }
        Ok(CacheOperationResult {
            operation: CacheOperation::Rebalance,
            message: format!("Performed {splits} splits"),
            items_affected: splits,
            size_freed_bytes: 0,
        })
    }

    /// Delete every entry, directory and the index. The root itself stays.
    pub fn empty_cache(&self) -> Result<CacheOperationResult> {
        let mut state = self.lock();
        let mut items_affected = 0usize;
        let size_freed = disk_usage(&self.root);

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                items_affected += WalkDir::new(&path)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .count();
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
                items_affected += 1;
            }
        }
        state.index_lines = 0;

        info!(
            "Emptied cache at {}: {} files, {} bytes freed",
            self.root.display(),
            items_affected,
            size_freed
        );
        Ok(CacheOperationResult {
            operation: CacheOperation::Clear,
            message: format!("Cleared {items_affected} files, freed {size_freed} bytes"),
            items_affected,
            size_freed_bytes: size_freed,
        })
    }

    /// Parsed index records, oldest first.
    pub fn index_records(&self) -> Result<Vec<IndexRecord>> {
        let _state = self.lock();
        self.index.records()
    }

    pub fn stats(&self) -> Result<CacheStatistics> {
        let state = self.lock();
        let shape = tree::shape(&self.root)?;
        Ok(CacheStatistics {
            total_entries: shape.entries,
            leaf_nodes: shape.leaves,
            internal_nodes: shape.internal_nodes,
            max_depth: shape.max_depth,
            largest_leaf_entries: shape.largest_leaf,
            index_records: state.index_lines,
            disk_size_bytes: disk_usage(&self.root),
        })
    }

    /// Cached value for `key`, computing and storing it with `read_func` on a miss.
    pub fn read_cached<F, E>(&self, key: &str, read_func: F) -> std::result::Result<String, E>
    where
        F: FnOnce(&str) -> std::result::Result<String, E>,
    {
        read_cached(Some(self), key, read_func)
    }
}

/// Fetch-or-compute. With no cache, always calls `read_func`.
///
/// Errors from `read_func` propagate untouched and nothing is stored. Cache
/// I/O failures are logged and degrade to a miss (on read) or an unstored
/// value (on write).
pub fn read_cached<F, E>(
    cache: Option<&DiskCache>,
    key: &str,
    read_func: F,
) -> std::result::Result<String, E>
where
    F: FnOnce(&str) -> std::result::Result<String, E>,
{
    let Some(cache) = cache else {
        return read_func(key);
    };

    match cache.lookup(key) {
        Ok(Some(value)) => {
            debug!("Cache hit for: {}", key);
            return Ok(value);
        }
        Ok(None) => debug!("Cache miss for: {}", key),
        Err(e) => warn!("Cache lookup failed for {}, recomputing: {}", key, e),
    }

    let value = read_func(key)?;
    if let Err(e) = cache.add_to_cache(key, &value) {
        warn!("Failed to store {} in cache: {}", key, e);
    }
    Ok(value)
}

/// Write `value` to `<leaf>/<digest>` through a temporary file in the same leaf.
fn write_entry(leaf: &Path, digest: &KeyHash, value: &str) -> Result<PathBuf> {
    let target = leaf.join(digest.to_hex());
    let mut tmp = NamedTempFile::new_in(leaf)?;
    tmp.write_all(value.as_bytes())?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(target)
}

fn disk_usage(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_options() -> CacheOptions {
        CacheOptions {
            max_node_files: 2,
            rebalancing_limit: 4,
            expiry_days: 10,
        }
    }

    #[test]
    fn test_open_creates_root() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("nested").join("cache");
        let cache = DiskCache::with_defaults(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(cache.options(), &CacheOptions::default());
    }

    #[test]
    fn test_open_rejects_zero_limits() {
        let temp_dir = tempdir().unwrap();
        let options = CacheOptions {
            rebalancing_limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            DiskCache::open(temp_dir.path(), options),
            Err(CacheError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_store_and_retrieve() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::with_defaults(temp_dir.path()).unwrap();

        cache.add_to_cache("A", "hello").unwrap();
        assert!(cache.is_cached("A"));
        assert_eq!(cache.get_from_cache("A").unwrap(), "hello");

        cache.invalidate_key("A").unwrap();
        assert!(!cache.is_cached("A"));
        assert!(matches!(
            cache.get_from_cache("A"),
            Err(CacheError::NotCached { .. })
        ));
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::with_defaults(temp_dir.path()).unwrap();
        cache.add_to_cache("k", "one").unwrap();
        cache.add_to_cache("k", "two").unwrap();
        assert_eq!(cache.get_from_cache("k").unwrap(), "two");
        assert_eq!(cache.index_records().unwrap().len(), 2);
    }

    #[test]
    fn test_cache_filename_lives_under_root() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::with_defaults(temp_dir.path()).unwrap();
        let path = cache.cache_filename("some key").unwrap();
        assert!(path.starts_with(temp_dir.path()));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            KeyHash::from_key("some key").to_hex()
        );
    }

    #[test]
    fn test_rebalance_triggered_by_index_line_count() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::open(temp_dir.path(), small_options()).unwrap();

        for i in 0..3 {
            cache.add_to_cache(&format!("key-{i}"), "v").unwrap();
        }
        assert!(tree::child_boundaries(temp_dir.path()).unwrap().is_empty());

        cache.add_to_cache("key-3", "v").unwrap();
        assert_eq!(tree::child_boundaries(temp_dir.path()).unwrap().len(), 2);

        for i in 0..4 {
            assert_eq!(cache.get_from_cache(&format!("key-{i}")).unwrap(), "v");
        }
    }

    #[test]
    fn test_removal_tolerates_missing_file() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::with_defaults(temp_dir.path()).unwrap();
        cache.add_to_cache("gone", "x").unwrap();
        fs::remove_file(cache.cache_filename("gone").unwrap()).unwrap();

        let result = cache
            .remove_from_cache_multiple(&["gone", "never"])
            .unwrap();
        assert_eq!(result.operation, CacheOperation::Delete);
        assert_eq!(result.items_affected, 0);
        assert!(cache.index_records().unwrap().is_empty());
    }

    #[test]
    fn test_expiry_keeps_reinserted_entries() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::with_defaults(temp_dir.path()).unwrap();
        let as_of = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let old = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let recent = NaiveDate::from_ymd_opt(2024, 6, 29).unwrap();

        cache.add_to_cache_on("stale", "s", old).unwrap();
        cache.add_to_cache_on("refreshed", "r1", old).unwrap();
        cache.add_to_cache_on("refreshed", "r2", recent).unwrap();

        let result = cache.invalidate_expired_entries(Some(as_of)).unwrap();
        assert_eq!(result.items_affected, 1);
        assert!(!cache.is_cached("stale"));
        assert_eq!(cache.get_from_cache("refreshed").unwrap(), "r2");
    }

    #[test]
    fn test_read_cached_without_cache_always_computes() {
        let mut calls = 0;
        for _ in 0..3 {
            let value: std::result::Result<String, CacheError> = read_cached(None, "k", |k| {
                calls += 1;
                Ok(format!("computed {k}"))
            });
            assert_eq!(value.unwrap(), "computed k");
        }
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_empty_cache_removes_everything() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::open(temp_dir.path(), small_options()).unwrap();
        for i in 0..8 {
            cache.add_to_cache(&format!("k{i}"), "v").unwrap();
        }
        let result = cache.empty_cache().unwrap();
        assert!(result.items_affected >= 9);
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.index_records, 0);

        cache.add_to_cache("again", "v").unwrap();
        assert!(cache.is_cached("again"));
    }

    #[test]
    fn test_failed_index_append_leaves_no_orphan_file() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::with_defaults(temp_dir.path()).unwrap();
        // A directory where the index file belongs makes every append fail.
        fs::create_dir(temp_dir.path().join(crate::cache_engine::index::INDEX_FILE_NAME)).unwrap();

        assert!(cache.add_to_cache("orphan", "v").is_err());
        assert!(!cache.is_cached("orphan"));
        assert!(tree::entry_files(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_management_operations_report_their_kind() {
        let temp_dir = tempdir().unwrap();
        let cache = DiskCache::open(temp_dir.path(), small_options()).unwrap();
        for i in 0..3 {
            cache.add_to_cache(&format!("k{i}"), "value").unwrap();
        }

        let rebalanced = cache.rebalance_cache_tree().unwrap();
        assert_eq!(rebalanced.operation, CacheOperation::Rebalance);
        assert!(rebalanced.items_affected >= 1);

        let deleted = cache.invalidate_key("k0").unwrap();
        assert_eq!(deleted.operation, CacheOperation::Delete);
        assert_eq!(deleted.items_affected, 1);
        assert_eq!(deleted.size_freed_bytes, "value".len() as u64);
    }
}
