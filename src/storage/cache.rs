//! On-disk cache store for raw extraction results
//!
//! Entries are addressed by `(namespace, key, params)` and carry their own TTL
//! in a JSON sidecar. Expiry is checked lazily on read; files are only
//! removed by `invalidate`, `cleanup_expired`, `cleanup_older_than` or
//! `clear_all`.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCRAPED_DIR: &str = "scraped_data";
const PROCESSED_DIR: &str = "processed_data";
const METADATA_DIR: &str = "metadata";
const TEMP_DIR: &str = "temp";
const SUBDIRS: [&str; 4] = [SCRAPED_DIR, PROCESSED_DIR, METADATA_DIR, TEMP_DIR];

const PAYLOAD_EXT: &str = "cache";
const META_EXT: &str = "meta";
const HASH_LEN: usize = 32;

/// Extra key material. Stored sorted so insertion order never changes the hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheParams(BTreeMap<String, serde_json::Value>);

impl CacheParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Sidecar written next to every payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub namespace: String,
    pub key: String,
    pub params: CacheParams,
    pub created_at: DateTime<Utc>,
    /// Seconds
    pub ttl: u64,
    pub size_bytes: u64,
}

impl CacheMetadata {
    /// `None` when the TTL is too large to represent.
    fn expires_at(&self, ttl_override: Option<u64>) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(ttl_override.unwrap_or(self.ttl)).ok()?;
        self.created_at.checked_add_signed(Duration::try_seconds(ttl)?)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl_override: Option<u64>) -> bool {
        self.expires_at(ttl_override).is_some_and(|expiry| now > expiry)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub hit_rate_percent: f64,
    pub size_bytes: u64,
}

/// A named best-effort cache warmer. Clones share the same closure, so a
/// registered warmer can run again on every warm-up.
#[derive(Clone)]
pub struct CacheWarmer {
    pub name: String,
    run: Arc<dyn Fn() -> Result<()> + Send + Sync>,
}

impl CacheWarmer {
    pub fn new(name: impl Into<String>, run: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            run: Arc::new(run),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Namespaced key/value store on the local filesystem.
pub struct CacheStore {
    root: PathBuf,
    default_ttl: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    /// Per-entry locks; the table lock is only held while fetching one.
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P, default_ttl_secs: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in SUBDIRS {
            fs::create_dir_all(root.join(sub))?;
        }
        debug!("Cache opened at {}", root.display());

        Ok(Self {
            root,
            default_ttl: default_ttl_secs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// Deterministic storage key: `{namespace}_{sha256 prefix}`.
    pub fn cache_key(namespace: &str, key: &str, params: &CacheParams) -> String {
        #[derive(Serialize)]
        struct KeyMaterial<'a> {
            key: &'a str,
            namespace: &'a str,
            params: &'a CacheParams,
        }

        let material = KeyMaterial { key, namespace, params };
        // Serializing a struct of strings and a BTreeMap cannot fail.
        let canonical = serde_json::to_vec(&material).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&canonical));
        format!("{}_{}", sanitize_namespace(namespace), &digest[..HASH_LEN])
    }

    /// Raw payload lookup. Expired, missing and unreadable entries are all misses.
    pub fn get(
        &self,
        namespace: &str,
        key: &str,
        params: &CacheParams,
        ttl_override: Option<u64>,
    ) -> Option<Vec<u8>> {
        let result = self.lookup(namespace, key, params, ttl_override);
        self.record_lookup(namespace, key, result.is_some());
        result
    }

    /// Typed lookup; a payload that no longer deserializes counts as a miss.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        params: &CacheParams,
        ttl_override: Option<u64>,
    ) -> Option<T> {
        let value = self
            .lookup(namespace, key, params, ttl_override)
            .and_then(|bytes| match serde_json::from_slice(&bytes) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Corrupt cache payload for {}:{}: {}", namespace, key, e);
                    None
                }
            });
        self.record_lookup(namespace, key, value.is_some());
        value
    }

    fn record_lookup(&self, namespace: &str, key: &str, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {}:{}", namespace, key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss for {}:{}", namespace, key);
        }
    }

    fn lookup(
        &self,
        namespace: &str,
        key: &str,
        params: &CacheParams,
        ttl_override: Option<u64>,
    ) -> Option<Vec<u8>> {
        let cache_key = Self::cache_key(namespace, key, params);
        let lock = self.key_lock(&cache_key);
        let _guard = lock.lock();

        let meta = match self.read_metadata(&self.meta_path(&cache_key)) {
            Ok(Some(meta)) => meta,
            Ok(None) => return None,
            Err(e) => {
                warn!("Invalid cache metadata for {}: {}", cache_key, e);
                return None;
            }
        };

        if meta.is_expired(Utc::now(), ttl_override) {
            debug!("Cache entry {} expired", cache_key);
            return None;
        }

        match fs::read(self.payload_path(&cache_key)) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to load cache for {}: {}", cache_key, e);
                None
            }
        }
    }

    /// Store a payload. Both files land via rename from `temp/`, so a reader
    /// never sees a half-written entry.
    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        params: &CacheParams,
        ttl_override: Option<u64>,
    ) -> Result<()> {
        let cache_key = Self::cache_key(namespace, key, params);
        let meta = CacheMetadata {
            namespace: namespace.to_string(),
            key: key.to_string(),
            params: params.clone(),
            created_at: Utc::now(),
            ttl: ttl_override.unwrap_or(self.default_ttl),
            size_bytes: value.len() as u64,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;

        let lock = self.key_lock(&cache_key);
        let _guard = lock.lock();

        self.write_atomic(&self.payload_path(&cache_key), value)?;
        self.write_atomic(&self.meta_path(&cache_key), &meta_bytes)?;

        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!("Cached {} bytes for {}:{}", value.len(), namespace, key);
        Ok(())
    }

    pub fn set_json<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        params: &CacheParams,
        ttl_override: Option<u64>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(namespace, key, &bytes, params, ttl_override)
    }

    /// Remove one entry, or every entry in `namespace` when `key` is `None`.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, namespace: &str, key: Option<&str>, params: &CacheParams) -> usize {
        let stems: Vec<String> = match key {
            Some(key) => vec![Self::cache_key(namespace, key, params)],
            None => self.namespace_stems(namespace),
        };

        let removed = stems.iter().filter(|stem| self.remove_entry(stem)).count();

        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        info!("Invalidated {} cache entries for {}", removed, namespace);
        removed
    }

    /// Remove entries whose TTL has elapsed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let removed = self.remove_where(|meta| meta.is_expired(now, None));
        info!("Cleaned up {} expired cache entries", removed);
        removed
    }

    /// Remove entries created more than `age` ago, regardless of TTL.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now() - age;
        let removed = self.remove_where(|meta| meta.created_at < cutoff);
        info!("Cleaned up {} cache entries older than {}h", removed, age.num_hours());
        removed
    }

    /// Run warmers in order; one failure does not stop the rest.
    pub fn warm_cache(&self, warmers: Vec<CacheWarmer>) -> WarmReport {
        let mut report = WarmReport::default();

        for warmer in warmers {
            info!("Warming cache with {}", warmer.name);
            match (warmer.run)() {
                Ok(()) => report.succeeded.push(warmer.name),
                Err(e) => {
                    warn!("Cache warming failed for {}: {}", warmer.name, e);
                    report.failed.push((warmer.name, e.to_string()));
                }
            }
        }

        report
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let size_bytes = [SCRAPED_DIR, PROCESSED_DIR]
            .iter()
            .flat_map(|sub| list_files(&self.root.join(sub), PAYLOAD_EXT))
            .filter_map(|path| fs::metadata(path).ok())
            .map(|m| m.len())
            .sum();

        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate_percent: (hit_rate * 100.0).round() / 100.0,
            size_bytes,
        }
    }

    /// Remove every cached file and reset counters.
    pub fn clear_all(&self) -> usize {
        let mut removed = 0;
        for sub in SUBDIRS {
            let dir = self.root.join(sub);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to list {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to delete {}: {}", entry.path().display(), e),
                }
            }
        }

        self.key_locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);

        for counter in [&self.hits, &self.misses, &self.sets, &self.invalidations] {
            counter.store(0, Ordering::Relaxed);
        }
        info!("Cleared all cache data ({} files)", removed);
        removed
    }

    fn remove_where(&self, predicate: impl Fn(&CacheMetadata) -> bool) -> usize {
        let mut removed = 0;
        for meta_path in list_files(&self.root.join(METADATA_DIR), META_EXT) {
            let Some(stem) = file_stem(&meta_path) else { continue };
            match self.read_metadata(&meta_path) {
                Ok(Some(meta)) if predicate(&meta) => {
                    if self.remove_entry(&stem) {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Error processing {}: {}", meta_path.display(), e),
            }
        }
        removed
    }

    /// Returns true if either file of the entry existed.
    fn remove_entry(&self, stem: &str) -> bool {
        let lock = self.key_lock(stem);
        let existed = {
            let _guard = lock.lock();
            let mut existed = false;
            for path in [self.payload_path(stem), self.meta_path(stem)] {
                match fs::remove_file(&path) {
                    Ok(()) => existed = true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
                }
            }
            existed
        };
        self.release_key_lock(stem, lock);
        existed
    }

    /// Stems of every entry stored under exactly `namespace`. Sanitized
    /// file names can collide across namespaces, so the sidecar decides;
    /// entries without a readable sidecar fall back to the file-name prefix.
    fn namespace_stems(&self, namespace: &str) -> Vec<String> {
        let prefix = format!("{}_", sanitize_namespace(namespace));
        let has_prefix = |stem: &str| {
            stem.strip_prefix(&prefix)
                .map(|rest| rest.len() == HASH_LEN && rest.chars().all(|c| c.is_ascii_hexdigit()))
                .unwrap_or(false)
        };

        let mut candidates = BTreeSet::new();
        for (sub, ext) in [(SCRAPED_DIR, PAYLOAD_EXT), (METADATA_DIR, META_EXT)] {
            for path in list_files(&self.root.join(sub), ext) {
                if let Some(stem) = file_stem(&path) {
                    if has_prefix(&stem) {
                        candidates.insert(stem);
                    }
                }
            }
        }

        candidates
            .into_iter()
            .filter(|stem| match self.read_metadata(&self.meta_path(stem)) {
                Ok(Some(meta)) => meta.namespace == namespace,
                Ok(None) => true,
                Err(e) => {
                    debug!("Unreadable metadata for {}: {}", stem, e);
                    true
                }
            })
            .collect()
    }

    fn read_metadata(&self, path: &Path) -> Result<Option<CacheMetadata>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = self
            .root
            .join(TEMP_DIR)
            .join(format!("{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes).map_err(|e| {
            PipelineError::Cache(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        if let Err(e) = fs::rename(&tmp, dest) {
            let _ = fs::remove_file(&tmp);
            return Err(PipelineError::Cache(format!(
                "failed to move cache file into {}: {}",
                dest.display(),
                e
            )));
        }
        Ok(())
    }

    fn key_lock(&self, cache_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the table entry once no other caller holds the lock.
    fn release_key_lock(&self, cache_key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        // One reference in the table, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(cache_key);
        }
    }

    fn payload_path(&self, cache_key: &str) -> PathBuf {
        self.root
            .join(SCRAPED_DIR)
            .join(format!("{}.{}", cache_key, PAYLOAD_EXT))
    }

    fn meta_path(&self, cache_key: &str) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(format!("{}.{}", cache_key, META_EXT))
    }
}

fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn list_files(dir: &Path, ext: &str) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
            .collect(),
        Err(e) => {
            warn!("Failed to list {}: {}", dir.display(), e);
            Vec::new()
        }
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_order_independent() {
        let a = CacheParams::new().with("season", 2024).with("team", "ARI");
        let b = CacheParams::new().with("team", "ARI").with("season", 2024);
        assert_eq!(
            CacheStore::cache_key("game_logs", "ARI", &a),
            CacheStore::cache_key("game_logs", "ARI", &b)
        );
    }

    #[test]
    fn test_cache_key_differs_by_component() {
        let p = CacheParams::new().with("season", 2024);
        let base = CacheStore::cache_key("game_logs", "ARI", &p);
        assert_ne!(base, CacheStore::cache_key("snapcounts", "ARI", &p));
        assert_ne!(base, CacheStore::cache_key("game_logs", "PHI", &p));
        assert_ne!(
            base,
            CacheStore::cache_key("game_logs", "ARI", &CacheParams::new().with("season", 2023))
        );
    }

    #[test]
    fn test_cache_key_shape() {
        let key = CacheStore::cache_key("game logs/2024", "ARI", &CacheParams::new());
        assert!(key.starts_with("game_logs_2024_"));
        assert_eq!(key.len(), "game_logs_2024_".len() + HASH_LEN);
    }

    #[test]
    fn test_key_locks_released_after_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), 3600).unwrap();
        for team in ["ARI", "PHI", "BUF"] {
            let p = CacheParams::new().with("team", team);
            store.set("game_logs", team, b"[]", &p, None).unwrap();
            assert!(store.get("game_logs", team, &p, None).is_some());
        }
        assert_eq!(store.key_locks.lock().len(), 3);

        let p = CacheParams::new().with("team", "ARI");
        assert_eq!(store.invalidate("game_logs", Some("ARI"), &p), 1);
        assert_eq!(store.key_locks.lock().len(), 2);

        store.clear_all();
        assert!(store.key_locks.lock().is_empty());
    }

    #[test]
    fn test_metadata_expiry() {
        let meta = CacheMetadata {
            namespace: "ns".into(),
            key: "k".into(),
            params: CacheParams::new(),
            created_at: Utc::now() - Duration::seconds(120),
            ttl: 60,
            size_bytes: 0,
        };
        assert!(meta.is_expired(Utc::now(), None));
        assert!(!meta.is_expired(Utc::now(), Some(3600)));
    }
}
