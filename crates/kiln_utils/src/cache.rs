use kiln_core::{CommandResult, ObjectId};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const RESULTS_DIR: &str = "results";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to access result cache: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to parse cached result '{0}': {1}")]
    ParseError(String, serde_json::Error),
}

/**
 * Handle for the command result cache.
 * Maps a command's cache key to the full result of its last successful
 * execution; entries are stored one JSON file per key on disk.
 *
 */
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    root: PathBuf,
    entries: HashMap<ObjectId, CommandResult>,
}

impl ResultCache {
    /**
     * Create a new cache handle rooted at a build directory
     */
    pub fn new(build_path: &Path) -> Self {
        Self {
            root: build_path.to_path_buf(),
            entries: HashMap::new(),
        }
    }

    /**
     * Load all cached entries from disk; unreadable entries are skipped
     */
    pub fn load_all(&mut self) -> Result<(), CacheError> {
        let cache_dir = self.cache_dir();
        if !cache_dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(&cache_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) == Some("json")
                && let Some(key) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<ObjectId>().ok())
                && let Ok(result) = self.load_entry(&path)
            {
                self.entries.insert(key, result);
            }
        }

        Ok(())
    }

    /**
     * Look up the result stored under a cache key.
     */
    pub fn get(&mut self, key: &ObjectId) -> Result<Option<CommandResult>, CacheError> {
        if let Some(result) = self.entries.get(key) {
            return Ok(Some(result.clone()));
        }

        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let result = self.load_entry(&path)?;
        self.entries.insert(*key, result.clone());
        Ok(Some(result))
    }

    /**
     * Record a result and write it through to disk.
     * The file is replaced atomically so readers never see a partial entry.
     */
    pub fn record(&mut self, key: ObjectId, result: CommandResult) -> Result<(), CacheError> {
        let cache_dir = self.cache_dir();
        fs::create_dir_all(&cache_dir)?;

        let path = self.entry_path(&key);
        let tmp_path = cache_dir.join(format!("{}.tmp", key));

        let content = serde_json::to_string_pretty(&result)
            .map_err(|e| CacheError::ParseError(path.display().to_string(), e))?;
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;

        self.entries.insert(key, result);
        Ok(())
    }

    /**
     * Invalidate a single entry
     */
    pub fn invalidate(&mut self, key: &ObjectId) -> Result<(), CacheError> {
        self.entries.remove(key);

        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /**
     * Evict every entry whose input versions mention one of the given
     * identifiers (matched against the input url path).
     * Returns the number of entries evicted.
     */
    pub fn evict_referencing(&mut self, modified: &BTreeSet<String>) -> Result<usize, CacheError> {
        if modified.is_empty() {
            return Ok(0);
        }

        self.load_all()?;
        let stale: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|(_, result)| modified.iter().any(|path| result.depends_on_path(path)))
            .map(|(key, _)| *key)
            .collect();

        for key in &stale {
            debug!(key = %key, "evicting cached result with modified input");
            self.invalidate(key)?;
        }

        Ok(stale.len())
    }

    /**
     * List all cached keys; primarily for debugging.
     */
    pub fn cached_keys(&self) -> Result<Vec<ObjectId>, CacheError> {
        let cache_dir = self.cache_dir();
        if !cache_dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in fs::read_dir(&cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json")
                && let Some(key) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<ObjectId>().ok())
            {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    /**
     * Clear the cache
     */
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.entries.clear();

        let cache_dir = self.cache_dir();
        if cache_dir.exists() {
            fs::remove_dir_all(&cache_dir)?;
        }
        Ok(())
    }

    fn cache_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    fn entry_path(&self, key: &ObjectId) -> PathBuf {
        self.cache_dir().join(format!("{}.json", key))
    }

    fn load_entry(&self, path: &Path) -> Result<CommandResult, CacheError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| CacheError::ParseError(path.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ObjectUrl, ResultStatus};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kiln_cache_test_{}", name));
        let _ = fs::remove_dir_all(&dir); // Clean up any previous test
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn key(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 32])
    }

    fn result_reading(path: &str) -> CommandResult {
        let mut result = CommandResult::new(ResultStatus::Successful);
        result
            .input_dependency_versions
            .insert(ObjectUrl::file(path), key(9));
        result
    }

    #[test]
    fn test_cache_miss() {
        let dir = temp_dir("miss");
        let mut cache = ResultCache::new(&dir);

        assert_eq!(cache.get(&key(1)).unwrap(), None);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cache_persistence() {
        let dir = temp_dir("persistence");

        // First run: record results
        {
            let mut cache = ResultCache::new(&dir);
            cache.record(key(1), result_reading("a.png")).unwrap();
            cache.record(key(2), result_reading("b.png")).unwrap();
        }

        // Second run: load from disk
        {
            let mut cache = ResultCache::new(&dir);
            assert_eq!(cache.get(&key(1)).unwrap(), Some(result_reading("a.png")));
            assert_eq!(cache.get(&key(2)).unwrap(), Some(result_reading("b.png")));
            assert_eq!(cache.get(&key(3)).unwrap(), None);
        }

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_entry_is_error() {
        let dir = temp_dir("corrupt");
        let mut cache = ResultCache::new(&dir);
        cache.record(key(1), result_reading("a.png")).unwrap();
        fs::write(dir.join(RESULTS_DIR).join(format!("{}.json", key(1))), "{").unwrap();

        let mut fresh = ResultCache::new(&dir);
        assert!(matches!(
            fresh.get(&key(1)),
            Err(CacheError::ParseError(_, _))
        ));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cache_invalidate() {
        let dir = temp_dir("invalidate");
        let mut cache = ResultCache::new(&dir);

        cache.record(key(1), result_reading("a.png")).unwrap();
        cache.invalidate(&key(1)).unwrap();

        assert_eq!(cache.get(&key(1)).unwrap(), None);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_evict_referencing_modified_inputs() {
        let dir = temp_dir("evict");
        {
            let mut cache = ResultCache::new(&dir);
            cache.record(key(1), result_reading("shaders/Lighting.sdsl")).unwrap();
            cache.record(key(2), result_reading("shaders/Sky.sdsl")).unwrap();
        }

        // Eviction sees entries written by an earlier handle
        let mut cache = ResultCache::new(&dir);
        let modified = BTreeSet::from(["shaders/Lighting.sdsl".to_string()]);
        assert_eq!(cache.evict_referencing(&modified).unwrap(), 1);

        assert_eq!(cache.get(&key(1)).unwrap(), None);
        assert!(cache.get(&key(2)).unwrap().is_some());
        assert_eq!(cache.evict_referencing(&BTreeSet::new()).unwrap(), 0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cached_keys_list_and_clear() {
        let dir = temp_dir("list");
        let mut cache = ResultCache::new(&dir);

        cache.record(key(3), CommandResult::default()).unwrap();
        cache.record(key(1), CommandResult::default()).unwrap();
        cache.record(key(2), CommandResult::default()).unwrap();

        assert_eq!(cache.cached_keys().unwrap(), vec![key(1), key(2), key(3)]); // Sorted

        cache.clear().unwrap();
        assert!(cache.cached_keys().unwrap().is_empty());
        assert_eq!(cache.get(&key(1)).unwrap(), None);

        fs::remove_dir_all(&dir).ok();
    }
}
