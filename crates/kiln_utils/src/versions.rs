use crate::{HashError, hash_file};
use kiln_core::ObjectId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

/**
 * Caches file content hashes, keyed by path and revalidated against the
 * file's size and modification time so unchanged files are hashed once.
 */
#[derive(Debug, Default)]
pub struct FileVersionTracker {
    entries: Mutex<HashMap<PathBuf, (FileStamp, ObjectId)>>,
}

impl FileVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * Current content hash of a file.
     */
    pub fn compute_file_hash(&self, path: &Path) -> Result<ObjectId, HashError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| HashError::IoError(path.display().to_string(), e))?;
        let stamp = FileStamp {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        };

        {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((cached_stamp, id)) = entries.get(path)
                && *cached_stamp == stamp
            {
                return Ok(*id);
            }
        }

        // Hash outside the lock; another thread may race us on the same file
        let id = hash_file(path)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), (stamp, id));
        Ok(id)
    }

    /// Drop the cached hash of a file, e.g. after writing it
    pub fn forget(&self, path: &Path) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_bytes;

    #[test]
    fn test_tracks_content_changes() {
        let dir = std::env::temp_dir().join("kiln_versions_test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("shader.sdsl");

        let tracker = FileVersionTracker::new();

        std::fs::write(&file, "short").unwrap();
        assert_eq!(tracker.compute_file_hash(&file).unwrap(), hash_bytes(b"short"));

        // Different length invalidates the stamp even within the mtime granularity
        std::fs::write(&file, "much longer").unwrap();
        assert_eq!(
            tracker.compute_file_hash(&file).unwrap(),
            hash_bytes(b"much longer")
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_error() {
        let tracker = FileVersionTracker::new();
        let missing = std::env::temp_dir().join("kiln_versions_missing/none");
        assert!(tracker.compute_file_hash(&missing).is_err());
    }
}
