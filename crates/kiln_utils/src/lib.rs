//! Utility functions for the kiln build engine
//!
//! Content hashing, the object database, the command result cache and the
//! file version tracker.

pub mod cache;
pub mod store;
pub mod versions;

use kiln_core::{OBJECT_ID_LEN, ObjectId};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use cache::{CacheError, ResultCache};
pub use store::{FileObjectDatabase, MemoryObjectDatabase, ObjectDatabase, StoreError, write_content};
pub use versions::FileVersionTracker;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Failed to read file '{0}': {1}")]
    IoError(String, std::io::Error),
    #[error("Failed to serialize command parameter: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("Glob pattern error: {0}")]
    GlobError(#[from] glob::PatternError),
    #[error("No files matched pattern: {0}")]
    NoFilesMatched(String),
}

fn finish(hasher: Sha256) -> ObjectId {
    let digest: [u8; OBJECT_ID_LEN] = hasher.finalize().into();
    ObjectId::from_bytes(digest)
}

/**
 * Hash a single file's content
 */
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<ObjectId, HashError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| HashError::IoError(path.display().to_string(), e))?;

    // Use a buffered reader to be efficient for large files
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| HashError::IoError(path.display().to_string(), e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(finish(hasher))
}

/**
 * Hash an in-memory blob; this is the id it gets in the object database
 */
pub fn hash_bytes(data: &[u8]) -> ObjectId {
    let mut hasher = Sha256::new();
    hasher.update(data);
    finish(hasher)
}

/**
 * Accumulates the parameters of a command into its parameter hash.
 *
 * Each value is serialized to JSON and length-prefixed so that adjacent
 * values cannot run into each other.
 */
pub struct ParameterWriter {
    hasher: Sha256,
}

impl ParameterWriter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
    }

    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), HashError> {
        let bytes = serde_json::to_vec(value)?;
        self.write_bytes(&bytes);
        Ok(())
    }

    pub fn write_id(&mut self, id: &ObjectId) {
        self.hasher.update(id.as_bytes());
    }

    pub fn finish(self) -> ObjectId {
        finish(self.hasher)
    }
}

impl Default for ParameterWriter {
    fn default() -> Self {
        Self::new()
    }
}

/**
 * Expand glob patterns and return matching file paths
 */
pub fn expand_globs(patterns: &[String], base_dir: &Path) -> Result<Vec<PathBuf>, HashError> {
    let mut files = Vec::new();

    for pattern in patterns {
        let full_pattern = base_dir.join(pattern);
        let pattern_str = full_pattern.to_string_lossy();

        let matches: Vec<_> = glob::glob(&pattern_str)?.filter_map(Result::ok).collect();

        if matches.is_empty() {
            if !pattern.contains('*') && !pattern.contains('?') {
                let literal_path = base_dir.join(pattern);
                if literal_path.exists() {
                    files.push(literal_path);
                } else {
                    return Err(HashError::NoFilesMatched(pattern.clone()));
                }
            } else {
                return Err(HashError::NoFilesMatched(pattern.clone()));
            }
        } else {
            files.extend(matches);
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_bytes() {
        let hash1 = hash_bytes(b"hello world");
        let hash2 = hash_bytes(b"hello world");
        let hash3 = hash_bytes(b"hello world!");

        assert_eq!(hash1, hash2, "Same input should produce same hash");
        assert_ne!(
            hash1, hash3,
            "Different input should produce different hash"
        );
        assert_eq!(hash1.to_hex().len(), 64, "SHA-256 hex should be 64 chars");
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = std::env::temp_dir().join("kiln_test_hash");
        std::fs::create_dir_all(&dir).unwrap();

        let file_path = dir.join("test.txt");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"test content").unwrap();

        let hash = hash_file(&file_path).unwrap();
        assert_eq!(hash, hash_bytes(b"test content"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_hash_missing_file_fails() {
        let path = std::env::temp_dir().join("kiln_test_hash_missing/none.bin");
        assert!(matches!(hash_file(&path), Err(HashError::IoError(_, _))));
    }

    #[test]
    fn test_parameter_writer_is_order_sensitive() {
        let mut ab = ParameterWriter::new();
        ab.write_str("a");
        ab.write_str("b");

        let mut ba = ParameterWriter::new();
        ba.write_str("b");
        ba.write_str("a");

        // Length prefixes keep ("ab", "") apart from ("a", "b")
        let mut joined = ParameterWriter::new();
        joined.write_str("ab");
        joined.write_str("");

        let ab = ab.finish();
        assert_ne!(ab, ba.finish());
        assert_ne!(ab, joined.finish());
    }

    #[test]
    fn test_parameter_writer_serializes_values() {
        #[derive(Serialize)]
        struct TextureParams {
            format: &'static str,
            mipmaps: bool,
        }

        let hash = |mipmaps| {
            let mut writer = ParameterWriter::new();
            writer
                .write(&TextureParams {
                    format: "BC7",
                    mipmaps,
                })
                .unwrap();
            writer.finish()
        };

        assert_eq!(hash(true), hash(true));
        assert_ne!(hash(true), hash(false));
    }

    #[test]
    fn test_expand_globs_sorted() {
        let dir = std::env::temp_dir().join("kiln_test_globs");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.png"), "b").unwrap();
        std::fs::write(dir.join("a.png"), "a").unwrap();
        std::fs::write(dir.join("c.txt"), "c").unwrap();

        let files = expand_globs(&["*.png".to_string()], &dir).unwrap();
        assert_eq!(files, vec![dir.join("a.png"), dir.join("b.png")]);

        assert!(matches!(
            expand_globs(&["*.fbx".to_string()], &dir),
            Err(HashError::NoFilesMatched(_))
        ));

        std::fs::remove_dir_all(&dir).ok();
    }
}
