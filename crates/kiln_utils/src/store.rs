//! Content-addressed object database plus the url -> id index map.

use crate::hash_bytes;
use kiln_core::ObjectId;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

const OBJECTS_DIR: &str = "objects";
const INDEX_FILE: &str = "index.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access object database: {0}")]
    IoError(#[from] io::Error),
    #[error("Object {0} does not exist")]
    MissingObject(ObjectId),
    #[error("Failed to parse index map '{0}': {1}")]
    IndexError(String, serde_json::Error),
}

/**
 * Blob store keyed by [`ObjectId`] with a secondary index from content url
 * paths to ids.
 *
 * Implementations must make a blob fully readable before `write` returns,
 * so an index entry published afterwards never points at a partial blob.
 */
pub trait ObjectDatabase: Send + Sync {
    fn exists(&self, id: &ObjectId) -> bool;

    fn read(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError>;

    /// Store `data` under `id`. An existing object is kept unless `overwrite` is set.
    fn write(&self, id: &ObjectId, data: &[u8], overwrite: bool) -> Result<(), StoreError>;

    fn delete(&self, id: &ObjectId) -> Result<(), StoreError>;

    /// Every object currently stored
    fn objects(&self) -> Result<Vec<ObjectId>, StoreError>;

    fn index_get(&self, path: &str) -> Option<ObjectId>;

    fn index_set(&self, path: &str, id: ObjectId) -> Result<(), StoreError>;

    fn index_remove(&self, path: &str) -> Result<(), StoreError>;

    fn index_entries(&self) -> BTreeMap<String, ObjectId>;
}

/**
 * Write a blob under its own content hash and return that hash.
 */
pub fn write_content(db: &dyn ObjectDatabase, data: &[u8]) -> Result<ObjectId, StoreError> {
    let id = hash_bytes(data);
    db.write(&id, data, false)?;
    Ok(id)
}

/**
 * Object database kept on disk: loose objects fanned out by their first
 * byte, the index map as a JSON file next to them.
 */
#[derive(Debug)]
pub struct FileObjectDatabase {
    root: PathBuf,
    index: RwLock<BTreeMap<String, ObjectId>>,
    // Serializes index file rewrites
    index_file: Mutex<()>,
}

impl FileObjectDatabase {
    /**
     * Open (or create) the database rooted at `root`
     */
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join(OBJECTS_DIR))?;

        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let content = fs::read_to_string(&index_path)?;
            // A damaged index only costs rebuilds
            serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %index_path.display(), error = %e, "discarding unreadable index map");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            root: root.to_path_buf(),
            index: RwLock::new(index),
            index_file: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(&hex[2..])
    }

    fn flush_index(&self) -> Result<(), StoreError> {
        let _guard = self.index_file.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.root.join(INDEX_FILE);
        let tmp_path = self.root.join(format!("{INDEX_FILE}.tmp"));

        let content = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*index)
                .map_err(|e| StoreError::IndexError(path.display().to_string(), e))?
        };
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl ObjectDatabase for FileObjectDatabase {
    fn exists(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    fn read(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.object_path(id)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::MissingObject(*id)),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &ObjectId, data: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let path = self.object_path(id);
        if !overwrite && path.is_file() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Unique temp name so concurrent writers of the same id never share a file
        let tmp_path = path.with_extension(format!(
            "{:?}.tmp",
            std::thread::current().id()
        ));
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &path)?;
        debug!(object = %id, size = data.len(), "wrote object");
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<(), StoreError> {
        match fs::remove_file(self.object_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn objects(&self) -> Result<Vec<ObjectId>, StoreError> {
        let objects_dir = self.root.join(OBJECTS_DIR);
        let mut ids = Vec::new();
        if !objects_dir.exists() {
            return Ok(ids);
        }

        for fan in fs::read_dir(&objects_dir)? {
            let fan = fan?;
            if !fan.file_type()?.is_dir() {
                continue;
            }
            let prefix = fan.file_name().to_string_lossy().to_string();
            for entry in fs::read_dir(fan.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if let Ok(id) = format!("{prefix}{name}").parse::<ObjectId>() {
                    ids.push(id);
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    fn index_get(&self, path: &str) -> Option<ObjectId> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
    }

    fn index_set(&self, path: &str, id: ObjectId) -> Result<(), StoreError> {
        let previous = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), id);
        if previous == Some(id) {
            return Ok(());
        }
        self.flush_index()
    }

    fn index_remove(&self, path: &str) -> Result<(), StoreError> {
        let removed = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        if removed.is_some() {
            self.flush_index()?;
        }
        Ok(())
    }

    fn index_entries(&self) -> BTreeMap<String, ObjectId> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/**
 * Object database held in memory; used by tests and throwaway builds
 */
#[derive(Debug, Default)]
pub struct MemoryObjectDatabase {
    objects: RwLock<HashMap<ObjectId, Vec<u8>>>,
    index: RwLock<BTreeMap<String, ObjectId>>,
}

impl MemoryObjectDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectDatabase for MemoryObjectDatabase {
    fn exists(&self, id: &ObjectId) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn read(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(StoreError::MissingObject(*id))
    }

    fn write(&self, id: &ObjectId, data: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if overwrite || !objects.contains_key(id) {
            objects.insert(*id, data.to_vec());
        }
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<(), StoreError> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    fn objects(&self) -> Result<Vec<ObjectId>, StoreError> {
        let mut ids: Vec<ObjectId> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn index_get(&self, path: &str) -> Option<ObjectId> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
    }

    fn index_set(&self, path: &str, id: ObjectId) -> Result<(), StoreError> {
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), id);
        Ok(())
    }

    fn index_remove(&self, path: &str) -> Result<(), StoreError> {
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        Ok(())
    }

    fn index_entries(&self) -> BTreeMap<String, ObjectId> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
