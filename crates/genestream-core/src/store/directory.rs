//! Directory-backed item store.
//!
//! Each gene lives in `<root>/<key>.f32` as a packed little-endian `f32`
//! array with one element per cell.

use super::{ItemStore, LoadedVector, ReleaseOptions};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const FILE_EXTENSION: &str = "f32";

/// Item store reading packed `f32` files from a directory.
pub struct DirectoryStore {
    root: PathBuf,
    population_size: usize,
    /// Keys loaded and not yet released
    resident: Mutex<HashSet<String>>,
    /// Keys the application is displaying; kept on `preserve_active` release
    active: RwLock<HashSet<String>>,
}

impl DirectoryStore {
    /// Create a store with a known population size.
    pub fn new(root: impl Into<PathBuf>, population_size: usize) -> Self {
        Self {
            root: root.into(),
            population_size,
            resident: Mutex::new(HashSet::new()),
            active: RwLock::new(HashSet::new()),
        }
    }

    /// Open a store, inferring the population size from the first vector
    /// file when `population_size` is 0.
    pub async fn open(root: impl Into<PathBuf>, population_size: usize) -> crate::Result<Self> {
        let root = root.into();
        if population_size > 0 {
            return Ok(Self::new(root, population_size));
        }

        let keys = list_keys(&root).await?;
        let first = keys.first().ok_or_else(|| {
            crate::Error::Config(format!("No .{} files in {}", FILE_EXTENSION, root.display()))
        })?;
        let path = root.join(format!("{}.{}", first, FILE_EXTENSION));
        let len = tokio::fs::metadata(&path).await?.len() as usize;
        let population_size = len / std::mem::size_of::<f32>();

        debug!(
            root = %root.display(),
            population_size,
            inferred_from = %first,
            "Inferred population size"
        );

        Ok(Self::new(root, population_size))
    }

    /// Gene keys available in the directory, sorted.
    pub async fn keys(&self) -> crate::Result<Vec<String>> {
        list_keys(&self.root).await
    }

    /// Mark a key as active (or not) for `preserve_active` releases.
    pub fn set_active(&self, key: &str, active: bool) {
        let mut set = self.active.write();
        if active {
            set.insert(key.to_string());
        } else {
            set.remove(key);
        }
    }

    /// Number of loaded, unreleased keys.
    pub fn resident_count(&self) -> usize {
        self.resident.lock().len()
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
            || key.contains('\0')
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{}.{}", key, FILE_EXTENSION)))
    }
}

/// Encode a vector in the on-disk format.
pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(key: &str, bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % std::mem::size_of::<f32>() != 0 {
        return Err(StoreError::Decode {
            key: key.to_string(),
            message: format!("{} bytes is not a whole number of f32 values", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

async fn list_keys(root: &Path) -> crate::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut keys = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            keys.push(stem.to_string());
        }
    }
    keys.sort();
    Ok(keys)
}

#[async_trait]
impl ItemStore for DirectoryStore {
    fn population_size(&self) -> usize {
        self.population_size
    }

    async fn load(&self, key: &str) -> Result<LoadedVector, StoreError> {
        let path = self.path_for(key)?;
        let bytes = tokio::fs::read(&path).await?;
        let values = decode_vector(key, &bytes)?;

        if values.len() != self.population_size {
            return Err(StoreError::Decode {
                key: key.to_string(),
                message: format!(
                    "expected {} values, found {}",
                    self.population_size,
                    values.len()
                ),
            });
        }

        self.resident.lock().insert(key.to_string());
        trace!(key = %key, bytes = bytes.len(), "Loaded vector from disk");

        Ok(LoadedVector::new(values).with_byte_size(bytes.len()))
    }

    fn release(&self, key: &str, options: ReleaseOptions) -> bool {
        if options.preserve_active && self.active.read().contains(key) {
            trace!(key = %key, "Release skipped for active key");
            return false;
        }
        self.resident.lock().remove(key)
    }
}
