use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::errors::{CutoutError, Result};
use crate::traits::BlobCache;

/// One file per key under a cache directory.
///
/// Blobs are written to a temporary file beside the target and persisted
/// without clobbering, so a reader sees either nothing or the complete blob.
#[derive(Debug, Clone)]
pub struct FsBlobCache {
    dir: PathBuf,
}

impl FsBlobCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('.')
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(CutoutError::Cache {
                path: self.dir.clone(),
                operation: format!("key validation ({key:?})"),
                source: std::io::Error::new(ErrorKind::InvalidInput, "invalid cache key"),
            });
        }
        Ok(self.dir.join(format!("{key}.onnx")))
    }
}

impl BlobCache for FsBlobCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CutoutError::Cache {
                path,
                operation: "read".to_string(),
                source: e,
            }),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir).map_err(|e| CutoutError::Cache {
            path: self.dir.clone(),
            operation: "create directory".to_string(),
            source: e,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| CutoutError::Cache {
            path: self.dir.clone(),
            operation: "create temporary file".to_string(),
            source: e,
        })?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CutoutError::Cache {
                path: tmp.path().to_path_buf(),
                operation: "write".to_string(),
                source: e,
            })?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                // empty leftovers read as a miss and may be replaced
                let empty = fs::metadata(&path).is_ok_and(|m| m.len() == 0);
                if !empty {
                    return Ok(());
                }
                e.file
                    .persist(&path)
                    .map(|_| ())
                    .map_err(|e| CutoutError::Cache {
                        path,
                        operation: "persist".to_string(),
                        source: e.error,
                    })
            }
            Err(e) => Err(CutoutError::Cache {
                path,
                operation: "persist".to_string(),
                source: e.error,
            }),
        }
    }
}

/// Process-local cache for hosts without a writable disk, and for tests.
#[derive(Debug, Default)]
pub struct InMemoryBlobCache {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobCache for InMemoryBlobCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .read()
            .get(key)
            .filter(|bytes| !bytes.is_empty())
            .cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .entry(key.to_string())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }
}

impl<C: BlobCache + ?Sized> BlobCache for std::sync::Arc<C> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        (**self).put(key, bytes)
    }
}
