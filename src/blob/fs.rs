use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::{BlobRead, BlobStore};
use crate::error::{BundleError, Result};

/// Blob store rooted in a directory tree, fanned out over two levels of
/// subdirectories derived from a checksum of the blob id. The fan-out is
/// part of the on-disk contract and must not change once data exists.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "filesystem blob store opened");
        Ok(Self { root })
    }

    fn path_for(&self, blob_id: &str) -> PathBuf {
        let hash = crc32fast::hash(blob_id.as_bytes());
        let hex = format!("{hash:08x}");
        let escaped: String = blob_id
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                c => c,
            })
            .collect();
        self.root.join(&hex[..2]).join(&hex[2..4]).join(escaped)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, blob_id: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(blob_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(())
    }

    fn get(&self, blob_id: &str) -> Result<BlobRead> {
        let path = self.path_for(blob_id);
        match fs::File::open(&path) {
            Ok(file) => Ok(BlobRead::File(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BundleError::Blob(format!("no such blob: {blob_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, blob_id: &str) -> Result<bool> {
        let path = self.path_for(blob_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                // prune emptied fan-out directories, best effort
                if let Some(parent) = path.parent() {
                    if fs::remove_dir(parent).is_ok() {
                        if let Some(grandparent) = parent.parent() {
                            let _ = fs::remove_dir(grandparent);
                        }
                    }
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
