use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::storage::{StorageError, StorageResult};

/// Scratch directory the store receiver writes into between batches.
///
/// Only workflows touch it; protocol components never clear or walk it.
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create the directory if it does not exist yet
    pub fn ensure(&self) -> StorageResult<()> {
        std::fs::create_dir_all(&self.root).map_err(StorageError::io(&self.root))
    }

    /// Remove everything below the root and recreate it empty
    pub fn clear(&self) -> StorageResult<()> {
        if self.root.parent().is_none() || self.root.as_os_str().is_empty() {
            return Err(StorageError::Path(format!(
                "refusing to clear '{}'",
                self.root.display()
            )));
        }

        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => info!("Cleared cache directory {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache directory {} did not exist", self.root.display())
            }
            Err(e) => return Err(StorageError::io(&self.root)(e)),
        }
        self.ensure()
    }

    /// Regular files anywhere below the root; zero when it does not exist
    pub fn count_files(&self) -> StorageResult<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                match e.into_io_error() {
                    Some(source) => StorageError::Io { path, source },
                    None => StorageError::Path(format!("filesystem loop at {}", path.display())),
                }
            })?;
            if entry.file_type().is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}
