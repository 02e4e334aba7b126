//! Filesystem upload store
//!
//! One file per upload, named after the upload id, inside a single root
//! directory. Concatenations are staged in a temporary file next to the
//! target and renamed into place once complete.

use super::{StorageError, UploadStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Upload store backed by a local directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::info!(root = %root.display(), "Opened upload store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the backing file for `id`
    pub fn path_for(&self, id: &str) -> Result<PathBuf, StorageError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && !id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StorageError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    async fn write_with(
        &self,
        id: &str,
        options: &OpenOptions,
        data: &[u8],
    ) -> Result<u64, StorageError> {
        let path = self.path_for(id)?;
        let mut file = options.open(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(fs::metadata(&path).await?.len())
    }

    async fn copy_into(&self, staging: &mut File, sources: &[String]) -> Result<(), StorageError> {
        for source in sources {
            let path = self.path_for(source)?;
            let mut input = File::open(&path).await.map_err(|e| not_found_as(e, source))?;
            tokio::io::copy(&mut input, staging).await?;
        }
        staging.flush().await?;
        staging.sync_data().await?;
        Ok(())
    }
}

fn not_found_as(error: io::Error, id: &str) -> StorageError {
    if error.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(id.to_string())
    } else {
        StorageError::Io(error)
    }
}

#[async_trait]
impl UploadStore for FileStore {
    async fn initialize(&self, id: &str, data: &[u8]) -> Result<u64, StorageError> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        self.write_with(id, &options, data).await
    }

    async fn append(&self, id: &str, data: &[u8]) -> Result<u64, StorageError> {
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        self.write_with(id, &options, data).await
    }

    async fn read(&self, id: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(id)?;
        let data = fs::read(&path).await.map_err(|e| not_found_as(e, id))?;
        Ok(Bytes::from(data))
    }

    async fn concatenate(&self, target: &str, sources: &[String]) -> Result<u64, StorageError> {
        let target_path = self.path_for(target)?;
        let staging_path = self
            .root
            .join(format!(".{}.merge-{}", target, uuid::Uuid::new_v4()));

        let mut staging = File::create(&staging_path).await?;
        if let Err(e) = self.copy_into(&mut staging, sources).await {
            drop(staging);
            if let Err(cleanup) = fs::remove_file(&staging_path).await {
                tracing::warn!(
                    path = %staging_path.display(),
                    error = %cleanup,
                    "Failed to clean up staging file"
                );
            }
            return Err(e);
        }
        drop(staging);

        fs::rename(&staging_path, &target_path).await?;
        Ok(fs::metadata(&target_path).await?.len())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
