//! Upload storage
//!
//! Backing byte stores for upload resources and the chunk writer that
//! applies PATCH payloads to them.
//!
//! A chunk at offset 0 *initializes* the backing store (create or
//! truncate), any other chunk *appends*. Writes are never random access:
//! re-sending offset 0 after data was stored discards that data.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub mod file_store;

pub use file_store::FileStore;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backing file not found for upload {0}")]
    NotFound(String),

    #[error("Invalid upload id for storage: {0}")]
    InvalidId(String),

    #[error("Chunk of {payload} bytes at offset {offset} exceeds upload length {length}")]
    ExceedsLength { offset: u64, payload: u64, length: u64 },
}

/// Byte store holding one object per upload id
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Create or truncate the object and write `data`; returns the stored size
    async fn initialize(&self, id: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Append `data` to the object; returns the stored size
    async fn append(&self, id: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Read the full object
    async fn read(&self, id: &str) -> Result<Bytes, StorageError>;

    /// Write the ordered concatenation of `sources` as `target`.
    ///
    /// Either the complete target becomes visible or nothing does.
    async fn concatenate(&self, target: &str, sources: &[String]) -> Result<u64, StorageError>;

    /// Remove the object, succeeding if it does not exist
    async fn remove(&self, id: &str) -> Result<(), StorageError>;
}

/// How a chunk is applied to the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate, then write
    Initialize,
    /// Append after the existing bytes
    Append,
}

impl WriteMode {
    pub fn for_offset(offset: u64) -> Self {
        if offset == 0 {
            WriteMode::Initialize
        } else {
            WriteMode::Append
        }
    }
}

/// Applies PATCH payloads to an upload store.
///
/// Offset validation is the caller's job: `apply` must only be invoked once
/// the client offset has been checked against `current_offset` under the
/// upload's lock.
#[derive(Clone)]
pub struct ChunkWriter {
    store: Arc<dyn UploadStore>,
}

impl ChunkWriter {
    pub fn new(store: Arc<dyn UploadStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.store
    }

    /// Write `payload` at `current_offset` and return the new offset.
    ///
    /// The new offset is the size of the backing store after the write, not
    /// an in-memory sum. When `upload_length` is known and the payload would
    /// run past it, nothing is written.
    #[tracing::instrument(
        name = "storage.chunk.apply",
        skip(self, payload),
        fields(upload.id = %id, upload.offset = current_offset, chunk.bytes = payload.len()),
        err
    )]
    pub async fn apply(
        &self,
        id: &str,
        current_offset: u64,
        upload_length: Option<u64>,
        payload: &[u8],
    ) -> Result<u64, StorageError> {
        let payload_len = payload.len() as u64;

        if let Some(length) = upload_length {
            let end = current_offset.checked_add(payload_len);
            if end.map_or(true, |end| end > length) {
                return Err(StorageError::ExceedsLength {
                    offset: current_offset,
                    payload: payload_len,
                    length,
                });
            }
        }

        let new_offset = match WriteMode::for_offset(current_offset) {
            WriteMode::Initialize => self.store.initialize(id, payload).await?,
            WriteMode::Append => self.store.append(id, payload).await?,
        };

        tracing::debug!(new_offset, "Chunk written");
        Ok(new_offset)
    }
}
