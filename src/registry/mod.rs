//! Upload registry
//!
//! In-memory store of upload resources keyed by id. Each record carries its
//! own async mutex: the offset and length of one upload are only ever read
//! for a decision and then mutated while that lock is held, which makes a
//! single upload the unit of mutual exclusion. Lookups and creation go
//! through a sharded concurrent map and never wait on an upload lock.
//!
//! Records are never deleted by clients. They are only taken back out when
//! their creation fails half way: the backing file could not be created,
//! or a concatenation merge failed.

use crate::concat::ConcatTag;
use crate::metadata::Metadata;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload already exists: {0}")]
    AlreadyExists(String),

    #[error("Upload length is already set")]
    LengthAlreadySet,

    #[error("Upload length {length} is below the current offset {offset}")]
    LengthBelowOffset { offset: u64, length: u64 },
}

/// Total size of an upload: either known, or deferred until a later request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLength {
    Known(u64),
    Deferred,
}

impl UploadLength {
    pub fn known(&self) -> Option<u64> {
        match self {
            UploadLength::Known(length) => Some(*length),
            UploadLength::Deferred => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, UploadLength::Deferred)
    }
}

/// Mutable part of an upload record, guarded by the record's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadState {
    offset: u64,
    length: UploadLength,
    discarded: bool,
}

impl UploadState {
    fn new(length: UploadLength) -> Self {
        Self {
            offset: 0,
            length,
            discarded: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> UploadLength {
        self.length
    }

    /// True once a rolled back record has been taken out of the registry
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn is_complete(&self) -> bool {
        self.length.known() == Some(self.offset)
    }

    /// Record the stored size after a successful write.
    ///
    /// Offsets never move backwards except through the offset 0 initialize
    /// path, which truncates the backing file.
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Fix a deferred length
    pub fn set_length(&mut self, length: u64) -> Result<(), RegistryError> {
        if !self.length.is_deferred() {
            return Err(RegistryError::LengthAlreadySet);
        }
        if length < self.offset {
            return Err(RegistryError::LengthBelowOffset {
                offset: self.offset,
                length,
            });
        }
        self.length = UploadLength::Known(length);
        Ok(())
    }

    pub(crate) fn discard(&mut self) {
        self.discarded = true;
    }
}

/// Snapshot of an upload resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResource {
    pub id: String,
    pub offset: u64,
    /// `None` while the length is deferred
    pub length: Option<u64>,
    pub metadata: Metadata,
    pub concat: Option<ConcatTag>,
}

impl UploadResource {
    pub fn defer_length(&self) -> bool {
        self.length.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.length == Some(self.offset)
    }
}

/// One registered upload
#[derive(Debug)]
pub struct UploadEntry {
    id: String,
    metadata: Metadata,
    concat: Option<ConcatTag>,
    state: Mutex<UploadState>,
}

impl UploadEntry {
    pub fn new(
        id: impl Into<String>,
        length: UploadLength,
        metadata: Metadata,
        concat: Option<ConcatTag>,
    ) -> Self {
        Self {
            id: id.into(),
            metadata,
            concat,
            state: Mutex::new(UploadState::new(length)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn concat(&self) -> Option<&ConcatTag> {
        self.concat.as_ref()
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.concat, Some(ConcatTag::Partial))
    }

    pub fn is_final(&self) -> bool {
        matches!(self.concat, Some(ConcatTag::Final(_)))
    }

    /// Acquire the exclusive lock on this upload's offset and length
    pub async fn lock(&self) -> MutexGuard<'_, UploadState> {
        self.state.lock().await
    }

    /// Current state of the upload, `None` if it has been discarded
    pub async fn snapshot(&self) -> Option<UploadResource> {
        let state = self.state.lock().await;
        if state.discarded {
            return None;
        }
        Some(self.resource_from(&state))
    }

    /// Build a snapshot from a state the caller already holds
    pub fn resource_from(&self, state: &UploadState) -> UploadResource {
        UploadResource {
            id: self.id.clone(),
            offset: state.offset,
            length: state.length.known(),
            metadata: self.metadata.clone(),
            concat: self.concat.clone(),
        }
    }
}

/// Registry of upload resources
#[derive(Debug, Default)]
pub struct UploadRegistry {
    uploads: DashMap<String, Arc<UploadEntry>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new upload under a freshly generated id with offset 0
    pub fn create(
        &self,
        length: UploadLength,
        metadata: Metadata,
        concat: Option<ConcatTag>,
    ) -> Arc<UploadEntry> {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(UploadEntry::new(id.clone(), length, metadata, concat));
        self.uploads.insert(id, Arc::clone(&entry));

        tracing::debug!(upload.id = %entry.id, "Registered upload");
        entry
    }

    /// Register an upload whose id was derived by the caller.
    ///
    /// The caller may already hold the entry's lock, so the record becomes
    /// visible only to requests that will wait for it to be released.
    pub fn insert(&self, entry: Arc<UploadEntry>) -> Result<(), RegistryError> {
        match self.uploads.entry(entry.id.clone()) {
            Entry::Occupied(occupied) => Err(RegistryError::AlreadyExists(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<UploadEntry>> {
        self.uploads.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Fix the length of a deferred upload
    pub async fn set_length(&self, id: &str, length: u64) -> Result<(), RegistryError> {
        let entry = self
            .get_by_id(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut state = entry.lock().await;
        if state.discarded {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        state.set_length(length)
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// Take a record back out after its creation failed half way.
    ///
    /// The caller must hold the record's lock and pass its state so holders
    /// of a stale handle observe the record as gone.
    pub(crate) fn discard(&self, id: &str, state: &mut UploadState) {
        state.discard();
        self.uploads.remove(id);
        tracing::debug!(upload.id = %id, "Discarded upload");
    }
}
