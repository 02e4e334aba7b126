//! Upload concatenation
//!
//! Parses the `Upload-Concat` header and builds `final` uploads out of
//! previously created `partial` uploads.
//!
//! Accepted header values:
//!
//! * `partial` - the new upload is a partial upload
//! * `final;<url> <url> ...` - the new upload is the ordered concatenation
//!   of the partial uploads at the listed URLs. Only the last path segment
//!   of each URL is used, so relative and absolute URLs both work.

use crate::metadata::Metadata;
use crate::metrics;
use crate::registry::{RegistryError, UploadEntry, UploadLength, UploadRegistry, UploadResource};
use crate::storage::{StorageError, UploadStore};
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use thiserror::Error;

/// Concatenation errors
#[derive(Error, Debug)]
pub enum ConcatError {
    #[error("Invalid Upload-Concat value: {0}")]
    Invalid(String),

    #[error("Unknown partial upload: {0}")]
    UnknownPartial(String),

    #[error("Upload is not a partial upload: {0}")]
    NotPartial(String),

    #[error("Final upload already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Concatenation role of an upload, fixed at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcatTag {
    Partial,
    /// Ids of the partial uploads, in concatenation order
    Final(Vec<String>),
}

impl ConcatTag {
    /// Parse an `Upload-Concat` header value
    pub fn parse(value: &str) -> Result<Self, ConcatError> {
        let value = value.trim();

        if value == "partial" {
            return Ok(ConcatTag::Partial);
        }

        let urls = value
            .strip_prefix("final;")
            .ok_or_else(|| ConcatError::Invalid(value.to_string()))?;

        let ids = urls
            .split_whitespace()
            .map(|url| {
                id_from_url(url).ok_or_else(|| ConcatError::Invalid(format!("bad upload url {}", url)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if ids.is_empty() {
            return Err(ConcatError::Invalid(format!("{}: no partial uploads listed", value)));
        }

        Ok(ConcatTag::Final(ids))
    }

    /// Render the tag for the `Upload-Concat` response header
    pub fn to_header(&self, base_path: &str) -> String {
        match self {
            ConcatTag::Partial => "partial".to_string(),
            ConcatTag::Final(ids) => {
                let urls: Vec<String> = ids.iter().map(|id| format!("{}/{}", base_path, id)).collect();
                format!("final;{}", urls.join(" "))
            }
        }
    }
}

/// Extract the upload id from the last path segment of a URL
fn id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }

    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    Some(decoded.into_owned())
}

/// Resolves and merges partial uploads into final uploads
#[derive(Clone)]
pub struct ConcatResolver {
    registry: Arc<UploadRegistry>,
    store: Arc<dyn UploadStore>,
}

impl ConcatResolver {
    pub fn new(registry: Arc<UploadRegistry>, store: Arc<dyn UploadStore>) -> Self {
        Self { registry, store }
    }

    /// Look up every listed id; all must exist and be partial uploads
    pub fn resolve(&self, partial_ids: &[String]) -> Result<Vec<Arc<UploadEntry>>, ConcatError> {
        partial_ids
            .iter()
            .map(|id| {
                let entry = self
                    .registry
                    .get_by_id(id)
                    .ok_or_else(|| ConcatError::UnknownPartial(id.clone()))?;
                if !entry.is_partial() {
                    return Err(ConcatError::NotPartial(id.clone()));
                }
                Ok(entry)
            })
            .collect()
    }

    /// Create a final upload from the listed partial uploads.
    ///
    /// The final upload gets a fresh id like any other upload; the partial
    /// ids it was built from live in its `ConcatTag::Final`, never in its
    /// storage name. Nothing is registered or written unless every partial
    /// resolves. The
    /// final upload is locked before it is registered and stays locked
    /// until the merge finished; a failed merge removes it again, so no
    /// request ever sees a half built final upload.
    #[tracing::instrument(
        name = "concat.create_final",
        skip(self, metadata),
        fields(upload.id = tracing::field::Empty, concat.parts = partial_ids.len()),
        err
    )]
    pub async fn create_final(
        &self,
        partial_ids: Vec<String>,
        metadata: Metadata,
    ) -> Result<UploadResource, ConcatError> {
        let partials = self.resolve(&partial_ids)?;

        let id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("upload.id", id.as_str());

        let entry = Arc::new(UploadEntry::new(
            id.clone(),
            UploadLength::Deferred,
            metadata,
            Some(ConcatTag::Final(partial_ids.clone())),
        ));
        let mut state = entry.lock().await;

        self.registry
            .insert(Arc::clone(&entry))
            .map_err(|e| match e {
                RegistryError::AlreadyExists(id) => ConcatError::AlreadyExists(id),
                other => ConcatError::Invalid(other.to_string()),
            })?;

        match self.merge(&id, &partials, &partial_ids).await {
            Ok(size) => {
                state.set_offset(size);
                state
                    .set_length(size)
                    .map_err(|e| ConcatError::Invalid(e.to_string()))?;
                metrics::record_concat_merge(true);

                tracing::info!(size, "Final upload assembled");
                Ok(entry.resource_from(&state))
            }
            Err(e) => {
                self.registry.discard(&id, &mut state);
                if let Err(cleanup) = self.store.remove(&id).await {
                    tracing::warn!(error = %cleanup, "Failed to remove final upload after merge error");
                }
                metrics::record_concat_merge(false);
                Err(e)
            }
        }
    }

    /// Concatenate the partials' bytes while holding their locks.
    ///
    /// Locks are taken in id order, once per distinct upload, so two merges
    /// naming the same partials in different orders cannot deadlock.
    async fn merge(
        &self,
        target: &str,
        partials: &[Arc<UploadEntry>],
        partial_ids: &[String],
    ) -> Result<u64, ConcatError> {
        let mut lock_order: Vec<&Arc<UploadEntry>> = partials.iter().collect();
        lock_order.sort_by(|a, b| a.id().cmp(b.id()));
        lock_order.dedup_by(|a, b| a.id() == b.id());

        let mut guards = Vec::with_capacity(lock_order.len());
        for entry in &lock_order {
            let guard = entry.lock().await;
            if guard.is_discarded() {
                return Err(ConcatError::UnknownPartial(entry.id().to_string()));
            }
            guards.push(guard);
        }

        let size = self.store.concatenate(target, partial_ids).await?;
        drop(guards);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial() {
        assert_eq!(ConcatTag::parse("partial").unwrap(), ConcatTag::Partial);
    }

    #[test]
    fn test_parse_final_relative_urls() {
        let tag = ConcatTag::parse("final;/files/a /files/b").unwrap();
        assert_eq!(tag, ConcatTag::Final(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_parse_final_absolute_urls() {
        let tag =
            ConcatTag::parse("final;http://tus.example.org/files/a1 https://tus.example.org/files/b2/")
                .unwrap();
        assert_eq!(tag, ConcatTag::Final(vec!["a1".into(), "b2".into()]));
    }

    #[test]
    fn test_parse_final_decodes_segments() {
        let tag = ConcatTag::parse("final;/files/a%2Bb").unwrap();
        assert_eq!(tag, ConcatTag::Final(vec!["a+b".into()]));
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        for value in ["final", "final;", "final;   ", "unknown", "Partial", "final;/"] {
            assert!(
                matches!(ConcatTag::parse(value), Err(ConcatError::Invalid(_))),
                "{} should be rejected",
                value
            );
        }
    }

    #[test]
    fn test_to_header() {
        assert_eq!(ConcatTag::Partial.to_header("/files"), "partial");
        assert_eq!(
            ConcatTag::Final(vec!["a".into(), "b".into()]).to_header("/files"),
            "final;/files/a /files/b"
        );
    }
}
