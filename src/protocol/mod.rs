//! tus protocol handler
//!
//! Turns parsed requests into upload state transitions and responses. The
//! handler never touches the network: the server collects headers and the
//! request body, then calls one method per verb.
//!
//! | Verb    | Target         | Success                     |
//! |---------|----------------|-----------------------------|
//! | POST    | collection     | 201 + `Location`            |
//! | HEAD    | upload         | 200 + offset/length headers |
//! | PATCH   | upload         | 204 + new `Upload-Offset`   |
//! | OPTIONS | collection     | 200 + capabilities          |
//! | GET     | upload         | 200 + stored bytes          |
//!
//! Every response except a successful GET carries `Tus-Resumable` and
//! `Cache-Control: no-store`.

use crate::concat::{ConcatError, ConcatResolver, ConcatTag};
use crate::metadata::{self, Metadata};
use crate::metrics;
use crate::registry::{UploadLength, UploadRegistry};
use crate::storage::{ChunkWriter, StorageError, UploadStore};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub mod headers;

use headers::Decimal;

/// Protocol version spoken by this server
pub const TUS_RESUMABLE_VERSION: &str = "1.0.0";

/// Versions accepted in `Tus-Resumable`
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0"];

/// Extensions advertised through `Tus-Extension`
pub const EXTENSIONS: &[&str] = &["creation", "creation-defer-length", "concatenation"];

/// Required `Content-Type` of PATCH requests
pub const PATCH_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Response type produced by the handler
pub type TusResponse = Response<Full<Bytes>>;

/// Protocol errors, each mapped to one response status
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Offset conflict: request offset {client} does not match upload offset {server}")]
    OffsetConflict { client: u64, server: u64 },

    #[error("Chunk of {payload} bytes at offset {offset} exceeds upload length {length}")]
    LengthExceeded { offset: u64, payload: u64, length: u64 },

    #[error("Upload length exceeds the maximum of {max} bytes")]
    SizeExceeded { max: u64 },

    #[error("Unsupported tus version: {0}")]
    UnsupportedVersion(String),

    #[error("Final upload cannot be patched: {0}")]
    FinalNotPatchable(String),

    #[error("Upload already exists: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ProtocolError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::MalformedRequest(_) | ProtocolError::LengthExceeded { .. } => {
                StatusCode::BAD_REQUEST
            }
            ProtocolError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ProtocolError::NotFound(_) => StatusCode::NOT_FOUND,
            ProtocolError::OffsetConflict { .. } | ProtocolError::Conflict(_) => StatusCode::CONFLICT,
            ProtocolError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProtocolError::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            ProtocolError::FinalNotPatchable(_) => StatusCode::FORBIDDEN,
            ProtocolError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::MalformedRequest(_) => "malformed_request",
            ProtocolError::UnsupportedMediaType(_) => "unsupported_media_type",
            ProtocolError::NotFound(_) => "not_found",
            ProtocolError::OffsetConflict { .. } => "offset_conflict",
            ProtocolError::LengthExceeded { .. } => "length_exceeded",
            ProtocolError::SizeExceeded { .. } => "size_exceeded",
            ProtocolError::UnsupportedVersion(_) => "unsupported_version",
            ProtocolError::FinalNotPatchable(_) => "final_not_patchable",
            ProtocolError::Conflict(_) => "conflict",
            ProtocolError::Storage(_) => "storage",
        }
    }

    /// Render the error with the protocol headers and a plain text body
    pub fn into_response(self) -> TusResponse {
        let mut reply = Reply::protocol(self.status());
        if let ProtocolError::UnsupportedVersion(_) = self {
            reply = reply.header(headers::TUS_VERSION, supported_versions());
        }
        // Internal details stay in the logs
        let body = match self {
            ProtocolError::Storage(_) => "Internal storage error".to_string(),
            other => other.to_string(),
        };
        reply
            .header("content-type", HeaderValue::from_static("text/plain"))
            .body(Bytes::from(body))
            .into_response()
    }
}

impl From<ConcatError> for ProtocolError {
    fn from(error: ConcatError) -> Self {
        match error {
            ConcatError::Invalid(_) | ConcatError::UnknownPartial(_) | ConcatError::NotPartial(_) => {
                ProtocolError::MalformedRequest(error.to_string())
            }
            ConcatError::AlreadyExists(id) => ProtocolError::Conflict(id),
            ConcatError::Storage(e) => ProtocolError::Storage(e),
        }
    }
}

fn supported_versions() -> HeaderValue {
    HeaderValue::from_static("1.0.0")
}

/// Response under construction
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    /// Response carrying the protocol version and the no-store directive
    fn protocol(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(headers::TUS_RESUMABLE),
            HeaderValue::from_static(TUS_RESUMABLE_VERSION),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        Self {
            status,
            headers,
            body: Bytes::new(),
        }
    }

    /// Bare content response
    fn content(body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self {
            status: StatusCode::OK,
            headers,
            body,
        }
    }

    fn header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(HeaderName::from_static(name), value);
        self
    }

    fn text_header(self, name: &'static str, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => self.header(name, value),
            Err(_) => {
                tracing::warn!(header = name, "Skipping header with invalid value");
                self
            }
        }
    }

    fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    fn into_response(self) -> TusResponse {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

fn respond(result: Result<Reply, ProtocolError>) -> TusResponse {
    match result {
        Ok(reply) => reply.into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!(error = %e, "Request failed");
            } else {
                tracing::warn!(error = %e, status = e.status().as_u16(), "Request rejected");
            }
            metrics::record_error(e.kind());
            e.into_response()
        }
    }
}

/// Reject requests announcing a protocol version we do not speak.
/// A missing `Tus-Resumable` header is tolerated.
fn check_version(request_headers: &HeaderMap) -> Result<(), ProtocolError> {
    match headers::text(request_headers, headers::TUS_RESUMABLE)? {
        Some(version) if !SUPPORTED_VERSIONS.contains(&version) => {
            Err(ProtocolError::UnsupportedVersion(version.to_string()))
        }
        _ => Ok(()),
    }
}

/// Orchestrates the registry, chunk writer and concatenation per verb
pub struct ProtocolHandler {
    registry: Arc<UploadRegistry>,
    writer: ChunkWriter,
    concat: ConcatResolver,
    base_path: String,
    max_size: u64,
}

impl ProtocolHandler {
    pub fn new(
        registry: Arc<UploadRegistry>,
        store: Arc<dyn UploadStore>,
        base_path: impl Into<String>,
        max_size: u64,
    ) -> Self {
        Self {
            concat: ConcatResolver::new(Arc::clone(&registry), Arc::clone(&store)),
            writer: ChunkWriter::new(store),
            registry,
            base_path: base_path.into(),
            max_size,
        }
    }

    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.registry
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// URL path of an upload
    pub fn location(&self, id: &str) -> String {
        format!("{}/{}", self.base_path, id)
    }

    /// POST: create an upload resource
    #[tracing::instrument(name = "tus.create", skip_all)]
    pub async fn create(&self, request_headers: &HeaderMap) -> TusResponse {
        respond(self.try_create(request_headers).await)
    }

    /// HEAD: report the current offset of an upload
    #[tracing::instrument(name = "tus.head", skip(self, request_headers), fields(upload.id = %id))]
    pub async fn head(&self, id: &str, request_headers: &HeaderMap) -> TusResponse {
        respond(self.try_head(id, request_headers).await)
    }

    /// PATCH: append a chunk at the declared offset
    #[tracing::instrument(
        name = "tus.patch",
        skip(self, request_headers, body),
        fields(upload.id = %id, chunk.bytes = body.len())
    )]
    pub async fn patch(&self, id: &str, request_headers: &HeaderMap, body: Bytes) -> TusResponse {
        let result = self.try_patch(id, request_headers, body).await;
        if result.is_err() {
            metrics::record_chunk_failure();
        }
        respond(result)
    }

    /// OPTIONS: advertise version, size limit and extensions
    pub fn options(&self) -> TusResponse {
        Reply::protocol(StatusCode::OK)
            .header(headers::TUS_VERSION, supported_versions())
            .header(headers::TUS_MAX_SIZE, HeaderValue::from(self.max_size))
            .text_header(headers::TUS_EXTENSION, &EXTENSIONS.join(","))
            .into_response()
    }

    /// GET: return the stored bytes of an upload
    #[tracing::instrument(name = "tus.get", skip(self), fields(upload.id = %id))]
    pub async fn get(&self, id: &str) -> TusResponse {
        respond(self.try_get(id).await)
    }

    async fn try_create(&self, request_headers: &HeaderMap) -> Result<Reply, ProtocolError> {
        check_version(request_headers)?;

        let metadata = match headers::text(request_headers, headers::UPLOAD_METADATA)? {
            Some(value) => {
                let decoded = metadata::decode(value);
                if decoded.dropped > 0 {
                    tracing::debug!(dropped = decoded.dropped, "Ignored malformed metadata pairs");
                }
                decoded.metadata
            }
            None => Metadata::new(),
        };

        let concat = headers::text(request_headers, headers::UPLOAD_CONCAT)?
            .map(ConcatTag::parse)
            .transpose()?;

        if let Some(ConcatTag::Final(partial_ids)) = concat {
            let resource = self.concat.create_final(partial_ids, metadata).await?;
            metrics::record_upload_created("final");
            tracing::info!(upload.id = %resource.id, size = resource.offset, "Created final upload");
            return Ok(self.created(&resource.id));
        }

        let length = self.creation_length(request_headers)?;
        let kind = match (&concat, length) {
            (Some(ConcatTag::Partial), _) => "partial",
            (_, UploadLength::Deferred) => "deferred",
            _ => "sized",
        };

        let entry = self.registry.create(length, metadata, concat);
        if let Err(e) = self.writer.store().initialize(entry.id(), &[]).await {
            let mut state = entry.lock().await;
            self.registry.discard(entry.id(), &mut state);
            return Err(e.into());
        }

        metrics::record_upload_created(kind);
        tracing::info!(upload.id = %entry.id(), length = ?length.known(), kind, "Created upload");
        Ok(self.created(entry.id()))
    }

    fn created(&self, id: &str) -> Reply {
        Reply::protocol(StatusCode::CREATED).text_header("location", &self.location(id))
    }

    /// Exactly one of `Upload-Length` and `Upload-Defer-Length: 1` must be sent
    fn creation_length(&self, request_headers: &HeaderMap) -> Result<UploadLength, ProtocolError> {
        let length = headers::text(request_headers, headers::UPLOAD_LENGTH)?;
        let defer = headers::text(request_headers, headers::UPLOAD_DEFER_LENGTH)?;

        match (length, defer) {
            (Some(_), Some(_)) => Err(ProtocolError::MalformedRequest(
                "Upload-Length and Upload-Defer-Length are mutually exclusive".into(),
            )),
            (Some(value), None) => self.checked_length(value).map(UploadLength::Known),
            (None, Some("1")) => Ok(UploadLength::Deferred),
            (None, Some(other)) => Err(ProtocolError::MalformedRequest(format!(
                "Upload-Defer-Length must be 1, got '{}'",
                other
            ))),
            (None, None) => Err(ProtocolError::MalformedRequest(
                "Upload-Length or Upload-Defer-Length is required".into(),
            )),
        }
    }

    fn checked_length(&self, value: &str) -> Result<u64, ProtocolError> {
        match headers::decimal(headers::UPLOAD_LENGTH, value)? {
            Decimal::Value(length) if length <= self.max_size => Ok(length),
            _ => Err(ProtocolError::SizeExceeded { max: self.max_size }),
        }
    }

    async fn try_head(&self, id: &str, request_headers: &HeaderMap) -> Result<Reply, ProtocolError> {
        check_version(request_headers)?;

        let resource = match self.registry.get_by_id(id) {
            Some(entry) => entry.snapshot().await,
            None => None,
        }
        .ok_or_else(|| ProtocolError::NotFound(id.to_string()))?;

        let mut reply = Reply::protocol(StatusCode::OK)
            .header(headers::UPLOAD_OFFSET, HeaderValue::from(resource.offset));

        reply = match resource.length {
            Some(length) => reply.header(headers::UPLOAD_LENGTH, HeaderValue::from(length)),
            None => reply.header(headers::UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1")),
        };

        if let Some(encoded) = metadata::encode(&resource.metadata) {
            reply = reply.text_header(headers::UPLOAD_METADATA, &encoded);
        }

        if let Some(concat) = &resource.concat {
            reply = reply.text_header(headers::UPLOAD_CONCAT, &concat.to_header(&self.base_path));
        }

        Ok(reply)
    }

    async fn try_patch(
        &self,
        id: &str,
        request_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Reply, ProtocolError> {
        check_version(request_headers)?;

        let entry = self
            .registry
            .get_by_id(id)
            .ok_or_else(|| ProtocolError::NotFound(id.to_string()))?;

        let content_type = headers::text(request_headers, CONTENT_TYPE.as_str())?;
        if content_type != Some(PATCH_CONTENT_TYPE) {
            return Err(ProtocolError::UnsupportedMediaType(
                content_type.unwrap_or("none").to_string(),
            ));
        }

        if entry.is_final() {
            return Err(ProtocolError::FinalNotPatchable(id.to_string()));
        }

        let client_offset = headers::offset(request_headers, headers::UPLOAD_OFFSET)?
            .ok_or_else(|| ProtocolError::MalformedRequest("Upload-Offset is required".into()))?;

        let payload_len = body.len() as u64;
        let declared_len = headers::offset(request_headers, CONTENT_LENGTH.as_str())?;
        let requested_length = headers::text(request_headers, headers::UPLOAD_LENGTH)?;

        let started = Instant::now();
        let mut state = entry.lock().await;

        if state.is_discarded() {
            return Err(ProtocolError::NotFound(id.to_string()));
        }

        // Offset is checked before any other header on the request
        let current_offset = state.offset();
        if client_offset != current_offset {
            return Err(ProtocolError::OffsetConflict {
                client: client_offset,
                server: current_offset,
            });
        }

        if let Some(declared) = declared_len {
            if declared != payload_len {
                return Err(ProtocolError::MalformedRequest(format!(
                    "Content-Length {} does not match the {} bytes received",
                    declared, payload_len
                )));
            }
        }

        let new_length = requested_length
            .map(|value| self.checked_length(value))
            .transpose()?;

        // A deferred upload may fix its length with any PATCH
        let fixes_length = match (new_length, state.length()) {
            (None, _) => false,
            (Some(_), UploadLength::Deferred) => true,
            (Some(requested), UploadLength::Known(known)) if requested == known => false,
            (Some(_), UploadLength::Known(_)) => {
                return Err(ProtocolError::MalformedRequest(
                    "Upload-Length is already set for this upload".into(),
                ))
            }
        };
        let effective_length = new_length.or(state.length().known());

        // Without a length the server maximum is the only bound
        if effective_length.is_none() {
            let end = current_offset.checked_add(payload_len);
            if end.map_or(true, |end| end > self.max_size) {
                return Err(ProtocolError::SizeExceeded { max: self.max_size });
            }
        }

        let new_offset = self
            .writer
            .apply(id, current_offset, effective_length, &body)
            .await
            .map_err(|e| match e {
                StorageError::ExceedsLength {
                    offset,
                    payload,
                    length,
                } => ProtocolError::LengthExceeded {
                    offset,
                    payload,
                    length,
                },
                other => ProtocolError::Storage(other),
            })?;

        if let (true, Some(length)) = (fixes_length, new_length) {
            state
                .set_length(length)
                .map_err(|e| ProtocolError::MalformedRequest(e.to_string()))?;
        }
        state.set_offset(new_offset);

        metrics::record_chunk_success(payload_len, started.elapsed().as_secs_f64());
        if state.is_complete() {
            metrics::record_upload_completed();
            tracing::info!(upload.id = %id, size = new_offset, "Upload complete");
        } else {
            tracing::debug!(upload.id = %id, offset = new_offset, "Chunk applied");
        }

        Ok(Reply::protocol(StatusCode::NO_CONTENT).header(headers::UPLOAD_OFFSET, HeaderValue::from(new_offset)))
    }

    async fn try_get(&self, id: &str) -> Result<Reply, ProtocolError> {
        let entry = self
            .registry
            .get_by_id(id)
            .ok_or_else(|| ProtocolError::NotFound(id.to_string()))?;

        let state = entry.lock().await;
        if state.is_discarded() {
            return Err(ProtocolError::NotFound(id.to_string()));
        }

        let data = self.writer.store().read(id).await.map_err(|e| match e {
            StorageError::NotFound(_) => ProtocolError::NotFound(id.to_string()),
            other => ProtocolError::Storage(other),
        })?;
        drop(state);

        Ok(Reply::content(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStore;
    use tempfile::TempDir;

    async fn handler() -> (TempDir, ProtocolHandler) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let handler = ProtocolHandler::new(
            Arc::new(UploadRegistry::new()),
            Arc::new(store),
            "/files",
            1024,
        );
        (dir, handler)
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ProtocolError::MalformedRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProtocolError::UnsupportedMediaType("x".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(ProtocolError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProtocolError::OffsetConflict { client: 1, server: 0 }.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProtocolError::LengthExceeded { offset: 0, payload: 2, length: 1 }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProtocolError::SizeExceeded { max: 1 }.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_error_response_carries_protocol_headers() {
        let response = ProtocolError::NotFound("abc".into()).into_response();
        assert_eq!(response.headers()["tus-resumable"], "1.0.0");
        assert_eq!(response.headers()["cache-control"], "no-store");
    }

    #[test]
    fn test_unsupported_version_lists_supported_versions() {
        let response = ProtocolError::UnsupportedVersion("0.2.2".into()).into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(response.headers()["tus-version"], "1.0.0");
    }

    #[tokio::test]
    async fn test_create_rejects_unsupported_version() {
        let (_dir, handler) = handler().await;
        let response = handler
            .create(&headers(&[("upload-length", "10"), ("tus-resumable", "0.2.2")]))
            .await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_creation_length_rules() {
        let (_dir, handler) = handler().await;

        let both = headers(&[("upload-length", "10"), ("upload-defer-length", "1")]);
        assert!(handler.creation_length(&both).is_err());

        let too_big = headers(&[("upload-length", "1025")]);
        assert!(matches!(
            handler.creation_length(&too_big),
            Err(ProtocolError::SizeExceeded { max: 1024 })
        ));

        let at_max = headers(&[("upload-length", "1024")]);
        assert_eq!(handler.creation_length(&at_max).unwrap(), UploadLength::Known(1024));

        let overflow = headers(&[("upload-length", "184467440737095516160")]);
        assert!(matches!(
            handler.creation_length(&overflow),
            Err(ProtocolError::SizeExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_location_uses_base_path() {
        let (_dir, handler) = handler().await;
        assert_eq!(handler.location("abc"), "/files/abc");
    }
}
