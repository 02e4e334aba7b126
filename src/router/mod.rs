//! tus request router
//!
//! Maps a method and path onto a protocol operation. The upload collection
//! lives at the configured base path and each upload at `<base_path>/<id>`.

use crate::protocol::headers::X_HTTP_METHOD_OVERRIDE;
use hyper::{HeaderMap, Method, StatusCode};
use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
}

impl RouterError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouterError::NotFound(_) => StatusCode::NOT_FOUND,
            RouterError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

/// Routed tus operations
#[derive(Debug, Clone, PartialEq)]
pub enum TusRoute {
    /// POST <base_path>
    Create,
    /// OPTIONS <base_path> or OPTIONS <base_path>/<id>
    Options,
    /// HEAD <base_path>/<id>
    Head { id: String },
    /// PATCH <base_path>/<id>
    Patch { id: String },
    /// GET <base_path>/<id>
    Get { id: String },
    /// GET /health
    Health,
}

/// tus request parser
pub struct TusRequestParser;

impl TusRequestParser {
    /// Parse a request line into a route.
    ///
    /// A POST carrying `X-HTTP-Method-Override` is routed as the named method.
    pub fn parse(
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        base_path: &str,
    ) -> Result<TusRoute, RouterError> {
        let method = Self::effective_method(method, headers);

        if path == "/health" && method == Method::GET {
            return Ok(TusRoute::Health);
        }

        let rest = path
            .strip_prefix(base_path)
            .ok_or_else(|| RouterError::NotFound(path.to_string()))?;

        if rest.is_empty() || rest == "/" {
            return match method {
                Method::POST => Ok(TusRoute::Create),
                Method::OPTIONS => Ok(TusRoute::Options),
                other => Err(RouterError::MethodNotAllowed(format!(
                    "{} on the upload collection",
                    other
                ))),
            };
        }

        let segment = rest
            .strip_prefix('/')
            .filter(|s| !s.is_empty() && !s.contains('/'))
            .ok_or_else(|| RouterError::NotFound(path.to_string()))?;

        let id = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| RouterError::NotFound(path.to_string()))?
            .into_owned();

        match method {
            Method::HEAD => Ok(TusRoute::Head { id }),
            Method::PATCH => Ok(TusRoute::Patch { id }),
            Method::GET => Ok(TusRoute::Get { id }),
            Method::OPTIONS => Ok(TusRoute::Options),
            other => Err(RouterError::MethodNotAllowed(format!(
                "{} on an upload",
                other
            ))),
        }
    }

    fn effective_method(method: &Method, headers: &HeaderMap) -> Method {
        if method != Method::POST {
            return method.clone();
        }
        headers
            .get(X_HTTP_METHOD_OVERRIDE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Method::from_bytes(v.trim().to_ascii_uppercase().as_bytes()).ok())
            .unwrap_or(Method::POST)
    }
}
