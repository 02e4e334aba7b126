//! tus header names and value parsing

use super::ProtocolError;
use hyper::HeaderMap;

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION: &str = "tus-version";
pub const TUS_MAX_SIZE: &str = "tus-max-size";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_CONCAT: &str = "upload-concat";
pub const X_HTTP_METHOD_OVERRIDE: &str = "x-http-method-override";

/// Read a header as text; absent is `None`, non-visible-ASCII is malformed
pub fn text<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ProtocolError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()))
            .map_err(|_| ProtocolError::MalformedRequest(format!("{} is not valid text", name))),
    }
}

/// Outcome of parsing a non-negative decimal header value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decimal {
    Value(u64),
    /// Only digits, but too large for `u64`
    Overflow,
}

/// Parse a non-negative decimal made of ASCII digits only (no sign, no spaces)
pub fn decimal(name: &str, value: &str) -> Result<Decimal, ProtocolError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedRequest(format!(
            "{} must be a non-negative decimal, got '{}'",
            name, value
        )));
    }
    Ok(value.parse().map(Decimal::Value).unwrap_or(Decimal::Overflow))
}

/// Parse an optional decimal header where overflow is simply malformed
pub fn offset(headers: &HeaderMap, name: &str) -> Result<Option<u64>, ProtocolError> {
    let Some(value) = text(headers, name)? else {
        return Ok(None);
    };
    match decimal(name, value)? {
        Decimal::Value(v) => Ok(Some(v)),
        Decimal::Overflow => Err(ProtocolError::MalformedRequest(format!(
            "{} is out of range",
            name
        ))),
    }
}
