//! Upload-Metadata codec
//!
//! The `Upload-Metadata` header carries comma separated `key base64(value)`
//! pairs. Decoding is tolerant: a malformed pair is dropped and counted,
//! it never aborts the decode of the remaining pairs.
//!
//! # Example
//!
//! ```
//! use tus_server::metadata::{self, Metadata};
//!
//! let mut meta = Metadata::new();
//! meta.insert("filename", "world_domination_plan.pdf");
//!
//! let header = metadata::encode(&meta).unwrap();
//! assert_eq!(header, "filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==");
//!
//! let decoded = metadata::decode(&header);
//! assert_eq!(decoded.metadata, meta);
//! assert_eq!(decoded.dropped, 0);
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Ordered key/value metadata attached to an upload at creation.
///
/// Keys are unique. Re-inserting an existing key replaces its value but
/// keeps the original position, so wire output follows first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair, returning the previous value for `key` if any
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();

        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// Result of decoding an `Upload-Metadata` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMetadata {
    pub metadata: Metadata,
    /// Number of pairs skipped because they were malformed
    pub dropped: usize,
}

/// Encode metadata for the `Upload-Metadata` header.
///
/// Returns `None` for empty metadata: the header must then be omitted.
pub fn encode(metadata: &Metadata) -> Option<String> {
    if metadata.is_empty() {
        return None;
    }

    let pairs: Vec<String> = metadata
        .iter()
        .map(|(key, value)| format!("{} {}", key, STANDARD.encode(value)))
        .collect();

    Some(pairs.join(","))
}

/// Decode an `Upload-Metadata` header value.
///
/// A pair is dropped when it does not split on its first space into two
/// non-empty tokens, or when its value is not valid base64 encoded UTF-8.
/// The last occurrence of a repeated key wins.
pub fn decode(header: &str) -> DecodedMetadata {
    let mut decoded = DecodedMetadata::default();

    for entry in header.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        match decode_pair(entry) {
            Some((key, value)) => {
                decoded.metadata.insert(key, value);
            }
            None => {
                tracing::debug!(entry = %entry, "Dropping malformed metadata pair");
                decoded.dropped += 1;
            }
        }
    }

    decoded
}

fn decode_pair(entry: &str) -> Option<(&str, String)> {
    let (key, encoded) = entry.split_once(' ')?;
    if key.is_empty() || encoded.is_empty() {
        return None;
    }

    let bytes = STANDARD.decode(encoded).ok()?;
    let value = String::from_utf8(bytes).ok()?;
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_preserves_insertion_order() {
        let meta: Metadata = [("b", "2"), ("a", "1")].into_iter().collect();
        assert_eq!(encode(&meta).unwrap(), "b Mg==,a MQ==");
    }

    #[test]
    fn test_encode_empty_is_absent() {
        assert!(encode(&Metadata::new()).is_none());
    }

    #[test]
    fn test_decode_drops_malformed_pairs() {
        let decoded = decode("filename dGVzdC50eHQ=,novalue,bad !!!notbase64,type dGV4dA==");

        assert_eq!(decoded.metadata.len(), 2);
        assert_eq!(decoded.metadata.get("filename"), Some("test.txt"));
        assert_eq!(decoded.metadata.get("type"), Some("text"));
        assert_eq!(decoded.dropped, 2);
    }

    #[test]
    fn test_decode_last_duplicate_wins() {
        let decoded = decode("k MQ==,other Mw==,k Mg==");

        assert_eq!(decoded.metadata.get("k"), Some("2"));
        let keys: Vec<&str> = decoded.metadata.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["k", "other"]);
    }

    #[test]
    fn test_decode_tolerates_whitespace_between_pairs() {
        let decoded = decode("a MQ==, b Mg==");
        assert_eq!(decoded.metadata.get("b"), Some("2"));
        assert_eq!(decoded.dropped, 0);
    }

    #[test]
    fn test_round_trip() {
        let meta: Metadata = [
            ("filename", "report final.pdf"),
            ("filetype", "application/pdf"),
            ("note", "comma, separated; text"),
        ]
        .into_iter()
        .collect();

        let decoded = decode(&encode(&meta).unwrap());
        assert_eq!(decoded.metadata, meta);
    }

    #[test]
    fn test_insert_returns_previous_value() {
        let mut meta = Metadata::new();
        assert_eq!(meta.insert("k", "v1"), None);
        assert_eq!(meta.insert("k", "v2"), Some("v1".to_string()));
        assert_eq!(meta.len(), 1);
    }
}
