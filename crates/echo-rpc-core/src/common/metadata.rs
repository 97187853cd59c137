//! Initial and trailing metadata conventions.
//!
//! Initial metadata travels in the response head and is sent before the first
//! response unit. Trailing metadata travels in the HTTP/2 trailers after the
//! last unit. `tonic` only lets handlers populate trailers for failed calls,
//! so a handler attaches [`TrailingMetadata`] to the response extensions and a
//! server layer merges it into the trailers frame on the way out.

use crate::common::error::{Error, Result};
use http::HeaderMap;
use tonic::metadata::MetadataMap;

/// Headers owned by the gRPC protocol itself. They are never surfaced as call
/// metadata and never overwritten by it.
pub const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "date",
    "te",
    "user-agent",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-message",
    "grpc-message-type",
    "grpc-status",
    "grpc-status-details-bin",
    "grpc-timeout",
];

/// Returns `true` for header names that belong to the transport.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Converts a raw header block into call metadata, dropping protocol headers.
pub fn from_headers(headers: &HeaderMap) -> MetadataMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_reserved(name.as_str()) {
            filtered.append(name.clone(), value.clone());
        }
    }
    MetadataMap::from_headers(filtered)
}

/// Appends user metadata onto a trailers block without touching the
/// protocol-owned entries already there.
pub fn merge_into(trailers: &mut HeaderMap, metadata: MetadataMap) {
    let extra = metadata.into_headers();
    for (name, value) in &extra {
        if !is_reserved(name.as_str()) {
            trailers.append(name.clone(), value.clone());
        }
    }
}

/// Trailing metadata attached to a server response, merged into the trailers
/// once the response body completes.
#[derive(Debug, Clone, Default)]
pub struct TrailingMetadata(MetadataMap);

impl TrailingMetadata {
    pub fn new(metadata: MetadataMap) -> Self {
        Self(metadata)
    }

    pub fn into_inner(self) -> MetadataMap {
        self.0
    }

    /// Attaches `metadata` as the trailing metadata of `response`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MetadataAlreadySet`] if the response already carries
    /// trailing metadata.
    pub fn attach<T>(response: &mut tonic::Response<T>, metadata: MetadataMap) -> Result<()> {
        let extensions = response.extensions_mut();
        if extensions.get::<TrailingMetadata>().is_some() {
            return Err(Error::MetadataAlreadySet);
        }
        extensions.insert(TrailingMetadata(metadata));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn reserved_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/grpc".parse().unwrap());
        headers.insert("grpc-status", "0".parse().unwrap());
        headers.insert("c", "3".parse().unwrap());
        headers.append("d", "4".parse().unwrap());
        headers.append("d", "5".parse().unwrap());

        let metadata = from_headers(&headers);
        assert!(metadata.get("content-type").is_none());
        assert!(metadata.get("grpc-status").is_none());
        assert_eq!(metadata.get("c").unwrap(), "3");
        let d: Vec<_> = metadata.get_all("d").iter().collect();
        assert_eq!(d, vec!["4", "5"]);
    }

    #[test]
    fn merge_keeps_protocol_status() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());

        let mut metadata = MetadataMap::new();
        metadata.insert("retry", MetadataValue::from_static("false"));
        metadata.insert_bin("checksum-bin", MetadataValue::from_bytes(b"I agree"));
        metadata.insert("grpc-status", MetadataValue::from_static("13"));
        merge_into(&mut trailers, metadata);

        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
        assert_eq!(trailers.get("retry").unwrap(), "false");
        assert!(trailers.contains_key("checksum-bin"));
    }

    #[test]
    fn trailing_metadata_attaches_once() {
        let mut response = tonic::Response::new(());
        TrailingMetadata::attach(&mut response, MetadataMap::new()).unwrap();
        assert_eq!(
            TrailingMetadata::attach(&mut response, MetadataMap::new()),
            Err(Error::MetadataAlreadySet)
        );
    }

    #[test]
    fn keys_are_case_insensitive() {
        assert!(is_reserved("Content-Type"));
        assert!(is_reserved("GRPC-STATUS"));
        assert!(!is_reserved("retry"));
    }
}
