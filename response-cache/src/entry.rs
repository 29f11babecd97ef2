//! Serialization helpers for [`Cacher`](crate::Cacher) backends.
//!
//! Stores own their on-disk format; nothing in the middleware requires
//! these types. They exist so that simple backends (filesystem, KV) can
//! persist the request/response pair without writing header plumbing of
//! their own. Multi-valued headers are preserved; header values that are
//! not valid UTF-8 are dropped.

use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use serde::{Deserialize, Serialize};

use crate::{CacheError, CachedRequest, CachedResponse, Result};

/// A serializable rendering of a cached request: the method, target URI
/// and the header fields needed for `Vary` matching on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRequest {
    /// Request method.
    pub method: String,
    /// Full target URI, including the raw query.
    pub uri: String,
    /// Request headers, multi-valued.
    pub headers: HashMap<String, Vec<String>>,
    /// Request body bytes. Empty unless the middleware was configured to
    /// duplicate request bodies.
    pub body: Vec<u8>,
}

/// A serializable rendering of a cached response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    /// Response status code.
    pub status: u16,
    /// Response headers, multi-valued.
    pub headers: HashMap<String, Vec<String>>,
    /// Response body bytes.
    pub body: Vec<u8>,
}

/// Serializes a request to JSON bytes.
pub fn request_to_bytes(req: &CachedRequest) -> Result<Vec<u8>> {
    let stored = StoredRequest {
        method: req.method().to_string(),
        uri: req.uri().to_string(),
        headers: headers_to_map(req.headers()),
        body: req.body().to_vec(),
    };
    serde_json::to_vec(&stored).map_err(CacheError::backend)
}

/// Deserializes a request from the bytes produced by [`request_to_bytes`].
pub fn bytes_to_request(b: &[u8]) -> Result<CachedRequest> {
    let stored: StoredRequest =
        serde_json::from_slice(b).map_err(CacheError::backend)?;
    let mut builder =
        Request::builder().method(stored.method.as_str()).uri(stored.uri);
    if let Some(headers) = builder.headers_mut() {
        *headers = map_to_headers(&stored.headers);
    }
    builder.body(Bytes::from(stored.body)).map_err(CacheError::backend)
}

/// Serializes a response to JSON bytes.
pub fn response_to_bytes(res: &CachedResponse) -> Result<Vec<u8>> {
    let stored = StoredResponse {
        status: res.status().as_u16(),
        headers: headers_to_map(res.headers()),
        body: res.body().to_vec(),
    };
    serde_json::to_vec(&stored).map_err(CacheError::backend)
}

/// Deserializes a response from the bytes produced by
/// [`response_to_bytes`].
pub fn bytes_to_response(b: &[u8]) -> Result<CachedResponse> {
    let stored: StoredResponse =
        serde_json::from_slice(b).map_err(CacheError::backend)?;
    let mut builder = Response::builder().status(stored.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = map_to_headers(&stored.headers);
    }
    builder.body(Bytes::from(stored.body)).map_err(CacheError::backend)
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        if !values.is_empty() {
            map.insert(name.to_string(), values);
        }
    }
    map
}

fn map_to_headers(map: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}
