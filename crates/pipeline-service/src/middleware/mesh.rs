//! Service-mesh metadata carried in `X-Service-*` request headers.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;

/// Reserved header namespace for mesh metadata (compared case-insensitively).
pub const MESH_HEADER_PREFIX: &str = "x-service-";

/// Per-request mesh metadata, keyed by the lower-cased header name with the
/// prefix removed (`X-Service-Region: eu` → `region = eu`).
///
/// Always present in the request extensions once the tracing interceptor
/// has run, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MeshMetadata(HashMap<String, String>);

impl MeshMetadata {
    /// Collect every mesh header. A repeated header contributes its first value.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let entries = headers
            .keys()
            .filter_map(|name| {
                let key = name.as_str().strip_prefix(MESH_HEADER_PREFIX)?;
                let value = headers.get(name)?;
                Some((
                    key.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                ))
            })
            .collect();

        Self(entries)
    }

    /// Look up a key. Keys are stored lower-cased.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Extractor handing the request's mesh metadata to a handler.
///
/// Never rejects: a request that bypassed the interceptor yields an empty map.
#[derive(Debug, Clone, Default)]
pub struct Mesh(pub MeshMetadata);

#[async_trait]
impl<S> FromRequestParts<S> for Mesh
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<MeshMetadata>()
                .cloned()
                .unwrap_or_default(),
        ))
    }
}
