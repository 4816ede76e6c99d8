//! Route identity resolution for metrics and tracing labels.
//!
//! Every request is named by a `RouteIdentity` before it is recorded or
//! traced. When the router matched the request, the matched route template
//! is used as the operation identifier. Otherwise the raw request URI is
//! normalized so that per-instance values (numeric IDs, tokens) collapse into
//! a single `{param}` placeholder.
//!
//! # Cardinality
//!
//! Without this collapsing every UUID or numeric ID in a path would create a
//! new time series. The identity is recomputed per request and never cached
//! across requests, since paths vary. Within one request the outermost layer
//! resolves it and attaches it to the request extensions for inner layers.

use axum::extract::{MatchedPath, Request};
use axum::http::{Method, Uri};
use std::fmt;

/// Placeholder substituted for path segments carrying per-instance values.
pub const PARAM_PLACEHOLDER: &str = "{param}";

/// Segments shorter than this are never rewritten.
pub const MIN_NORMALIZED_SEGMENT_LEN: usize = 6;

/// Low-cardinality label identifying an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteIdentity(String);

impl RouteIdentity {
    /// Resolve the identity of a request from its parts.
    ///
    /// `operation` is the identifier of the matched route, when the router
    /// resolved one. It takes precedence over the raw URI.
    pub fn resolve(method: &Method, uri: &Uri, operation: Option<&str>) -> Self {
        match operation {
            Some(operation_id) => Self(format!("{} {}", method, operation_id)),
            None => {
                let raw = uri
                    .path_and_query()
                    .map_or_else(|| uri.path(), |pq| pq.as_str());
                Self(format!("{} {}", method, normalize_path(raw)))
            }
        }
    }

    /// Resolve the identity of an axum request, using its `MatchedPath`
    /// extension as the operation identifier when present.
    pub fn of_request(request: &Request) -> Self {
        let operation = request
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str);
        Self::resolve(request.method(), request.uri(), operation)
    }

    /// Identity already attached to the request by an outer layer, or a
    /// freshly resolved one.
    pub fn for_request(request: &Request) -> Self {
        request
            .extensions()
            .get::<RouteIdentity>()
            .cloned()
            .unwrap_or_else(|| Self::of_request(request))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RouteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a raw request URI.
///
/// Each `/`-separated segment of at least `MIN_NORMALIZED_SEGMENT_LEN` bytes
/// is scanned left to right. The first digit replaces the whole segment with
/// `{param}`. The first `?` truncates the segment at that position. Whichever
/// comes first wins, so a digit ahead of a `?` always produces `{param}`.
pub fn normalize_path(raw: &str) -> String {
    let segments: Vec<&str> = raw.split('/').map(normalize_segment).collect();
    segments.join("/")
}

fn normalize_segment(segment: &str) -> &str {
    if segment.len() < MIN_NORMALIZED_SEGMENT_LEN {
        return segment;
    }

    for (idx, ch) in segment.char_indices() {
        if ch.is_ascii_digit() {
            return PARAM_PLACEHOLDER;
        }
        if ch == '?' {
            return segment.get(..idx).unwrap_or(segment);
        }
    }

    segment
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn resolve(method: Method, uri: &str, operation: Option<&str>) -> String {
        let uri: Uri = uri.parse().expect("valid uri");
        RouteIdentity::resolve(&method, &uri, operation).into_string()
    }

    #[test]
    fn test_matched_operation_wins_over_path() {
        assert_eq!(
            resolve(Method::GET, "/users/1234567/profile", Some("/users/:id/profile")),
            "GET /users/:id/profile"
        );
        assert_eq!(
            resolve(Method::DELETE, "/anything?x=1", Some("deleteThing")),
            "DELETE deleteThing"
        );
    }

    #[test]
    fn test_segment_with_digit_collapses() {
        assert_eq!(
            resolve(Method::GET, "/api/items12345/detail", None),
            "GET /api/{param}/detail"
        );
        assert_eq!(
            resolve(Method::GET, "/users/1234567/profile", None),
            "GET /users/{param}/profile"
        );
    }

    #[test]
    fn test_short_segments_pass_through() {
        assert_eq!(
            resolve(Method::GET, "/api/abc/detail", None),
            "GET /api/abc/detail"
        );
        // 5 characters with a digit stays as-is
        assert_eq!(resolve(Method::GET, "/v1/ab123", None), "GET /v1/ab123");
    }

    #[test]
    fn test_query_suffix_is_stripped() {
        assert_eq!(
            resolve(Method::GET, "/api/orders?page=2", None),
            "GET /api/orders"
        );
    }

    #[test]
    fn test_digit_before_question_mark_wins() {
        assert_eq!(
            resolve(Method::GET, "/api/order9?page=2", None),
            "GET /api/{param}"
        );
    }

    #[test]
    fn test_short_segment_keeps_query() {
        assert_eq!(resolve(Method::GET, "/api/a?b=1", None), "GET /api/a?b=1");
    }

    #[test]
    fn test_root_path_unchanged() {
        assert_eq!(resolve(Method::POST, "/", None), "POST /");
    }

    #[test]
    fn test_uuid_segment_collapses() {
        assert_eq!(
            resolve(
                Method::PUT,
                "/sessions/5f0c8a52-93b4-4c43-9ad5-5b0b9a2a8e11",
                None
            ),
            "PUT /sessions/{param}"
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let uri: Uri = "/api/items12345/detail?x=1".parse().unwrap();
        let first = RouteIdentity::resolve(&Method::GET, &uri, None);
        let second = RouteIdentity::resolve(&Method::GET, &uri, None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_normalize_empty_path() {
        assert_eq!(normalize_path(""), "");
    }
}
