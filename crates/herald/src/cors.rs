//! CORS policy.
//!
//! The allow list comes from `cors.host` in the config and supports `*`,
//! exact origins with scheme, and `*.domain` wildcards. Preflights are
//! answered by the front door without touching any backend.

use hyper::HeaderMap;
use hyper::header::HeaderValue;

/// Response headers browsers may read on S3 answers.
pub const EXPOSED_HEADERS: &str = "ETag, Content-Length, Content-Type, x-amz-request-id, \
x-amz-id-2, x-amz-version-id, x-amz-delete-marker, x-amz-expiration, \
x-amz-server-side-encryption, x-amz-storage-class, x-amz-website-redirect-location";

const ALLOWED_METHODS: &str = "GET, PUT, POST, DELETE, HEAD";

#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    allowed: Vec<String>,
}

impl CorsPolicy {
    #[must_use]
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Whether `origin` passes the allow list.
    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        self.allowed.iter().any(|pattern| origin_matches(pattern, origin))
    }

    /// CORS headers for a response to `origin`, or none when disallowed.
    #[must_use]
    pub fn response_headers(&self, origin: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(origin) = origin else {
            return headers;
        };
        if !self.allows(origin) {
            return headers;
        }
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert("access-control-allow-origin", value);
        }
        headers.insert("vary", HeaderValue::from_static("Origin"));
        headers.insert(
            "access-control-expose-headers",
            HeaderValue::from_static(EXPOSED_HEADERS),
        );
        headers
    }

    /// Headers for an `OPTIONS` preflight. Requested headers are reflected.
    #[must_use]
    pub fn preflight_headers(&self, origin: Option<&str>, requested_headers: Option<&str>) -> HeaderMap {
        let mut headers = self.response_headers(origin);
        if headers.is_empty() {
            return headers;
        }
        headers.insert(
            "access-control-allow-methods",
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        let allow_headers = requested_headers.unwrap_or("*");
        if let Ok(value) = HeaderValue::from_str(allow_headers) {
            headers.insert("access-control-allow-headers", value);
        }
        headers.insert("access-control-max-age", HeaderValue::from_static("3000"));
        headers
    }
}

fn origin_matches(pattern: &str, origin: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(domain) = pattern.strip_prefix("*.") {
        let host = origin
            .split_once("://")
            .map_or(origin, |(_, rest)| rest)
            .split(':')
            .next()
            .unwrap_or_default();
        return host == domain || host.ends_with(&format!(".{domain}"));
    }
    pattern == origin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allows_everything() {
        let policy = CorsPolicy::new(vec!["*".to_owned()]);
        assert!(policy.allows("https://anything.example"));
    }

    #[test]
    fn exact_origin_requires_scheme_match() {
        let policy = CorsPolicy::new(vec!["https://console.example.com".to_owned()]);
        assert!(policy.allows("https://console.example.com"));
        assert!(!policy.allows("http://console.example.com"));
        assert!(!policy.allows("https://other.example.com"));
    }

    #[test]
    fn domain_wildcard_matches_subdomains() {
        let policy = CorsPolicy::new(vec!["*.example.org".to_owned()]);
        assert!(policy.allows("https://app.example.org"));
        assert!(policy.allows("https://deep.sub.example.org:8443"));
        assert!(policy.allows("http://example.org"));
        assert!(!policy.allows("https://example.com"));
        assert!(!policy.allows("https://notexample.org"));
    }

    #[test]
    fn disallowed_origin_gets_no_headers() {
        let policy = CorsPolicy::new(vec!["https://a.example".to_owned()]);
        assert!(policy.response_headers(Some("https://b.example")).is_empty());
        assert!(policy.response_headers(None).is_empty());
    }

    #[test]
    fn preflight_reflects_requested_headers() {
        let policy = CorsPolicy::new(vec!["*".to_owned()]);
        let headers = policy.preflight_headers(Some("https://app.example"), Some("content-type, x-amz-date"));
        assert_eq!(
            headers.get("access-control-allow-headers").unwrap(),
            "content-type, x-amz-date"
        );
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "https://app.example");
        assert!(headers.get("access-control-expose-headers").is_some());
    }
}
