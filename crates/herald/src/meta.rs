//! Request resolution: URL style, bucket, object key, method and query.

use hyper::{Method, Uri};

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use crate::error::HeraldResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlFormat {
    VirtualHosted,
    Path,
}

pub type QueryMap = BTreeMap<String, Vec<String>>;

/// Immutable view of the routing relevant parts of an incoming request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub bucket: Option<String>,
    pub object_key: Option<String>,
    pub url_format: UrlFormat,
    pub method: Method,
    pub query: QueryMap,
}

impl RequestMeta {
    pub fn extract(
        method: &Method,
        uri: &Uri,
        host_header: Option<&str>,
        virtual_host_aliases: &[String],
    ) -> HeraldResult<Self> {
        let method = parse_method(method)?;
        let query = parse_query(uri)?;

        let decoded_path = urlencoding::decode(uri.path())
            .map_err(|_| herald_error!(InvalidURI, "request path is not valid percent encoding"))?;
        let segments: Vec<&str> = decoded_path.split('/').filter(|s| !s.is_empty()).collect();

        let url_format = detect_url_format(host_header, virtual_host_aliases);

        let (bucket, key_segments) = match url_format {
            UrlFormat::VirtualHosted => {
                let hostname = host_header.map(strip_port).unwrap_or_default();
                let bucket = hostname.split('.').next().unwrap_or_default().to_owned();
                (Some(bucket), segments.as_slice())
            }
            UrlFormat::Path => match segments.split_first() {
                Some((bucket, rest)) => (Some((*bucket).to_owned()), rest),
                None => (None, &[] as &[&str]),
            },
        };

        let object_key = if key_segments.is_empty() {
            None
        } else {
            Some(key_segments.join("/"))
        };

        Ok(Self {
            bucket,
            object_key,
            url_format,
            method,
            query,
        })
    }

    #[must_use]
    pub fn query_has(&self, name: &str) -> bool {
        self.query.contains_key(name)
    }

    #[must_use]
    pub fn query_first(&self, name: &str) -> Option<&str> {
        self.query.get(name)?.first().map(String::as_str)
    }
}

fn parse_method(method: &Method) -> HeraldResult<Method> {
    match method.as_str() {
        "GET" | "PUT" | "POST" | "DELETE" | "HEAD" => Ok(method.clone()),
        _ => Err(invalid_request!("unsupported method: {method}")),
    }
}

fn parse_query(uri: &Uri) -> HeraldResult<QueryMap> {
    let Some(raw) = uri.query() else {
        return Ok(QueryMap::new());
    };
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw)
        .map_err(|_| herald_error!(InvalidURI, "query string is not decodable"))?;
    let mut query = QueryMap::new();
    for (name, value) in pairs {
        query.entry(name).or_default().push(value);
    }
    Ok(query)
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their brackets, everything after them goes.
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

fn is_ip_or_local(host: &str) -> bool {
    let hostname = strip_port(host);
    hostname.eq_ignore_ascii_case("localhost")
        || host.parse::<SocketAddr>().is_ok()
        || hostname.trim_matches(['[', ']']).parse::<IpAddr>().is_ok()
}

fn detect_url_format(host_header: Option<&str>, aliases: &[String]) -> UrlFormat {
    let Some(host) = host_header else {
        return UrlFormat::Path;
    };
    if is_ip_or_local(host) {
        return UrlFormat::Path;
    }

    let hostname = strip_port(host);

    // A request addressed to a configured proxy domain itself is path style;
    // a subdomain of one is the virtual-hosted bucket form.
    for alias in aliases {
        if hostname.eq_ignore_ascii_case(alias) {
            return UrlFormat::Path;
        }
        if hostname.len() > alias.len() + 1
            && hostname[hostname.len() - alias.len()..].eq_ignore_ascii_case(alias)
            && hostname.as_bytes()[hostname.len() - alias.len() - 1] == b'.'
        {
            return UrlFormat::VirtualHosted;
        }
    }

    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() >= 3 {
        let leftmost = labels[0];
        let anchor = labels[labels.len() - 3];
        if !leftmost.contains("s3") && leftmost != "www" && anchor != "www" {
            return UrlFormat::VirtualHosted;
        }
    }
    UrlFormat::Path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(method: Method, uri: &str, host: Option<&str>) -> HeraldResult<RequestMeta> {
        let uri: Uri = uri.parse().unwrap();
        RequestMeta::extract(&method, &uri, host, &[])
    }

    #[test]
    fn path_style_on_ip_host() {
        let meta = extract(Method::GET, "/photos/cats/tabby.jpg", Some("127.0.0.1:8000")).unwrap();
        assert_eq!(meta.url_format, UrlFormat::Path);
        assert_eq!(meta.bucket.as_deref(), Some("photos"));
        assert_eq!(meta.object_key.as_deref(), Some("cats/tabby.jpg"));
    }

    #[test]
    fn path_style_on_localhost() {
        let meta = extract(Method::PUT, "/photos/a.txt", Some("localhost:9000")).unwrap();
        assert_eq!(meta.url_format, UrlFormat::Path);
        assert_eq!(meta.bucket.as_deref(), Some("photos"));
    }

    #[test]
    fn virtual_hosted_extracts_leftmost_label() {
        let meta = extract(Method::GET, "/cats/tabby.jpg", Some("photos.storage.example.com")).unwrap();
        assert_eq!(meta.url_format, UrlFormat::VirtualHosted);
        assert_eq!(meta.bucket.as_deref(), Some("photos"));
        assert_eq!(meta.object_key.as_deref(), Some("cats/tabby.jpg"));
    }

    #[test]
    fn s3_label_forces_path_style() {
        let meta = extract(Method::GET, "/photos/a.txt", Some("s3.example.com")).unwrap();
        assert_eq!(meta.url_format, UrlFormat::Path);
        assert_eq!(meta.bucket.as_deref(), Some("photos"));
    }

    #[test]
    fn www_host_is_path_style() {
        let meta = extract(Method::GET, "/photos", Some("www.example.com")).unwrap();
        assert_eq!(meta.url_format, UrlFormat::Path);
    }

    #[test]
    fn alias_subdomain_is_virtual_hosted() {
        let uri: Uri = "/report.pdf".parse().unwrap();
        let aliases = vec!["herald.example.com".to_owned()];
        let meta =
            RequestMeta::extract(&Method::GET, &uri, Some("docs.herald.example.com"), &aliases).unwrap();
        assert_eq!(meta.url_format, UrlFormat::VirtualHosted);
        assert_eq!(meta.bucket.as_deref(), Some("docs"));
        assert_eq!(meta.object_key.as_deref(), Some("report.pdf"));
    }

    #[test]
    fn alias_itself_is_path_style() {
        let uri: Uri = "/docs/report.pdf".parse().unwrap();
        let aliases = vec!["herald.example.com".to_owned()];
        let meta = RequestMeta::extract(&Method::GET, &uri, Some("herald.example.com"), &aliases).unwrap();
        assert_eq!(meta.url_format, UrlFormat::Path);
        assert_eq!(meta.bucket.as_deref(), Some("docs"));
    }

    #[test]
    fn query_params_are_multi_valued() {
        let meta = extract(
            Method::GET,
            "/photos?prefix=cats&tag=a&tag=b",
            Some("localhost"),
        )
        .unwrap();
        assert_eq!(meta.query_first("prefix"), Some("cats"));
        assert_eq!(meta.query["tag"], ["a", "b"]);
    }

    #[test]
    fn empty_path_has_no_bucket() {
        let meta = extract(Method::GET, "/", Some("localhost")).unwrap();
        assert!(meta.bucket.is_none());
        assert!(meta.object_key.is_none());
    }

    #[test]
    fn rejects_unknown_method() {
        let err = extract(Method::PATCH, "/photos/a", Some("localhost")).unwrap_err();
        assert_eq!(err.code(), crate::error::HeraldErrorCode::InvalidRequest);
    }
}
