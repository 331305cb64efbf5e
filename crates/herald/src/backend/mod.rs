//! Backend resolvers.
//!
//! The front door classifies each request into an [`S3Op`] and hands it to
//! the resolver matching the bucket's backend protocol. Mirror workers replay
//! the same ops against replica backends through the same entry point.

mod s3;
mod swift;

pub use self::s3::S3Resolver;
pub use self::swift::{
    MULTIPART_INDEX_KEY, MultipartUpload, MultipartUploadIndex, PartRecord, SEGMENT_THRESHOLD,
    SwiftResolver,
};

use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::HeraldResult;
use crate::header;
use crate::keystone::TokenStore;
use crate::meta::RequestMeta;

/// Transient upstream failures are retried this many times with a linearly
/// growing pause.
pub const RETRY_ATTEMPTS: u32 = 5;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Runs `op` until it succeeds or the attempt budget is exhausted.
pub async fn retry_request<T, F, Fut>(mut op: F) -> HeraldResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HeraldResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < RETRY_ATTEMPTS => {
                tracing::debug!(attempt, ?err, "upstream request failed, retrying");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `x-amz-copy-source` value: `bucket/key`, optionally with a leading slash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopySource {
    pub bucket: String,
    pub key: String,
}

impl CopySource {
    pub fn parse(raw: &str) -> HeraldResult<Self> {
        let decoded = urlencoding::decode(raw).map_err(|_| invalid_request!("invalid x-amz-copy-source"))?;
        let trimmed = decoded.trim_start_matches('/');
        let (bucket, key) = trimmed
            .split_once('/')
            .ok_or_else(|| invalid_request!("x-amz-copy-source must name bucket and key"))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(invalid_request!("x-amz-copy-source must name bucket and key"));
        }
        Ok(Self {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        })
    }
}

/// The operation a request resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum S3Op {
    ListBuckets,
    ListObjects,
    CreateBucket,
    DeleteBucket,
    HeadBucket,
    GetObject,
    HeadObject,
    PutObject,
    DeleteObject,
    DeleteObjects,
    CopyObject {
        source: CopySource,
    },
    CreateMultipartUpload,
    UploadPart {
        upload_id: String,
        part_number: u32,
    },
    UploadPartCopy {
        upload_id: String,
        part_number: u32,
        source: CopySource,
        range: Option<String>,
    },
    CompleteMultipartUpload {
        upload_id: String,
    },
    AbortMultipartUpload {
        upload_id: String,
    },
}

impl S3Op {
    /// Resolves the operation from method, path shape, query and headers.
    pub fn classify(meta: &RequestMeta, headers: &HeaderMap) -> HeraldResult<Self> {
        let has_key = meta.object_key.is_some();
        let copy_source = headers
            .get(header::X_AMZ_COPY_SOURCE)
            .and_then(|v| v.to_str().ok())
            .map(CopySource::parse)
            .transpose()?;

        let op = match meta.method.as_str() {
            "GET" => match (meta.bucket.is_some(), has_key) {
                (false, _) => Self::ListBuckets,
                (true, false) => Self::ListObjects,
                (true, true) => Self::GetObject,
            },
            "HEAD" => {
                if has_key {
                    Self::HeadObject
                } else {
                    Self::HeadBucket
                }
            }
            "PUT" => {
                if !has_key {
                    Self::CreateBucket
                } else if let Some(upload_id) = meta.query_first("uploadId") {
                    let part_number = parse_part_number(meta)?;
                    let upload_id = upload_id.to_owned();
                    match copy_source {
                        Some(source) => Self::UploadPartCopy {
                            upload_id,
                            part_number,
                            source,
                            range: headers
                                .get(header::X_AMZ_COPY_SOURCE_RANGE)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_owned),
                        },
                        None => Self::UploadPart { upload_id, part_number },
                    }
                } else if let Some(source) = copy_source {
                    Self::CopyObject { source }
                } else {
                    Self::PutObject
                }
            }
            "POST" => {
                if meta.query_has("uploads") {
                    Self::CreateMultipartUpload
                } else if let Some(upload_id) = meta.query_first("uploadId") {
                    Self::CompleteMultipartUpload {
                        upload_id: upload_id.to_owned(),
                    }
                } else if meta.query_has("delete") {
                    Self::DeleteObjects
                } else {
                    return Err(invalid_request!("unsupported POST operation"));
                }
            }
            "DELETE" => {
                if !has_key {
                    Self::DeleteBucket
                } else if let Some(upload_id) = meta.query_first("uploadId") {
                    Self::AbortMultipartUpload {
                        upload_id: upload_id.to_owned(),
                    }
                } else {
                    Self::DeleteObject
                }
            }
            _ => return Err(invalid_request!("unsupported method: {}", meta.method)),
        };
        Ok(op)
    }

    /// Whether a successful primary response makes this op eligible for
    /// replica fan out.
    #[must_use]
    pub fn is_mirrored(&self) -> bool {
        matches!(
            self,
            Self::PutObject
                | Self::DeleteObject
                | Self::DeleteObjects
                | Self::CopyObject { .. }
                | Self::CreateBucket
                | Self::DeleteBucket
                | Self::CompleteMultipartUpload { .. }
        )
    }
}

fn parse_part_number(meta: &RequestMeta) -> HeraldResult<u32> {
    meta.query_first("partNumber")
        .ok_or_else(|| invalid_request!("missing partNumber"))?
        .parse()
        .map_err(|_| invalid_request!("invalid partNumber"))
}

/// Headers worth carrying to the backend and into mirror tasks.
const FORWARDED_HEADERS: &[&str] = &[
    header::CONTENT_TYPE,
    "content-encoding",
    "content-disposition",
    "content-language",
    "cache-control",
    "expires",
    header::RANGE,
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
    "x-amz-acl",
    "x-amz-storage-class",
    header::X_AMZ_COPY_SOURCE,
    header::X_AMZ_COPY_SOURCE_RANGE,
];

/// The parts of the client request a resolver (or a replayed mirror task)
/// needs. Serializable so tasks can carry it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxiedRequest {
    pub method: String,
    pub object_key: Option<String>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl ProxiedRequest {
    #[must_use]
    pub fn from_parts(meta: &RequestMeta, headers: &HeaderMap) -> Self {
        let mut kept = Vec::new();
        for (name, value) in headers {
            let name_str = name.as_str();
            let keep = FORWARDED_HEADERS.contains(&name_str) || name_str.starts_with("x-amz-meta-");
            if keep && let Ok(value) = value.to_str() {
                kept.push((name_str.to_owned(), value.to_owned()));
            }
        }
        let query = meta
            .query
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.clone(), v.clone())))
            .collect();
        Self {
            method: meta.method.to_string(),
            object_key: meta.object_key.clone(),
            query,
            headers: kept,
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE)
    }
}

/// Buffered backend answer, ready to be translated into a client response.
#[derive(Debug)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    #[must_use]
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn xml(status: StatusCode, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/xml"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(body),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Response headers relayed from a backend to the client.
const RELAYED_RESPONSE_HEADERS: &[&str] = &[
    header::ETAG,
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::LAST_MODIFIED,
    "accept-ranges",
    "content-range",
    "x-amz-version-id",
    "x-amz-delete-marker",
    "x-amz-expiration",
    "x-amz-server-side-encryption",
    "x-amz-storage-class",
];

pub(crate) fn relay_response_headers(from: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in from {
        let name_str = name.as_str();
        if RELAYED_RESPONSE_HEADERS.contains(&name_str) || name_str.starts_with("x-amz-meta-") {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Protocol resolvers sharing one HTTP client.
#[derive(Clone)]
pub struct Resolvers {
    s3: S3Resolver,
    swift: SwiftResolver,
}

impl Resolvers {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            s3: S3Resolver::new(client.clone()),
            swift: SwiftResolver::new(client),
        }
    }

    /// Executes `op` on `bucket` against the given backend.
    pub async fn execute(
        &self,
        tokens: &TokenStore,
        backend: &BackendConfig,
        bucket: &str,
        op: &S3Op,
        request: &ProxiedRequest,
        body: Bytes,
    ) -> HeraldResult<BackendResponse> {
        match backend {
            BackendConfig::S3(config) => self.s3.execute(config, bucket, op, request, body).await,
            BackendConfig::Swift(config) => {
                self.swift.execute(tokens, config, bucket, op, request, body).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::Method;

    use crate::meta::{QueryMap, UrlFormat};

    fn meta(method: Method, bucket: Option<&str>, key: Option<&str>, query: &[(&str, &str)]) -> RequestMeta {
        let mut map = QueryMap::new();
        for (name, value) in query {
            map.entry((*name).to_owned()).or_default().push((*value).to_owned());
        }
        RequestMeta {
            bucket: bucket.map(str::to_owned),
            object_key: key.map(str::to_owned),
            url_format: UrlFormat::Path,
            method,
            query: map,
        }
    }

    #[test]
    fn classify_basic_verbs() {
        let headers = HeaderMap::new();
        let cases = [
            (meta(Method::GET, None, None, &[]), S3Op::ListBuckets),
            (meta(Method::GET, Some("b"), None, &[]), S3Op::ListObjects),
            (meta(Method::GET, Some("b"), Some("k"), &[]), S3Op::GetObject),
            (meta(Method::HEAD, Some("b"), Some("k"), &[]), S3Op::HeadObject),
            (meta(Method::PUT, Some("b"), None, &[]), S3Op::CreateBucket),
            (meta(Method::PUT, Some("b"), Some("k"), &[]), S3Op::PutObject),
            (meta(Method::DELETE, Some("b"), None, &[]), S3Op::DeleteBucket),
            (meta(Method::DELETE, Some("b"), Some("k"), &[]), S3Op::DeleteObject),
            (meta(Method::POST, Some("b"), Some("k"), &[("uploads", "")]), S3Op::CreateMultipartUpload),
            (meta(Method::POST, Some("b"), None, &[("delete", "")]), S3Op::DeleteObjects),
        ];
        for (input, expected) in cases {
            assert_eq!(S3Op::classify(&input, &headers).unwrap(), expected);
        }
    }

    #[test]
    fn classify_multipart_ops() {
        let headers = HeaderMap::new();
        let m = meta(
            Method::PUT,
            Some("b"),
            Some("k"),
            &[("uploadId", "u-1"), ("partNumber", "3")],
        );
        assert_eq!(
            S3Op::classify(&m, &headers).unwrap(),
            S3Op::UploadPart { upload_id: "u-1".to_owned(), part_number: 3 }
        );

        let m = meta(Method::POST, Some("b"), Some("k"), &[("uploadId", "u-1")]);
        assert_eq!(
            S3Op::classify(&m, &headers).unwrap(),
            S3Op::CompleteMultipartUpload { upload_id: "u-1".to_owned() }
        );

        let m = meta(Method::DELETE, Some("b"), Some("k"), &[("uploadId", "u-1")]);
        assert_eq!(
            S3Op::classify(&m, &headers).unwrap(),
            S3Op::AbortMultipartUpload { upload_id: "u-1".to_owned() }
        );
    }

    #[test]
    fn classify_copy_ops() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::X_AMZ_COPY_SOURCE,
            hyper::header::HeaderValue::from_static("/src-bucket/some/key"),
        );

        let m = meta(Method::PUT, Some("b"), Some("k"), &[]);
        let S3Op::CopyObject { source } = S3Op::classify(&m, &headers).unwrap() else {
            panic!("expected CopyObject");
        };
        assert_eq!(source.bucket, "src-bucket");
        assert_eq!(source.key, "some/key");

        let m = meta(
            Method::PUT,
            Some("b"),
            Some("k"),
            &[("uploadId", "u-1"), ("partNumber", "1")],
        );
        assert!(matches!(
            S3Op::classify(&m, &headers).unwrap(),
            S3Op::UploadPartCopy { .. }
        ));
    }

    #[test]
    fn mirrored_ops() {
        assert!(S3Op::PutObject.is_mirrored());
        assert!(S3Op::DeleteBucket.is_mirrored());
        assert!(S3Op::CompleteMultipartUpload { upload_id: "u".to_owned() }.is_mirrored());
        assert!(!S3Op::GetObject.is_mirrored());
        assert!(!S3Op::UploadPart { upload_id: "u".to_owned(), part_number: 1 }.is_mirrored());
    }

    #[test]
    fn copy_source_parse() {
        let source = CopySource::parse("bucket/a/b.txt").unwrap();
        assert_eq!((source.bucket.as_str(), source.key.as_str()), ("bucket", "a/b.txt"));
        assert!(CopySource::parse("onlybucket").is_err());
        assert!(CopySource::parse("/bucket/%E2%82%AC.txt").unwrap().key.starts_with('€'));
    }

    #[test]
    fn proxied_request_keeps_relevant_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", hyper::header::HeaderValue::from_static("text/plain"));
        headers.insert("x-amz-meta-owner", hyper::header::HeaderValue::from_static("ops"));
        headers.insert("authorization", hyper::header::HeaderValue::from_static("AWS4 ..."));

        let m = meta(Method::PUT, Some("b"), Some("k"), &[("tag", "x")]);
        let proxied = ProxiedRequest::from_parts(&m, &headers);
        assert_eq!(proxied.content_type(), Some("text/plain"));
        assert_eq!(proxied.header("x-amz-meta-owner"), Some("ops"));
        assert!(proxied.header("authorization").is_none());
        assert_eq!(proxied.query, vec![("tag".to_owned(), "x".to_owned())]);
    }
}
