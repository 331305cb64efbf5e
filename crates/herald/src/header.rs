//! Header names used across the proxy.

pub const AUTHORIZATION: &str = "authorization";
pub const HOST: &str = "host";
pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_TYPE: &str = "content-type";
pub const ETAG: &str = "etag";
pub const LAST_MODIFIED: &str = "last-modified";
pub const RANGE: &str = "range";

pub const X_AMZ_DATE: &str = "x-amz-date";
pub const X_AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";
pub const X_AMZ_REQUEST_ID: &str = "x-amz-request-id";
pub const X_AMZ_ID_2: &str = "x-amz-id-2";
pub const X_AMZ_COPY_SOURCE: &str = "x-amz-copy-source";
pub const X_AMZ_COPY_SOURCE_RANGE: &str = "x-amz-copy-source-range";

/// Sentinel payload hash for requests whose body is not covered by the signature.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub const X_AUTH_TOKEN: &str = "x-auth-token";
pub const X_SUBJECT_TOKEN: &str = "x-subject-token";
pub const X_COPY_FROM: &str = "x-copy-from";
pub const X_COPY_FROM_RANGE: &str = "x-copy-from-range";
pub const X_OBJECT_MANIFEST: &str = "x-object-manifest";
