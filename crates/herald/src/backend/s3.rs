//! Upstream S3 resolver.
//!
//! Requests are rebuilt path style against the backend endpoint and re-signed
//! with the backend's credentials. Bucket names map 1:1, so the client's verb
//! travels unchanged; only the authentication envelope is replaced.

use bytes::Bytes;
use hyper::Method;

use crate::config::S3BackendConfig;
use crate::error::{HeraldError, HeraldResult};
use crate::header;
use crate::sig_v4::{self, OutboundSigning};

use super::{BackendResponse, ProxiedRequest, S3Op, relay_response_headers, retry_request};

/// Presign parameters of the original client request; they must not leak to
/// the backend, which sees a fresh signature.
const CLIENT_AUTH_PARAMS: &[&str] = &[
    "X-Amz-Algorithm",
    "X-Amz-Credential",
    "X-Amz-Date",
    "X-Amz-Expires",
    "X-Amz-SignedHeaders",
    "X-Amz-Signature",
    "X-Amz-Security-Token",
];

#[derive(Clone)]
pub struct S3Resolver {
    client: reqwest::Client,
}

impl S3Resolver {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn execute(
        &self,
        config: &S3BackendConfig,
        bucket: &str,
        op: &S3Op,
        request: &ProxiedRequest,
        body: Bytes,
    ) -> HeraldResult<BackendResponse> {
        let method = method_for(op);
        let endpoint = config.endpoint.trim_end_matches('/');
        let endpoint_url = reqwest::Url::parse(endpoint)
            .map_err(|e| HeraldError::internal(std::io::Error::other(format!("bad backend endpoint: {e}"))))?;
        let host = host_header(&endpoint_url)?;

        let uri_path = match (op, request.object_key.as_deref()) {
            (S3Op::ListBuckets, _) => "/".to_owned(),
            (_, Some(key)) => format!("/{bucket}/{}", sig_v4::uri_encode(key, false)),
            (_, None) => format!("/{bucket}"),
        };

        let mut query: Vec<(String, String)> = request
            .query
            .iter()
            .filter(|(name, _)| !CLIENT_AUTH_PARAMS.contains(&name.as_str()))
            .cloned()
            .collect();
        query.sort();

        let amz_headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(name, _)| name.starts_with("x-amz-"))
            .cloned()
            .collect();

        let signed = sig_v4::sign_outbound(&OutboundSigning {
            method: &method,
            host: &host,
            uri_path: &uri_path,
            query: &query,
            payload_hash: header::UNSIGNED_PAYLOAD,
            amz_headers: &amz_headers,
            access_key_id: &config.credentials.access_key_id,
            secret_key: &config.credentials.secret_access_key,
            region: &config.region,
            now: time::OffsetDateTime::now_utc(),
        });

        let url = build_url(endpoint, &uri_path, &query);
        let response = retry_request(|| async {
            let mut builder = self.client.request(method.clone(), &url);
            for (name, value) in &signed {
                builder = builder.header(name, value);
            }
            for (name, value) in &request.headers {
                if !name.starts_with("x-amz-") {
                    builder = builder.header(name, value);
                }
            }
            Ok(builder.body(body.clone()).send().await?)
        })
        .await?;

        let status = response.status();
        let headers = relay_response_headers(response.headers());
        let body = response.bytes().await?;
        Ok(BackendResponse { status, headers, body })
    }
}

fn method_for(op: &S3Op) -> Method {
    match op {
        S3Op::ListBuckets | S3Op::ListObjects | S3Op::GetObject => Method::GET,
        S3Op::HeadBucket | S3Op::HeadObject => Method::HEAD,
        S3Op::CreateBucket
        | S3Op::PutObject
        | S3Op::CopyObject { .. }
        | S3Op::UploadPart { .. }
        | S3Op::UploadPartCopy { .. } => Method::PUT,
        S3Op::DeleteBucket | S3Op::DeleteObject | S3Op::AbortMultipartUpload { .. } => Method::DELETE,
        S3Op::DeleteObjects | S3Op::CreateMultipartUpload | S3Op::CompleteMultipartUpload { .. } => {
            Method::POST
        }
    }
}

fn host_header(url: &reqwest::Url) -> HeraldResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| HeraldError::internal(std::io::Error::other("backend endpoint has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

/// Encodes the query exactly the way the canonical form does, so the
/// signature covers the bytes on the wire.
fn build_url(endpoint: &str, uri_path: &str, query: &[(String, String)]) -> String {
    let mut url = format!("{endpoint}{uri_path}");
    for (i, (name, value)) in query.iter().enumerate() {
        url.push(if i == 0 { '?' } else { '&' });
        url.push_str(&sig_v4::uri_encode(name, true));
        url.push('=');
        url.push_str(&sig_v4::uri_encode(value, true));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_mapping() {
        assert_eq!(method_for(&S3Op::GetObject), Method::GET);
        assert_eq!(method_for(&S3Op::DeleteObjects), Method::POST);
        assert_eq!(
            method_for(&S3Op::UploadPart { upload_id: "u".to_owned(), part_number: 1 }),
            Method::PUT
        );
    }

    #[test]
    fn url_encoding_matches_canonical_form() {
        let query = vec![("delete".to_owned(), String::new()), ("prefix".to_owned(), "a b".to_owned())];
        let url = build_url("http://minio:9000", "/photos/a.txt", &query);
        assert_eq!(url, "http://minio:9000/photos/a.txt?delete=&prefix=a%20b");
    }

    #[test]
    fn host_header_keeps_explicit_port() {
        let url = reqwest::Url::parse("http://minio:9000").unwrap();
        assert_eq!(host_header(&url).unwrap(), "minio:9000");
        let url = reqwest::Url::parse("https://s3.example.com").unwrap();
        assert_eq!(host_header(&url).unwrap(), "s3.example.com");
    }
}
