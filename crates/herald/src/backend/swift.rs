//! Swift resolver.
//!
//! Translates the S3 verb set onto Swift's REST dialect. Multipart uploads
//! have no native Swift counterpart, so an index object inside the container
//! tracks every ongoing upload; its updates go through an optimistic
//! read-modify-write on the object ETag. Completed uploads become Static
//! Large Object manifests over the uploaded part segments.

use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::SwiftBackendConfig;
use crate::error::{HeraldError, HeraldResult};
use crate::header;
use crate::keystone::{SwiftAuthMeta, TokenStore};
use crate::meta::QueryMap;
use crate::sig_v4::uri_encode;
use crate::utils::hex_md5;
use crate::xml;

use super::{BackendResponse, ProxiedRequest, S3Op, relay_response_headers, retry_request};

/// Swift rejects single objects above 5 GiB; larger payloads are segmented.
pub const SEGMENT_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;

/// Registry of ongoing multipart uploads, one object per container.
pub const MULTIPART_INDEX_KEY: &str = ".herald-state/multipart-uploads/index.json";
const MULTIPART_PARTS_PREFIX: &str = ".herald-state/multipart-parts";

/// Attempts for the optimistic index update before giving up.
const INDEX_UPDATE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartUploadIndex {
    pub last_updated: String,
    pub uploads: Vec<MultipartUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartUpload {
    pub upload_id: String,
    pub key: String,
    pub parts: Vec<PartRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// One entry of a Swift account listing (`GET /v1/AUTH_x?format=json`).
#[derive(Debug, Clone, Deserialize)]
struct SwiftContainer {
    name: String,
    #[serde(default)]
    last_modified: Option<String>,
}

/// One entry of a container listing (`GET /v1/AUTH_x/container?format=json`).
#[derive(Debug, Clone, Deserialize)]
struct SwiftObject {
    name: String,
    bytes: u64,
    hash: String,
    last_modified: String,
}

/// One segment reference in an SLO manifest.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct SloSegment {
    path: String,
    etag: String,
    size_bytes: u64,
}

#[derive(Clone)]
pub struct SwiftResolver {
    client: reqwest::Client,
}

impl SwiftResolver {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn execute(
        &self,
        tokens: &TokenStore,
        config: &SwiftBackendConfig,
        bucket: &str,
        op: &S3Op,
        request: &ProxiedRequest,
        body: Bytes,
    ) -> HeraldResult<BackendResponse> {
        let auth = tokens.auth_meta_for(config);
        match op {
            S3Op::ListBuckets => self.list_buckets(&auth).await,
            S3Op::ListObjects => self.list_objects(&auth, bucket, request).await,
            S3Op::CreateBucket => self.create_container(&auth, bucket).await,
            S3Op::DeleteBucket => self.passthrough(&auth, Method::DELETE, &container_url(&auth, bucket), request).await,
            S3Op::HeadBucket => self.head_container(&auth, bucket).await,
            S3Op::GetObject => {
                let url = object_url(&auth, bucket, required_key(request)?);
                self.passthrough(&auth, Method::GET, &url, request).await
            }
            S3Op::HeadObject => {
                let url = object_url(&auth, bucket, required_key(request)?);
                self.passthrough(&auth, Method::HEAD, &url, request).await
            }
            S3Op::DeleteObject => {
                let url = object_url(&auth, bucket, required_key(request)?);
                self.passthrough(&auth, Method::DELETE, &url, request).await
            }
            S3Op::PutObject => self.put_object(&auth, bucket, required_key(request)?, request, body).await,
            S3Op::CopyObject { source } => {
                self.copy_object(&auth, bucket, required_key(request)?, &source.bucket, &source.key).await
            }
            S3Op::DeleteObjects => self.delete_objects(&auth, bucket, &body).await,
            S3Op::CreateMultipartUpload => {
                self.create_multipart_upload(&auth, bucket, required_key(request)?).await
            }
            S3Op::UploadPart { upload_id, part_number } => {
                self.upload_part(&auth, bucket, upload_id, *part_number, body).await
            }
            S3Op::UploadPartCopy { upload_id, part_number, source, range } => {
                self.upload_part_copy(&auth, bucket, upload_id, *part_number, source, range.as_deref())
                    .await
            }
            S3Op::CompleteMultipartUpload { upload_id } => {
                self.complete_multipart_upload(&auth, bucket, required_key(request)?, upload_id).await
            }
            S3Op::AbortMultipartUpload { upload_id } => {
                self.abort_multipart_upload(&auth, bucket, upload_id).await
            }
        }
    }

    fn authed(&self, method: Method, url: &str, auth: &SwiftAuthMeta) -> reqwest::RequestBuilder {
        self.client.request(method, url).header(header::X_AUTH_TOKEN, &auth.token)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> HeraldResult<reqwest::Response> {
        retry_request(|| async {
            let builder = builder
                .try_clone()
                .ok_or_else(|| HeraldError::internal(std::io::Error::other("unclonable swift request")))?;
            Ok(builder.send().await?)
        })
        .await
    }

    /// Plain verb translation with header mapping, no body rewriting.
    async fn passthrough(
        &self,
        auth: &SwiftAuthMeta,
        method: Method,
        url: &str,
        request: &ProxiedRequest,
    ) -> HeraldResult<BackendResponse> {
        let mut builder = self.authed(method, url, auth);
        if let Some(range) = request.header(header::RANGE) {
            builder = builder.header(header::RANGE, range);
        }
        let response = self.send(builder).await?;
        let status = map_create_status(response.status());
        let headers = translate_swift_headers(response.headers());
        let body = response.bytes().await?;
        Ok(BackendResponse { status, headers, body })
    }

    async fn list_buckets(&self, auth: &SwiftAuthMeta) -> HeraldResult<BackendResponse> {
        let url = format!("{}?format=json", auth.storage_url);
        let response = self.send(self.authed(Method::GET, &url, auth)).await?;
        if !response.status().is_success() {
            return relay_error(response).await;
        }
        let containers: Vec<SwiftContainer> = response.json().await?;
        let listing = account_to_bucket_list(&containers);
        Ok(BackendResponse::xml(StatusCode::OK, xml::to_xml(&listing)?))
    }

    async fn list_objects(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        request: &ProxiedRequest,
    ) -> HeraldResult<BackendResponse> {
        let mut url = format!("{}?format=json", container_url(auth, bucket));
        let query: QueryMap = request
            .query
            .iter()
            .fold(QueryMap::new(), |mut acc, (name, value)| {
                acc.entry(name.clone()).or_default().push(value.clone());
                acc
            });
        if let Some(prefix) = query.get("prefix").and_then(|v| v.first()) {
            url.push_str(&format!("&prefix={}", uri_encode(prefix, true)));
        }
        let max_keys: u64 = query
            .get("max-keys")
            .and_then(|v| v.first())
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);
        url.push_str(&format!("&limit={max_keys}"));

        let response = self.send(self.authed(Method::GET, &url, auth)).await?;
        if !response.status().is_success() {
            return relay_error(response).await;
        }
        let objects: Vec<SwiftObject> = response.json().await?;
        let prefix = query
            .get("prefix")
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_default();
        let listing = container_to_object_list(bucket, &prefix, max_keys, &objects);
        Ok(BackendResponse::xml(StatusCode::OK, xml::to_xml(&listing)?))
    }

    async fn create_container(&self, auth: &SwiftAuthMeta, bucket: &str) -> HeraldResult<BackendResponse> {
        let response = self
            .send(self.authed(Method::PUT, &container_url(auth, bucket), auth))
            .await?;
        // Swift answers container creation with 201 (or 202 when it already
        // exists); S3 clients expect a plain 200.
        Ok(BackendResponse::empty(map_create_status(response.status())))
    }

    async fn head_container(&self, auth: &SwiftAuthMeta, bucket: &str) -> HeraldResult<BackendResponse> {
        let response = self
            .send(self.authed(Method::HEAD, &container_url(auth, bucket), auth))
            .await?;
        let status = if response.status().is_success() {
            StatusCode::OK
        } else {
            response.status()
        };
        Ok(BackendResponse::empty(status))
    }

    async fn put_object(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        key: &str,
        request: &ProxiedRequest,
        body: Bytes,
    ) -> HeraldResult<BackendResponse> {
        if body.len() as u64 > SEGMENT_THRESHOLD {
            return self.put_object_segmented(auth, bucket, key, request, body).await;
        }

        let etag = hex_md5(&body);
        let mut builder = self
            .authed(Method::PUT, &object_url(auth, bucket, key), auth)
            .body(body);
        if let Some(content_type) = request.content_type() {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        let response = self.send(builder).await?;
        if !response.status().is_success() {
            return relay_error(response).await;
        }
        let mut out = BackendResponse::empty(StatusCode::OK);
        set_etag(&mut out.headers, &etag);
        Ok(out)
    }

    /// Oversized payloads become a Dynamic Large Object: numbered segments in
    /// the side container plus a zero byte manifest pointing at their prefix.
    async fn put_object_segmented(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        key: &str,
        request: &ProxiedRequest,
        body: Bytes,
    ) -> HeraldResult<BackendResponse> {
        let etag = hex_md5(&body);
        let upload_id = uuid::Uuid::new_v4().to_string();
        let segment_container = format!("{bucket}_segments");
        self.send(self.authed(Method::PUT, &container_url(auth, &segment_container), auth))
            .await?;

        let threshold = usize::try_from(SEGMENT_THRESHOLD).unwrap_or(usize::MAX);
        let mut offset = 0usize;
        let mut segment_number = 0u32;
        while offset < body.len() {
            let end = usize::min(offset + threshold, body.len());
            let segment = body.slice(offset..end);
            let segment_key = format!("{key}/{upload_id}/{segment_number:08}");
            let url = object_url(auth, &segment_container, &segment_key);
            let response = self.send(self.authed(Method::PUT, &url, auth).body(segment)).await?;
            if !response.status().is_success() {
                return relay_error(response).await;
            }
            offset = end;
            segment_number += 1;
        }

        let manifest_prefix = format!("{segment_container}/{key}/{upload_id}/");
        let mut builder = self
            .authed(Method::PUT, &object_url(auth, bucket, key), auth)
            .header(header::X_OBJECT_MANIFEST, &manifest_prefix)
            .body(Bytes::new());
        if let Some(content_type) = request.content_type() {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        let response = self.send(builder).await?;
        if !response.status().is_success() {
            return relay_error(response).await;
        }
        let mut out = BackendResponse::empty(StatusCode::OK);
        set_etag(&mut out.headers, &etag);
        Ok(out)
    }

    async fn copy_object(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        key: &str,
        source_bucket: &str,
        source_key: &str,
    ) -> HeraldResult<BackendResponse> {
        let copy_from = format!("/{source_bucket}/{}", uri_encode(source_key, false));
        let builder = self
            .authed(Method::PUT, &object_url(auth, bucket, key), auth)
            .header(header::X_COPY_FROM, &copy_from)
            .body(Bytes::new());
        let response = self.send(builder).await?;
        if !response.status().is_success() {
            return relay_error(response).await;
        }
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_owned();
        let result = xml::CopyObjectResult {
            etag: quote_etag(&etag),
            last_modified: now_iso8601(),
        };
        Ok(BackendResponse::xml(StatusCode::OK, xml::to_xml(&result)?))
    }

    /// Bulk delete is emulated with one DELETE per object; partial failures
    /// are reported per key in the aggregate document.
    async fn delete_objects(&self, auth: &SwiftAuthMeta, bucket: &str, body: &Bytes) -> HeraldResult<BackendResponse> {
        let raw = std::str::from_utf8(body).map_err(|_| invalid_request!("delete body is not utf-8"))?;
        let request: xml::DeleteRequest = xml::from_xml(raw)?;

        let mut result = xml::DeleteResult::default();
        for object in &request.objects {
            let url = object_url(auth, bucket, &object.key);
            match self.send(self.authed(Method::DELETE, &url, auth)).await {
                Ok(response) if response.status().is_success() || response.status() == StatusCode::NOT_FOUND => {
                    result.deleted.push(xml::DeletedObject { key: object.key.clone() });
                }
                Ok(response) => result.errors.push(xml::DeleteErrorEntry {
                    key: object.key.clone(),
                    code: "InternalError".to_owned(),
                    message: format!("backend returned {}", response.status()),
                }),
                Err(err) => result.errors.push(xml::DeleteErrorEntry {
                    key: object.key.clone(),
                    code: "InternalError".to_owned(),
                    message: err.to_string(),
                }),
            }
        }
        Ok(BackendResponse::xml(StatusCode::OK, xml::to_xml(&result)?))
    }

    async fn create_multipart_upload(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        key: &str,
    ) -> HeraldResult<BackendResponse> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        let entry = MultipartUpload {
            upload_id: upload_id.clone(),
            key: key.to_owned(),
            parts: Vec::new(),
        };
        self.update_index(auth, bucket, move |index| {
            index.uploads.push(entry.clone());
        })
        .await?;

        let result = xml::InitiateMultipartUploadResult {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            upload_id,
        };
        Ok(BackendResponse::xml(StatusCode::OK, xml::to_xml(&result)?))
    }

    async fn upload_part(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> HeraldResult<BackendResponse> {
        let etag = hex_md5(&body);
        let size = body.len() as u64;
        let url = object_url(auth, bucket, &part_object_key(upload_id, part_number));
        let response = self.send(self.authed(Method::PUT, &url, auth).body(body)).await?;
        if !response.status().is_success() {
            return relay_error(response).await;
        }

        let recorded_etag = etag.clone();
        let upload_id = upload_id.to_owned();
        let updated = self
            .update_index(auth, bucket, move |index| {
                record_part(index, &upload_id, part_number, &recorded_etag, size)
            })
            .await?;
        if !updated {
            return Err(herald_error!(NoSuchUpload, "upload is not in the multipart index"));
        }

        let mut out = BackendResponse::empty(StatusCode::OK);
        set_etag(&mut out.headers, &etag);
        Ok(out)
    }

    async fn upload_part_copy(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        upload_id: &str,
        part_number: u32,
        source: &super::CopySource,
        range: Option<&str>,
    ) -> HeraldResult<BackendResponse> {
        let part_key = part_object_key(upload_id, part_number);

        let copied = if let Some(range) = range {
            self.range_copy_or_fallback(auth, bucket, &part_key, source, range).await?
        } else {
            let copy_from = format!("/{}/{}", source.bucket, uri_encode(&source.key, false));
            let builder = self
                .authed(Method::PUT, &object_url(auth, bucket, &part_key), auth)
                .header(header::X_COPY_FROM, &copy_from)
                .body(Bytes::new());
            let response = self.send(builder).await?;
            if !response.status().is_success() {
                return relay_error(response).await;
            }
            self.stat_object(auth, bucket, &part_key).await?
        };

        let (etag, size) = copied;
        let recorded_etag = etag.clone();
        let upload_id = upload_id.to_owned();
        let updated = self
            .update_index(auth, bucket, move |index| {
                record_part(index, &upload_id, part_number, &recorded_etag, size)
            })
            .await?;
        if !updated {
            return Err(herald_error!(NoSuchUpload, "upload is not in the multipart index"));
        }

        let result = xml::CopyPartResult {
            etag: quote_etag(&etag),
            last_modified: now_iso8601(),
        };
        Ok(BackendResponse::xml(StatusCode::OK, xml::to_xml(&result)?))
    }

    /// Range copies first go through Swift's server side copy; clusters that
    /// reject the range variant get the slice streamed through the proxy.
    async fn range_copy_or_fallback(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        part_key: &str,
        source: &super::CopySource,
        range: &str,
    ) -> HeraldResult<(String, u64)> {
        let copy_from = format!("/{}/{}", source.bucket, uri_encode(&source.key, false));
        let builder = self
            .authed(Method::PUT, &object_url(auth, bucket, part_key), auth)
            .header(header::X_COPY_FROM, &copy_from)
            .header(header::X_COPY_FROM_RANGE, copy_range_to_http_range(range))
            .body(Bytes::new());
        let response = self.send(builder).await?;
        if response.status().is_success() {
            return self.stat_object(auth, bucket, part_key).await;
        }
        if response.status().is_server_error() {
            return relay_error_value(response).await;
        }

        let source_url = object_url(auth, &source.bucket, &source.key);
        let get = self
            .authed(Method::GET, &source_url, auth)
            .header(header::RANGE, copy_range_to_http_range(range));
        let response = self.send(get).await?;
        if !response.status().is_success() {
            return relay_error_value(response).await;
        }
        let slice = response.bytes().await?;
        let etag = hex_md5(&slice);
        let size = slice.len() as u64;
        let put = self
            .authed(Method::PUT, &object_url(auth, bucket, part_key), auth)
            .body(slice);
        let response = self.send(put).await?;
        if !response.status().is_success() {
            return relay_error_value(response).await;
        }
        Ok((etag, size))
    }

    async fn stat_object(&self, auth: &SwiftAuthMeta, bucket: &str, key: &str) -> HeraldResult<(String, u64)> {
        let response = self
            .send(self.authed(Method::HEAD, &object_url(auth, bucket, key), auth))
            .await?;
        if !response.status().is_success() {
            return relay_error_value(response).await;
        }
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_owned();
        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok((etag, size))
    }

    async fn complete_multipart_upload(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> HeraldResult<BackendResponse> {
        let (index, _) = self.load_index(auth, bucket).await?;
        let Some(upload) = index.uploads.iter().find(|u| u.upload_id == upload_id) else {
            return Err(herald_error!(NoSuchUpload, "upload is not in the multipart index"));
        };

        let manifest = build_slo_manifest(bucket, upload_id, &upload.parts);
        let manifest_body = serde_json::to_vec(&manifest).map_err(HeraldError::internal)?;
        let etag = multipart_etag(&upload.parts);

        let url = format!("{}?multipart-manifest=put", object_url(auth, bucket, key));
        let response = self
            .send(self.authed(Method::PUT, &url, auth).body(manifest_body))
            .await?;
        if !response.status().is_success() {
            return relay_error(response).await;
        }

        // The manifest references the part segments, so they stay; only the
        // index entry is retired.
        let upload_id = upload_id.to_owned();
        self.update_index(auth, bucket, move |index| {
            index.uploads.retain(|u| u.upload_id != upload_id);
        })
        .await?;

        let result = xml::CompleteMultipartUploadResult {
            location: format!("/{bucket}/{key}"),
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            etag,
        };
        Ok(BackendResponse::xml(StatusCode::OK, xml::to_xml(&result)?))
    }

    async fn abort_multipart_upload(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        upload_id: &str,
    ) -> HeraldResult<BackendResponse> {
        let (index, _) = self.load_index(auth, bucket).await?;
        if let Some(upload) = index.uploads.iter().find(|u| u.upload_id == upload_id) {
            for part in &upload.parts {
                let url = object_url(auth, bucket, &part_object_key(upload_id, part.part_number));
                // Aborting twice must succeed, so a vanished part is fine.
                let _ = self.send(self.authed(Method::DELETE, &url, auth)).await;
            }
            let upload_id = upload_id.to_owned();
            self.update_index(auth, bucket, move |index| {
                index.uploads.retain(|u| u.upload_id != upload_id);
            })
            .await?;
        }
        Ok(BackendResponse::empty(StatusCode::NO_CONTENT))
    }

    async fn load_index(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
    ) -> HeraldResult<(MultipartUploadIndex, Option<String>)> {
        let url = object_url(auth, bucket, MULTIPART_INDEX_KEY);
        let response = self.send(self.authed(Method::GET, &url, auth)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok((MultipartUploadIndex::default(), None));
        }
        if !response.status().is_success() {
            return relay_error_value(response).await;
        }
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_owned());
        let index = response.json().await?;
        Ok((index, etag))
    }

    /// Read-modify-write on the index object under `If-Match`, retried on 412.
    /// Returns the closure's result from the attempt that committed.
    async fn update_index<R>(
        &self,
        auth: &SwiftAuthMeta,
        bucket: &str,
        mutate: impl Fn(&mut MultipartUploadIndex) -> R,
    ) -> HeraldResult<R> {
        let url = object_url(auth, bucket, MULTIPART_INDEX_KEY);
        for attempt in 1..=INDEX_UPDATE_ATTEMPTS {
            let (mut index, etag) = self.load_index(auth, bucket).await?;
            let outcome = mutate(&mut index);
            index.last_updated = now_iso8601();

            let body = serde_json::to_vec(&index).map_err(HeraldError::internal)?;
            let mut builder = self.authed(Method::PUT, &url, auth).body(body);
            builder = match etag {
                Some(ref etag) => builder.header("if-match", etag),
                None => builder.header("if-none-match", "*"),
            };
            let response = self.send(builder).await?;
            if response.status() == StatusCode::PRECONDITION_FAILED {
                tracing::debug!(bucket, attempt, "multipart index conflicted, retrying");
                continue;
            }
            if !response.status().is_success() {
                return relay_error_value(response).await;
            }
            return Ok(outcome);
        }
        Err(herald_error!(
            PreconditionFailed,
            "multipart index update kept conflicting after {INDEX_UPDATE_ATTEMPTS} attempts"
        ))
    }
}

fn required_key(request: &ProxiedRequest) -> HeraldResult<&str> {
    request
        .object_key
        .as_deref()
        .ok_or_else(|| invalid_request!("operation requires an object key"))
}

fn container_url(auth: &SwiftAuthMeta, bucket: &str) -> String {
    format!("{}/{}", auth.storage_url.trim_end_matches('/'), uri_encode(bucket, true))
}

fn object_url(auth: &SwiftAuthMeta, bucket: &str, key: &str) -> String {
    format!("{}/{}", container_url(auth, bucket), uri_encode(key, false))
}

fn part_object_key(upload_id: &str, part_number: u32) -> String {
    format!("{MULTIPART_PARTS_PREFIX}/{upload_id}/{part_number}")
}

/// `bytes=a-b` in S3's copy-source-range; Swift takes the same shape.
fn copy_range_to_http_range(range: &str) -> String {
    if range.starts_with("bytes=") {
        range.to_owned()
    } else {
        format!("bytes={range}")
    }
}

fn quote_etag(etag: &str) -> String {
    format!("\"{etag}\"")
}

fn set_etag(headers: &mut HeaderMap, etag: &str) {
    if let Ok(value) = hyper::header::HeaderValue::from_str(&quote_etag(etag)) {
        headers.insert(header::ETAG, value);
    }
}

/// Swift reports unquoted md5 etags; S3 clients expect quotes.
fn translate_swift_headers(from: &HeaderMap) -> HeaderMap {
    let mut headers = relay_response_headers(from);
    if let Some(etag) = from.get(header::ETAG).and_then(|v| v.to_str().ok()) {
        if !etag.starts_with('"') {
            if let Ok(value) = hyper::header::HeaderValue::from_str(&quote_etag(etag)) {
                headers.insert(header::ETAG, value);
            }
        }
    }
    headers
}

fn map_create_status(status: StatusCode) -> StatusCode {
    match status {
        StatusCode::CREATED | StatusCode::ACCEPTED => StatusCode::OK,
        other => other,
    }
}

fn record_part(index: &mut MultipartUploadIndex, upload_id: &str, part_number: u32, etag: &str, size: u64) -> bool {
    let Some(upload) = index.uploads.iter_mut().find(|u| u.upload_id == upload_id) else {
        return false;
    };
    let record = PartRecord {
        part_number,
        etag: etag.to_owned(),
        size,
    };
    match upload.parts.iter_mut().find(|p| p.part_number == part_number) {
        Some(existing) => *existing = record,
        None => upload.parts.push(record),
    }
    true
}

fn build_slo_manifest(bucket: &str, upload_id: &str, parts: &[PartRecord]) -> Vec<SloSegment> {
    let mut ordered: Vec<&PartRecord> = parts.iter().collect();
    ordered.sort_by_key(|p| p.part_number);
    ordered
        .into_iter()
        .map(|part| SloSegment {
            path: format!("/{bucket}/{}", part_object_key(upload_id, part.part_number)),
            etag: part.etag.clone(),
            size_bytes: part.size,
        })
        .collect()
}

/// S3 multipart etags are `md5(concat(part_md5s))-N`.
fn multipart_etag(parts: &[PartRecord]) -> String {
    let mut ordered: Vec<&PartRecord> = parts.iter().collect();
    ordered.sort_by_key(|p| p.part_number);
    let mut digest_input = Vec::with_capacity(ordered.len() * 16);
    for part in &ordered {
        if let Ok(bytes) = hex_simd::decode_to_vec(part.etag.as_bytes()) {
            digest_input.extend_from_slice(&bytes);
        }
    }
    quote_etag(&format!("{}-{}", hex_md5(&digest_input), ordered.len()))
}

fn account_to_bucket_list(containers: &[SwiftContainer]) -> xml::ListAllMyBucketsResult {
    xml::ListAllMyBucketsResult {
        owner: xml::Owner {
            id: "herald".to_owned(),
            display_name: "herald".to_owned(),
        },
        buckets: xml::Buckets {
            bucket: containers
                .iter()
                .map(|c| xml::BucketEntry {
                    name: c.name.clone(),
                    creation_date: c.last_modified.clone().unwrap_or_else(now_iso8601),
                })
                .collect(),
        },
    }
}

fn container_to_object_list(
    bucket: &str,
    prefix: &str,
    max_keys: u64,
    objects: &[SwiftObject],
) -> xml::ListBucketResult {
    let contents: Vec<xml::ObjectEntry> = objects
        .iter()
        .map(|o| xml::ObjectEntry {
            key: o.name.clone(),
            last_modified: o.last_modified.clone(),
            etag: quote_etag(&o.hash),
            size: o.bytes,
            storage_class: "STANDARD".to_owned(),
        })
        .collect();
    xml::ListBucketResult {
        name: bucket.to_owned(),
        prefix: prefix.to_owned(),
        key_count: contents.len() as u64,
        max_keys,
        is_truncated: false,
        contents,
    }
}

fn now_iso8601() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

async fn relay_error(response: reqwest::Response) -> HeraldResult<BackendResponse> {
    let status = response.status();
    let headers = translate_swift_headers(response.headers());
    let body = response.bytes().await?;
    Ok(BackendResponse { status, headers, body })
}

async fn relay_error_value<T>(response: reqwest::Response) -> HeraldResult<T> {
    let status = response.status();
    let mut err = herald_error!(ServiceUnavailable, "swift backend returned {status}");
    if status.is_client_error() {
        err = match status {
            StatusCode::NOT_FOUND => herald_error!(NoSuchKey, "swift backend returned {status}"),
            _ => invalid_request!("swift backend returned {status}"),
        };
    }
    err.set_origin(crate::error::ErrorSource::Backend);
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> Vec<PartRecord> {
        vec![
            PartRecord { part_number: 2, etag: "b".repeat(32), size: 5 },
            PartRecord { part_number: 1, etag: "a".repeat(32), size: 7 },
        ]
    }

    #[test]
    fn slo_manifest_is_in_part_number_order() {
        let manifest = build_slo_manifest("photos", "u-1", &parts());
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].path, "/photos/.herald-state/multipart-parts/u-1/1");
        assert_eq!(manifest[0].size_bytes, 7);
        assert_eq!(manifest[1].path, "/photos/.herald-state/multipart-parts/u-1/2");
    }

    #[test]
    fn multipart_etag_has_part_count_suffix() {
        let etag = multipart_etag(&parts());
        assert!(etag.starts_with('"'));
        assert!(etag.ends_with("-2\""));
    }

    #[test]
    fn record_part_replaces_same_number() {
        let mut index = MultipartUploadIndex::default();
        index.uploads.push(MultipartUpload {
            upload_id: "u-1".to_owned(),
            key: "k".to_owned(),
            parts: Vec::new(),
        });
        assert!(record_part(&mut index, "u-1", 1, "etag-a", 10));
        assert!(record_part(&mut index, "u-1", 1, "etag-b", 12));
        assert_eq!(index.uploads[0].parts.len(), 1);
        assert_eq!(index.uploads[0].parts[0].etag, "etag-b");
        assert!(!record_part(&mut index, "ghost", 1, "etag", 1));
    }

    #[test]
    fn create_status_mapping() {
        assert_eq!(map_create_status(StatusCode::CREATED), StatusCode::OK);
        assert_eq!(map_create_status(StatusCode::ACCEPTED), StatusCode::OK);
        assert_eq!(map_create_status(StatusCode::NOT_FOUND), StatusCode::NOT_FOUND);
    }

    #[test]
    fn object_urls_are_percent_encoded() {
        let auth = SwiftAuthMeta {
            token: "t".to_owned(),
            storage_url: "http://swift/v1/AUTH_abc".to_owned(),
        };
        assert_eq!(
            object_url(&auth, "photos", "a b/c.txt"),
            "http://swift/v1/AUTH_abc/photos/a%20b/c.txt"
        );
    }

    #[test]
    fn range_shapes() {
        assert_eq!(copy_range_to_http_range("bytes=0-99"), "bytes=0-99");
        assert_eq!(copy_range_to_http_range("0-99"), "bytes=0-99");
    }

    #[test]
    fn listing_translation() {
        let objects = vec![SwiftObject {
            name: "cats/tabby.jpg".to_owned(),
            bytes: 1024,
            hash: "d41d8cd98f00b204e9800998ecf8427e".to_owned(),
            last_modified: "2026-01-01T00:00:00Z".to_owned(),
        }];
        let listing = container_to_object_list("photos", "cats/", 1000, &objects);
        assert_eq!(listing.key_count, 1);
        assert_eq!(listing.contents[0].etag, "\"d41d8cd98f00b204e9800998ecf8427e\"");

        let containers = vec![SwiftContainer { name: "photos".to_owned(), last_modified: None }];
        let buckets = account_to_bucket_list(&containers);
        assert_eq!(buckets.buckets.bucket[0].name, "photos");
        assert_eq!(buckets.owner.id, "herald");
    }
}
