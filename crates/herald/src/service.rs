//! Front door.
//!
//! `HeraldService` is the hyper/tower service the listener drives. It owns
//! the whole per request pipeline: CORS, health check, request resolution,
//! signature or token verification, the bucket ACL, dispatch to the primary
//! backend and the mirror fan out. Errors anywhere short circuit into the
//! S3 XML rendering with CORS headers preserved.

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt as _, Full};
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Method, StatusCode, Uri};
use uuid::Uuid;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::auth::{ServiceAccountVerifier, StaticAuth, check_bucket_acl};
use crate::backend::{BackendResponse, ProxiedRequest, Resolvers, S3Op};
use crate::config::{AuthType, GlobalConfig, Registry};
use crate::cors::CorsPolicy;
use crate::error::{HeraldError, HeraldResult};
use crate::header;
use crate::keystone::TokenStore;
use crate::meta::RequestMeta;
use crate::mirror::MirrorEngine;
use crate::sig_v4;
use crate::task_store::StorageLocks;

pub type HttpRequest = http::Request<hyper::body::Incoming>;
pub type HttpResponse = http::Response<Full<Bytes>>;

/// Remote peer address, injected into request extensions by the listener.
#[derive(Debug, Clone, Copy)]
pub struct RemoteAddr(pub IpAddr);

/// Process wide collaborators, injected explicitly instead of read from
/// globals.
pub struct HeraldContext {
    pub config: GlobalConfig,
    pub registry: Registry,
    pub tokens: Arc<TokenStore>,
    pub engine: Arc<MirrorEngine>,
    pub locks: StorageLocks,
    pub resolvers: Resolvers,
}

/// Per request values: the id tags every log line and is echoed to clients.
struct RequestContext {
    request_id: Uuid,
    origin: Option<String>,
}

pub struct HeraldServiceBuilder {
    ctx: HeraldContext,
    service_accounts: Option<ServiceAccountVerifier>,
}

impl HeraldServiceBuilder {
    #[must_use]
    pub fn new(ctx: HeraldContext) -> Self {
        Self {
            ctx,
            service_accounts: None,
        }
    }

    pub fn set_service_account_verifier(&mut self, verifier: ServiceAccountVerifier) {
        self.service_accounts = Some(verifier);
    }

    #[must_use]
    pub fn build(self) -> HeraldService {
        let cors = CorsPolicy::new(self.ctx.config.cors.host.clone());
        let auth = build_credential_table(&self.ctx.config);
        HeraldService {
            inner: Arc::new(Inner {
                ctx: self.ctx,
                cors,
                auth,
                service_accounts: self.service_accounts,
            }),
        }
    }
}

/// Clients of `default` auth sign with the credentials of the configured S3
/// backends, so the table is derived from the backend list.
fn build_credential_table(config: &GlobalConfig) -> StaticAuth {
    let mut auth = StaticAuth::new();
    for backend in &config.backends {
        if let crate::config::BackendConfig::S3(ref s3) = backend.config {
            auth.register(
                s3.credentials.access_key_id.clone(),
                crate::auth::SecretKey::from(s3.credentials.secret_access_key.clone()),
            );
        }
    }
    auth
}

#[derive(Clone)]
pub struct HeraldService {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: HeraldContext,
    cors: CorsPolicy,
    auth: StaticAuth,
    service_accounts: Option<ServiceAccountVerifier>,
}

impl HeraldService {
    /// Entry point for one request. Never fails; every error becomes an S3
    /// XML response.
    pub async fn call(&self, req: HttpRequest) -> HttpResponse {
        use tracing::Instrument as _;

        let rcx = RequestContext {
            request_id: Uuid::new_v4(),
            origin: header_str(req.headers(), "origin").map(str::to_owned),
        };
        let span = tracing::info_span!("request", id = %rcx.request_id);
        self.handle(rcx, req).instrument(span).await
    }

    async fn handle(&self, rcx: RequestContext, req: HttpRequest) -> HttpResponse {
        if req.method() == Method::OPTIONS {
            return self.preflight(&rcx, req.headers());
        }
        if req.uri().path() == "/health-check" {
            return plain_response(StatusCode::OK, "Ok");
        }

        let remote_ip = req.extensions().get::<RemoteAddr>().map(|addr| addr.0);
        match self.resolve(&rcx, req, remote_ip).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "request failed");
                self.error_response(&rcx, &err)
            }
        }
    }

    fn preflight(&self, rcx: &RequestContext, headers: &HeaderMap) -> HttpResponse {
        let requested = header_str(headers, "access-control-request-headers");
        let cors = self.inner.cors.preflight_headers(rcx.origin.as_deref(), requested);
        let mut response = plain_response(StatusCode::OK, "");
        response.headers_mut().extend(cors);
        response
    }

    /// The resolution pipeline: meta, auth, ACL, primary dispatch, mirror
    /// fan out.
    async fn resolve(
        &self,
        rcx: &RequestContext,
        req: HttpRequest,
        remote_ip: Option<IpAddr>,
    ) -> HeraldResult<HttpResponse> {
        let inner = &self.inner;
        let (parts, incoming) = req.into_parts();

        let host = header_str(&parts.headers, header::HOST);
        let meta = RequestMeta::extract(
            &parts.method,
            &parts.uri,
            host,
            &inner.ctx.config.virtual_host_aliases,
        )?;

        let bucket_name = meta
            .bucket
            .clone()
            .or_else(|| inner.ctx.config.default_bucket.clone())
            .ok_or_else(|| invalid_request!("request names no bucket and no default bucket is set"))?;
        let bucket = inner
            .ctx
            .registry
            .get(&bucket_name)
            .ok_or_else(|| herald_error!(NoSuchBucket, "bucket {bucket_name} is not configured"))?
            .clone();

        self.check_auth(&parts.method, &parts.uri, &parts.headers, remote_ip, &bucket_name)
            .await?;

        let op = S3Op::classify(&meta, &parts.headers)?;
        let body = incoming
            .collect()
            .await
            .map_err(|e| invalid_request!("failed to read request body: {e}"))?
            .to_bytes();

        let request = ProxiedRequest::from_parts(&meta, &parts.headers);
        let response = inner
            .ctx
            .resolvers
            .execute(
                &inner.ctx.tokens,
                &bucket.backend.config,
                &bucket.name,
                &op,
                &request,
                body.clone(),
            )
            .await?;

        tracing::debug!(
            bucket = %bucket.name,
            op = ?op,
            status = %response.status,
            "primary backend answered"
        );

        // The client's write is durable on the primary at this point;
        // replicas catch up asynchronously.
        if response.is_success() && op.is_mirrored() {
            inner.ctx.engine.enqueue_mirrors(&bucket, &op, &request, &body).await;
        }

        Ok(self.client_response(rcx, response))
    }

    async fn check_auth(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        remote_ip: Option<IpAddr>,
        bucket: &str,
    ) -> HeraldResult {
        let inner = &self.inner;

        // Loopback traffic from trusted peers self signs with an unsigned
        // payload marker; the CIDR list is the actual gate.
        let unsigned = header_str(headers, header::X_AMZ_CONTENT_SHA256) == Some(header::UNSIGNED_PAYLOAD);
        if unsigned
            && let Some(ip) = remote_ip
            && inner.ctx.config.is_trusted_ip(ip)
        {
            tracing::debug!(%ip, "trusted peer, signature check skipped");
            return Ok(());
        }

        match inner.ctx.config.auth_type {
            AuthType::None => Ok(()),
            AuthType::Default => {
                let query: Vec<(String, String)> = match uri.query() {
                    Some(raw) => serde_urlencoded::from_str(raw)
                        .map_err(|_| herald_error!(InvalidURI, "query string is not decodable"))?,
                    None => Vec::new(),
                };
                let ctx = sig_v4::VerifyContext {
                    method,
                    uri_path: uri.path(),
                    query: &query,
                    headers,
                    now: time::OffsetDateTime::now_utc(),
                    clock_skew: sig_v4::DEFAULT_CLOCK_SKEW,
                };
                sig_v4::verify(&ctx, &inner.auth).await?;
                Ok(())
            }
            AuthType::ServiceAccount => {
                let verifier = inner.service_accounts.as_ref().ok_or_else(|| {
                    herald_error!(NotImplemented, "service account auth is not configured")
                })?;
                let token = header_str(headers, header::AUTHORIZATION)
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .ok_or_else(|| herald_error!(AccessDenied, "missing bearer token"))?;
                let account = verifier.verify_bearer(token).await?;
                check_bucket_acl(&inner.ctx.config.service_accounts, &account, bucket)
            }
        }
    }

    fn client_response(&self, rcx: &RequestContext, backend: BackendResponse) -> HttpResponse {
        let mut builder = http::Response::builder().status(backend.status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(backend.headers);
            headers.extend(self.inner.cors.response_headers(rcx.origin.as_deref()));
            set_request_id(headers, rcx.request_id);
        }
        builder
            .body(Full::new(backend.body))
            .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
    }

    fn error_response(&self, rcx: &RequestContext, err: &HeraldError) -> HttpResponse {
        let xml = err.to_xml(&rcx.request_id.to_string());
        let mut builder = http::Response::builder().status(err.status_code());
        if let Some(headers) = builder.headers_mut() {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"));
            headers.extend(self.inner.cors.response_headers(rcx.origin.as_deref()));
            set_request_id(headers, rcx.request_id);
        }
        builder
            .body(Full::new(Bytes::from(xml)))
            .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
    }

    async fn call_owned(self, req: HttpRequest) -> Result<HttpResponse, std::convert::Infallible> {
        Ok(self.call(req).await)
    }
}

impl fmt::Debug for HeraldService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeraldService").finish_non_exhaustive()
    }
}

impl hyper::service::Service<HttpRequest> for HeraldService {
    type Response = HttpResponse;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: HttpRequest) -> Self::Future {
        let service = self.clone();
        Box::pin(service.call_owned(req))
    }
}

impl tower::Service<HttpRequest> for HeraldService {
    type Response = HttpResponse;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: HttpRequest) -> Self::Future {
        let service = self.clone();
        Box::pin(service.call_owned(req))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_request_id(headers: &mut HeaderMap, request_id: Uuid) {
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert(header::X_AMZ_REQUEST_ID, value.clone());
        headers.insert(header::X_AMZ_ID_2, value);
    }
}

fn plain_response(status: StatusCode, body: &str) -> HttpResponse {
    http::Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_owned())))
        .expect("static response always builds")
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::auth::AuthProvider as _;

    #[tokio::test]
    async fn credential_table_from_backends() {
        let config = crate::config::tests::sample_config();
        let auth = build_credential_table(&config);
        assert!(auth.get_secret_key("AKIDEXAMPLE").await.is_ok());
        assert!(auth.get_secret_key("UNKNOWN").await.is_err());
    }
}
