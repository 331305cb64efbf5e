//! Client authentication.
//!
//! Three modes, selected by config: anonymous, SigV4 against a static
//! credential table, and Kubernetes service account JWTs verified against the
//! cluster JWKS. The bucket ACL applies on top of the service account mode.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use zeroize::Zeroize as _;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ServiceAccount;
use crate::error::HeraldResult;

/// Secret access key. Redacted in debug output, zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(String);

impl SecretKey {
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SecretKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SecretKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Maps an access key id to its secret.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    async fn get_secret_key(&self, access_key_id: &str) -> HeraldResult<SecretKey>;
}

/// In-memory credential table built from the config document.
#[derive(Debug, Default)]
pub struct StaticAuth {
    keys: HashMap<String, SecretKey>,
}

impl StaticAuth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_single(access_key_id: impl Into<String>, secret_key: SecretKey) -> Self {
        let mut auth = Self::new();
        auth.register(access_key_id.into(), secret_key);
        auth
    }

    pub fn register(&mut self, access_key_id: String, secret_key: SecretKey) {
        self.keys.insert(access_key_id, secret_key);
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn get_secret_key(&self, access_key_id: &str) -> HeraldResult<SecretKey> {
        self.keys
            .get(access_key_id)
            .cloned()
            .ok_or_else(|| herald_error!(InvalidAccessKeyId))
    }
}

/// Checks the per service account bucket allow list.
pub fn check_bucket_acl(accounts: &[ServiceAccount], account: &str, bucket: &str) -> HeraldResult {
    let Some(entry) = accounts.iter().find(|a| a.name == account) else {
        return Err(herald_error!(AccessDenied, "unknown service account: {account}"));
    };
    if entry.buckets.iter().any(|b| b == bucket) {
        Ok(())
    } else {
        Err(herald_error!(AccessDenied, "service account {account} may not access bucket {bucket}"))
    }
}

const JWKS_TTL: Duration = Duration::hours(24);

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

struct CachedJwks {
    fetched_at: OffsetDateTime,
    jwks: jsonwebtoken::jwk::JwkSet,
}

/// Verifies `Authorization: Bearer` tokens against the Kubernetes JWKS
/// endpoint. The key set is refetched at most once per day.
pub struct ServiceAccountVerifier {
    jwks_url: String,
    client: reqwest::Client,
    cache: ArcSwapOption<CachedJwks>,
}

impl ServiceAccountVerifier {
    #[must_use]
    pub fn new(k8s_api: &str, client: reqwest::Client) -> Self {
        Self {
            jwks_url: format!("{}/openid/v1/jwks", k8s_api.trim_end_matches('/')),
            client,
            cache: ArcSwapOption::empty(),
        }
    }

    pub async fn verify_bearer(&self, token: &str) -> HeraldResult<String> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|_| herald_error!(AccessDenied, "malformed bearer token"))?;
        let kid = header
            .kid
            .ok_or_else(|| herald_error!(AccessDenied, "bearer token has no key id"))?;

        let jwks = self.current_jwks().await?;
        let jwk = jwks
            .jwks
            .find(&kid)
            .ok_or_else(|| herald_error!(AccessDenied, "token signed by unknown key"))?;
        let key = jsonwebtoken::DecodingKey::from_jwk(jwk)
            .map_err(crate::error::HeraldError::internal)?;

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.validate_aud = false;
        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .map_err(|_| herald_error!(AccessDenied, "invalid bearer token"))?;

        Ok(account_name_from_subject(&data.claims.sub))
    }

    async fn current_jwks(&self) -> HeraldResult<Arc<CachedJwks>> {
        if let Some(cached) = self.cache.load_full() {
            if OffsetDateTime::now_utc() - cached.fetched_at < JWKS_TTL {
                return Ok(cached);
            }
        }
        let jwks: jsonwebtoken::jwk::JwkSet = self
            .client
            .get(&self.jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let fresh = Arc::new(CachedJwks {
            fetched_at: OffsetDateTime::now_utc(),
            jwks,
        });
        self.cache.store(Some(Arc::clone(&fresh)));
        Ok(fresh)
    }
}

/// Kubernetes subjects look like `system:serviceaccount:<namespace>:<name>`;
/// the trailing component is the account name the ACL speaks about.
fn account_name_from_subject(subject: &str) -> String {
    subject.rsplit(':').next().unwrap_or(subject).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_auth_lookup() {
        let auth = StaticAuth::from_single("AKID", SecretKey::from("secret"));
        let key = auth.get_secret_key("AKID").await.unwrap();
        assert_eq!(key.expose(), "secret");

        let err = auth.get_secret_key("NOPE").await.unwrap_err();
        assert_eq!(err.code(), crate::error::HeraldErrorCode::InvalidAccessKeyId);
    }

    #[test]
    fn secret_key_debug_is_redacted() {
        let key = SecretKey::from("super-secret");
        assert_eq!(format!("{key:?}"), "SecretKey(<redacted>)");
    }

    #[test]
    fn acl_allows_listed_buckets_only() {
        let accounts = vec![ServiceAccount {
            name: "ingest".to_owned(),
            buckets: vec!["photos".to_owned()],
        }];
        assert!(check_bucket_acl(&accounts, "ingest", "photos").is_ok());
        assert!(check_bucket_acl(&accounts, "ingest", "videos").is_err());
        assert!(check_bucket_acl(&accounts, "ghost", "photos").is_err());
    }

    #[test]
    fn subject_parsing() {
        assert_eq!(account_name_from_subject("system:serviceaccount:prod:ingest"), "ingest");
        assert_eq!(account_name_from_subject("plain"), "plain");
    }
}
