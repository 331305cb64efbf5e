//! Keystone token store.
//!
//! Swift calls authenticate with tokens issued by Keystone. The store fetches
//! one token per distinct `(auth_url, region)` pair, refreshes them on a
//! timer, and hands workers an owned snapshot so no mutable state crosses a
//! task boundary.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SwiftBackendConfig;
use crate::error::HeraldResult;

/// Keystone tokens usually live one hour; refresh slightly before expiry.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(55 * 60);

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwiftAuthMeta {
    pub token: String,
    pub storage_url: String,
}

impl fmt::Debug for SwiftAuthMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwiftAuthMeta")
            .field("token", &"<redacted>")
            .field("storage_url", &self.storage_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    region: String,
    url: String,
}

/// Thin client for the Keystone v3 password flow.
#[derive(Clone)]
pub struct KeystoneClient {
    client: reqwest::Client,
}

impl KeystoneClient {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn fetch_token(&self, config: &SwiftBackendConfig) -> HeraldResult<SwiftAuthMeta> {
        let creds = &config.credentials;
        let body = serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": creds.username,
                            "domain": { "name": creds.domain },
                            "password": creds.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": creds.project,
                        "domain": { "name": creds.domain },
                    }
                }
            }
        });

        let url = format!("{}/auth/tokens", creds.auth_url.trim_end_matches('/'));
        let response = crate::backend::retry_request(|| async {
            Ok(self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await?
                .error_for_status()?)
        })
        .await?;

        let token = response
            .headers()
            .get(crate::header::X_SUBJECT_TOKEN)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                crate::error::HeraldError::upstream(std::io::Error::other(
                    "keystone response carries no x-subject-token",
                ))
            })?
            .to_owned();

        let parsed: TokenResponse = response.json().await?;
        let storage_url = storage_url_for_region(&parsed, &config.region).ok_or_else(|| {
            crate::error::HeraldError::upstream(std::io::Error::other(format!(
                "keystone catalog has no object-store endpoint for region {}",
                config.region
            )))
        })?;

        Ok(SwiftAuthMeta { token, storage_url })
    }
}

fn storage_url_for_region(response: &TokenResponse, region: &str) -> Option<String> {
    response
        .token
        .catalog
        .iter()
        .filter(|entry| entry.service_type == "object-store")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| endpoint.interface == "public" && endpoint.region == region)
        .map(|endpoint| endpoint.url.clone())
}

/// Transport form of the store, sent to workers on `Start`/`UpdateContext`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializableTokenStore {
    pub pairs: Vec<(String, SwiftAuthMeta)>,
    pub configs: Vec<SwiftBackendConfig>,
}

pub struct TokenStore {
    configs: Vec<SwiftBackendConfig>,
    metas: ArcSwap<HashMap<String, SwiftAuthMeta>>,
    keystone: KeystoneClient,
}

impl TokenStore {
    #[must_use]
    pub fn new(configs: Vec<SwiftBackendConfig>, keystone: KeystoneClient) -> Self {
        Self {
            configs,
            metas: ArcSwap::from_pointee(HashMap::new()),
            keystone,
        }
    }

    /// Primes the store. A failure for one config is reported and skipped so
    /// a single unreachable Keystone does not poison the rest.
    pub async fn initialize(&self) {
        let mut metas = HashMap::new();
        for config in &self.configs {
            let key = config.token_key();
            match self.keystone.fetch_token(config).await {
                Ok(meta) => {
                    metas.insert(key, meta);
                }
                Err(err) => {
                    tracing::error!(config = %key, ?err, "keystone token fetch failed during init");
                }
            }
        }
        self.metas.store(Arc::new(metas));
    }

    /// Fetches fresh tokens and swaps the map atomically. A per config
    /// failure keeps the previous token; recovery must not drop valid entries.
    pub async fn refresh(&self) {
        let prior = self.metas.load_full();
        let mut fetched = Vec::with_capacity(self.configs.len());
        for config in &self.configs {
            let key = config.token_key();
            match self.keystone.fetch_token(config).await {
                Ok(meta) => fetched.push((key, Some(meta))),
                Err(err) => {
                    tracing::warn!(config = %key, ?err, "keystone refresh failed, keeping previous token");
                    fetched.push((key, None));
                }
            }
        }
        self.metas.store(Arc::new(merge_refreshed(&prior, fetched)));
    }

    /// Pure lookup. A missing entry for a configured Swift backend means the
    /// store was never primed for it, which is a wiring bug.
    ///
    /// # Panics
    /// If no token is cached for `config`.
    #[must_use]
    pub fn auth_meta_for(&self, config: &SwiftBackendConfig) -> SwiftAuthMeta {
        let key = config.token_key();
        self.metas
            .load()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| panic!("no keystone token for configured swift backend {key}"))
    }

    #[must_use]
    pub fn to_serializable(&self) -> SerializableTokenStore {
        let metas = self.metas.load();
        let mut pairs: Vec<(String, SwiftAuthMeta)> =
            metas.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        SerializableTokenStore {
            pairs,
            configs: self.configs.clone(),
        }
    }

    #[must_use]
    pub fn from_serializable(snapshot: SerializableTokenStore, keystone: KeystoneClient) -> Self {
        let store = Self::new(snapshot.configs, keystone);
        store.metas.store(Arc::new(snapshot.pairs.into_iter().collect()));
        store
    }

    /// Replaces the cached tokens with a newer snapshot.
    pub fn apply_snapshot(&self, snapshot: &SerializableTokenStore) {
        self.metas
            .store(Arc::new(snapshot.pairs.iter().cloned().collect()));
    }
}

fn merge_refreshed(
    prior: &HashMap<String, SwiftAuthMeta>,
    fetched: Vec<(String, Option<SwiftAuthMeta>)>,
) -> HashMap<String, SwiftAuthMeta> {
    let mut merged = HashMap::with_capacity(fetched.len());
    for (key, meta) in fetched {
        match meta {
            Some(meta) => {
                merged.insert(key, meta);
            }
            None => {
                if let Some(previous) = prior.get(&key) {
                    merged.insert(key, previous.clone());
                }
            }
        }
    }
    merged
}
