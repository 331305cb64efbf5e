//! Configuration model and bucket registry.
//!
//! The config document is loaded once at boot and is read only afterwards.
//! `Registry::resolve` dereferences bucket and replica definitions against the
//! backend table and enforces the registry invariants up front, so the rest of
//! the proxy can assume every `Bucket` it sees is well formed.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

/// Reserved bucket holding the proxy's own durable state.
pub const TASK_STORE_BUCKET: &str = "task-store";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("bucket {bucket} references unknown backend {backend}")]
    UnknownBackend { bucket: String, backend: String },
    #[error("bucket {bucket} references unknown replica {replica}")]
    UnknownReplica { bucket: String, replica: String },
    #[error("bucket {bucket} lists its primary backend {backend} as a replica")]
    ReplicaIsPrimary { bucket: String, backend: String },
    #[error("backend name {0} is defined more than once")]
    DuplicateBackend(String),
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwiftCredentials {
    pub username: String,
    pub password: String,
    pub project: String,
    pub domain: String,
    pub auth_url: String,
}

impl fmt::Debug for SwiftCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwiftCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project", &self.project)
            .field("domain", &self.domain)
            .field("auth_url", &self.auth_url)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3BackendConfig {
    pub endpoint: String,
    pub region: String,
    pub credentials: S3Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwiftBackendConfig {
    pub region: String,
    pub credentials: SwiftCredentials,
}

impl SwiftBackendConfig {
    /// Key under which this config's token is cached.
    #[must_use]
    pub fn token_key(&self) -> String {
        format!("{}-{}", self.credentials.auth_url, self.region)
    }
}

/// Backend specific configuration, tagged by protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum BackendConfig {
    S3(S3BackendConfig),
    Swift(SwiftBackendConfig),
}

impl BackendConfig {
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::S3(_) => "s3",
            Self::Swift(_) => "swift",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendDef {
    pub name: String,
    #[serde(flatten)]
    pub config: BackendConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    #[default]
    Default,
    ServiceAccount,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAccount {
    pub name: String,
    pub buckets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorsConfig {
    #[serde(default)]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketDef {
    pub backend: String,
    #[serde(default)]
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaDef {
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalConfig {
    pub port: u16,
    #[serde(default)]
    pub default_bucket: Option<String>,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub trusted_ips: Vec<IpNet>,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccount>,
    #[serde(default)]
    pub virtual_host_aliases: Vec<String>,
    pub backends: Vec<BackendDef>,
    pub buckets: BTreeMap<String, BucketDef>,
    #[serde(default)]
    pub replicas: BTreeMap<String, ReplicaDef>,
}

impl GlobalConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    #[must_use]
    pub fn is_trusted_ip(&self, ip: IpAddr) -> bool {
        self.trusted_ips.iter().any(|net| net.contains(&ip))
    }
}

/// Environment driven settings, read once at process start.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub cert_path: Option<String>,
    pub service_account_token_path: Option<String>,
    pub k8s_api: Option<String>,
    pub env: String,
    pub log_level: String,
    pub sentry_dsn: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            cert_path: lookup("cert_path"),
            service_account_token_path: lookup("service_account_token_path"),
            k8s_api: lookup("k8s_api"),
            env: lookup("env").ok_or(ConfigError::MissingEnv("env"))?,
            log_level: lookup("log_level").unwrap_or_else(|| "info".to_owned()),
            sentry_dsn: lookup("sentry_dsn"),
        })
    }
}

/// A backend reference resolved from the config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendRef {
    pub name: String,
    #[serde(flatten)]
    pub config: BackendConfig,
}

/// A fully resolved bucket: primary backend plus dereferenced replicas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
    pub backend: BackendRef,
    #[serde(default)]
    pub replicas: Vec<BackendRef>,
}

impl Bucket {
    /// View of a replica as a standalone bucket, used when a mirror task
    /// carries the backup target.
    #[must_use]
    pub fn replica_view(&self, replica: &BackendRef) -> Self {
        Self {
            name: self.name.clone(),
            backend: replica.clone(),
            replicas: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    buckets: BTreeMap<String, Bucket>,
}

impl Registry {
    pub fn resolve(config: &GlobalConfig) -> Result<Self, ConfigError> {
        let mut backends: BTreeMap<&str, &BackendDef> = BTreeMap::new();
        for def in &config.backends {
            if backends.insert(def.name.as_str(), def).is_some() {
                return Err(ConfigError::DuplicateBackend(def.name.clone()));
            }
        }

        let lookup = |bucket: &str, name: &str| -> Result<BackendRef, ConfigError> {
            let def = backends.get(name).ok_or_else(|| ConfigError::UnknownBackend {
                bucket: bucket.to_owned(),
                backend: name.to_owned(),
            })?;
            Ok(BackendRef {
                name: def.name.clone(),
                config: def.config.clone(),
            })
        };

        let mut buckets = BTreeMap::new();
        for (name, def) in &config.buckets {
            let backend = lookup(name, &def.backend)?;
            let mut replicas = Vec::with_capacity(def.replicas.len());
            for replica_name in &def.replicas {
                let replica_def =
                    config
                        .replicas
                        .get(replica_name)
                        .ok_or_else(|| ConfigError::UnknownReplica {
                            bucket: name.clone(),
                            replica: replica_name.clone(),
                        })?;
                let replica = lookup(name, &replica_def.backend)?;
                if replica.name == backend.name {
                    return Err(ConfigError::ReplicaIsPrimary {
                        bucket: name.clone(),
                        backend: backend.name.clone(),
                    });
                }
                replicas.push(replica);
            }
            buckets.insert(
                name.clone(),
                Bucket {
                    name: name.clone(),
                    backend,
                    replicas,
                },
            );
        }

        Ok(Self { buckets })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    /// Bucket names that get a mirror queue. The task store never mirrors.
    pub fn mirrored_bucket_names(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str).filter(|name| *name != TASK_STORE_BUCKET)
    }

    /// Every distinct Swift backend config in use, for token store priming.
    #[must_use]
    pub fn swift_configs(&self) -> Vec<SwiftBackendConfig> {
        let mut seen = BTreeMap::new();
        for bucket in self.buckets.values() {
            for backend in std::iter::once(&bucket.backend).chain(bucket.replicas.iter()) {
                if let BackendConfig::Swift(ref cfg) = backend.config {
                    seen.entry(cfg.token_key()).or_insert_with(|| cfg.clone());
                }
            }
        }
        seen.into_values().collect()
    }
}
