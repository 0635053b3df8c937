// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Service Configuration Types
//
// Defines the configuration schema shared by the Company and User services:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Service role and listener
// - Peer endpoint and call timeout
// - Storage backend selection
// - Membership failure policies
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::repository::{PostgresConfig, StorageBackend};

pub const API_VERSION: &str = "membership/v1";
pub const KIND: &str = "ServiceConfig";
pub const CONFIG_PATH_ENV: &str = "MEMBERSHIP_CONFIG_PATH";

/// Top-level Kubernetes-style service configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfigManifest {
    /// API version (must be "membership/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ServiceConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ServiceConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable deployment name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfigSpec {
    pub service: ServiceSettings,

    pub peer: PeerSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub membership: MembershipPolicy,

    #[serde(default)]
    pub observability: ObservabilitySettings,
}

/// Which half of the split domain this process owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    Company,
    User,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::User => "user",
        }
    }

    pub fn peer(&self) -> Self {
        match self {
            Self::Company => Self::User,
            Self::User => Self::Company,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Company => 8882,
            Self::User => 8881,
        }
    }

    /// Base URL of this role's API as reached by its peer in the default deployment
    pub fn default_base_url(&self) -> String {
        match self {
            Self::Company => "http://company-service:8882/api/companies".to_string(),
            Self::User => "http://user-service:8881/api/users".to_string(),
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "company" => Ok(Self::Company),
            "user" => Ok(Self::User),
            other => Err(format!("unknown service role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub role: ServiceRole,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Base URL of the peer's resource collection, e.g. `http://company-service:8882/api/companies`
    pub base_url: String,

    /// Upper bound for every peer call; exceeding it counts as peer unavailable
    #[serde(with = "humantime_serde", default = "default_peer_timeout")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageKind,

    /// PostgreSQL connection string (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    #[default]
    InMemory,
    Postgres,
}

/// What a create-with-association does when the peer cannot answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Reject the request; nothing is written
    #[default]
    Abort,
    /// Store the entity with its association flagged unpropagated
    Degrade,
}

/// How a deletion tells the peer to drop the link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionUnlink {
    /// Delete locally, then unlink through the post-commit channel
    #[default]
    Deferred,
    /// Unlink remotely first; an unavailable peer becomes a warning
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPolicy {
    #[serde(default)]
    pub on_peer_unavailable: UnavailablePolicy,

    #[serde(default)]
    pub deletion_unlink: DeletionUnlink,

    /// Capacity of the report broadcast attached to the propagation channel
    #[serde(default = "default_propagation_buffer")]
    pub propagation_buffer: usize,
}

impl Default for MembershipPolicy {
    fn default() -> Self {
        Self {
            on_peer_unavailable: UnavailablePolicy::default(),
            deletion_unlink: DeletionUnlink::default(),
            propagation_buffer: default_propagation_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_peer_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_propagation_buffer() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl ServiceConfigManifest {
    /// Default manifest for one role, pointing at the peer's default address
    pub fn for_role(role: ServiceRole) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: format!("{}-service", role),
                version: Some("1.0.0".to_string()),
            },
            spec: ServiceConfigSpec {
                service: ServiceSettings {
                    role,
                    bind_address: default_bind_address(),
                    port: role.default_port(),
                },
                peer: PeerSettings {
                    base_url: role.peer().default_base_url(),
                    timeout: default_peer_timeout(),
                },
                storage: StorageSettings::default(),
                membership: MembershipPolicy::default(),
                observability: ObservabilitySettings::default(),
            },
        }
    }

    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. MEMBERSHIP_CONFIG_PATH environment variable
    /// 2. ./membership-config.yaml (working directory)
    /// 3. ~/.membership/config.yaml (user home)
    /// 4. /etc/membership/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./membership-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".membership").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/membership/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to the defaults of `fallback_role`
    pub fn load_or_default(
        cli_path: Option<PathBuf>,
        fallback_role: ServiceRole,
    ) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!(
                "No configuration file found in standard locations. Using {} defaults.",
                fallback_role
            );
            let mut config = Self::for_role(fallback_role);
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MEMBERSHIP_PEER_URL") {
            tracing::info!("Environment override: MEMBERSHIP_PEER_URL={}", url);
            self.spec.peer.base_url = url;
        }

        if let Ok(val) = std::env::var("MEMBERSHIP_ON_PEER_UNAVAILABLE") {
            match val.to_lowercase().as_str() {
                "abort" => self.spec.membership.on_peer_unavailable = UnavailablePolicy::Abort,
                "degrade" => self.spec.membership.on_peer_unavailable = UnavailablePolicy::Degrade,
                _ => {
                    tracing::warn!(
                        "Invalid value for MEMBERSHIP_ON_PEER_UNAVAILABLE: '{}'. Expected abort/degrade. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(url) = std::env::var("MEMBERSHIP_DATABASE_URL") {
            tracing::info!("Environment override: MEMBERSHIP_DATABASE_URL set, using postgres storage");
            self.spec.storage.backend = StorageKind::Postgres;
            self.spec.storage.connection_string = Some(url);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.peer.base_url.trim().is_empty() {
            anyhow::bail!("spec.peer.base_url cannot be empty");
        }

        if !self.spec.peer.base_url.starts_with("http://")
            && !self.spec.peer.base_url.starts_with("https://")
        {
            anyhow::bail!(
                "spec.peer.base_url must be an http(s) URL, got '{}'",
                self.spec.peer.base_url
            );
        }

        if self.spec.peer.timeout.is_zero() {
            anyhow::bail!("spec.peer.timeout must be greater than zero");
        }

        if self.spec.storage.backend == StorageKind::Postgres
            && self
                .spec
                .storage
                .connection_string
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            anyhow::bail!("spec.storage.connection_string is required for the postgres backend");
        }

        if self.spec.membership.propagation_buffer == 0 {
            anyhow::bail!("spec.membership.propagation_buffer must be greater than zero");
        }

        Ok(())
    }

    /// Resolve the configured storage into a repository backend selector
    pub fn storage_backend(&self) -> anyhow::Result<StorageBackend> {
        match self.spec.storage.backend {
            StorageKind::InMemory => Ok(StorageBackend::InMemory),
            StorageKind::Postgres => {
                let raw = self
                    .spec
                    .storage
                    .connection_string
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("postgres backend needs a connection_string"))?;
                let connection_string = match raw.strip_prefix("env:") {
                    Some(var) => std::env::var(var).map_err(|_| {
                        anyhow::anyhow!("Environment variable '{}' for connection_string is not set", var)
                    })?,
                    None => raw,
                };
                Ok(StorageBackend::PostgreSQL(PostgresConfig { connection_string }))
            }
        }
    }
}

impl Default for ServiceConfigManifest {
    fn default() -> Self {
        Self::for_role(ServiceRole::User)
    }
}
