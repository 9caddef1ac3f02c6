//! # Configuration Management
//!
//! The immutable process configuration: store address and TLS material,
//! authentication options (with file dialects), output behaviour, and the
//! observability settings. Built once from the command line and passed by
//! reference to every component; there is no global mutable state.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::errors::{Error, Result};
use crate::resource::ResourceSpec;
use crate::store::SecretString;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the secret store
    pub vault_url: String,
    /// Authentication options, merged from the auth file and environment
    pub auth: AuthOptions,
    /// Keep the store token renewed in the background
    pub renew_token: bool,
    /// Directory the secrets are written into
    pub output_dir: PathBuf,
    /// Additional PEM CA certificate to trust
    pub ca_cert: Option<PathBuf>,
    /// Disable TLS verification
    pub tls_skip_verify: bool,
    /// Print writes to stdout instead of touching the filesystem
    pub dry_run: bool,
    /// Interval between statistics log lines
    pub stats_interval: Duration,
    /// Timeout applied to per-resource exec hooks
    pub exec_timeout: Duration,
    /// Fetch every resource exactly once, then exit
    pub one_shot: bool,
    /// Logging and metrics settings
    pub observability: ObservabilityConfig,
    /// The resources to watch
    pub resources: Vec<ResourceSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_url: "https://127.0.0.1:8200".to_string(),
            auth: AuthOptions::default(),
            renew_token: false,
            output_dir: PathBuf::from("/etc/secrets"),
            ca_cert: None,
            tls_skip_verify: false,
            dry_run: false,
            stats_interval: Duration::from_secs(60 * 60),
            exec_timeout: Duration::from_secs(60),
            one_shot: false,
            observability: ObservabilityConfig::default(),
            resources: Vec::new(),
        }
    }
}

impl Config {
    /// Validate the configuration: the store URL must parse, and every
    /// resource must pass its per-backend semantic checks.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.vault_url)
            .map_err(|_| Error::config(format!("invalid vault url: '{}'", self.vault_url)))?;
        if url.scheme() != "https" {
            warn!(scheme = %url.scheme(), "store url scheme is not secure and should be https");
        }

        for resource in &self.resources {
            resource.validate()?;
        }

        Ok(())
    }
}

/// Observability configuration
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logging: bool,
    /// Whether the Prometheus exporter should be started
    pub enable_metrics: bool,
    /// Bind address for the metrics listener
    pub metrics_host: String,
    /// Port for the metrics listener; 0 disables the exporter
    pub metrics_port: u16,
    /// Value of the `service` label on exported series
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: true,
            metrics_host: "0.0.0.0".to_string(),
            metrics_port: 9099,
            service_name: "sidelock".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// The metrics bind address, or `None` when the exporter is disabled.
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            return None;
        }
        Some(format!("{}:{}", self.metrics_host, self.metrics_port))
    }
}

/// Dialect of the authentication options file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthFileFormat {
    /// All fields read as-is
    #[default]
    Default,
    /// kubernetes-vault agent output: `client_token` becomes the token and
    /// the method is forced to `token`
    KubernetesVault,
}

impl FromStr for AuthFileFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "kubernetes-vault" => Ok(Self::KubernetesVault),
            other => Err(Error::config(format!("unsupported auth file format: {}", other))),
        }
    }
}

/// Authentication options, typically read from a JSON or YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    /// The authentication method (token, userpass, approle, ...)
    pub method: String,
    /// A bearer token, for the token method
    pub token: Option<SecretString>,
    /// Role identifier for approle and the cloud methods
    pub role_id: Option<String>,
    /// Secret identifier for approle
    pub secret_id: Option<SecretString>,
    /// Account name for userpass
    pub username: Option<String>,
    /// Account password for userpass
    pub password: Option<SecretString>,
    /// Store address override
    #[serde(alias = "vaultAddr")]
    pub vault_addr: Option<String>,
    /// A further file to read the token from
    pub filename: Option<PathBuf>,
    /// Dialect of that file
    #[serde(alias = "fileFormat")]
    pub file_format: Option<String>,
}

impl AuthOptions {
    /// Read auth options from a JSON or YAML file in the given dialect.
    pub fn from_file(path: &Path, format: AuthFileFormat) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("unable to read auth file {}: {}", path.display(), e))
        })?;

        match format {
            AuthFileFormat::Default => parse_auth_content::<Self>(path, &content),
            AuthFileFormat::KubernetesVault => {
                let raw: serde_json::Value = parse_auth_content(path, &content)?;
                let token = raw.get("client_token").and_then(|v| v.as_str()).ok_or_else(|| {
                    Error::config(format!(
                        "auth file {} has no client_token field",
                        path.display()
                    ))
                })?;
                Ok(Self {
                    method: "token".to_string(),
                    token: Some(SecretString::new(token)),
                    ..Self::default()
                })
            }
        }
    }
}

fn parse_auth_content<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid auth file {}: {}", path.display(), e)))
    } else {
        serde_json::from_str(content)
            .map_err(|e| Error::config(format!("invalid auth file {}: {}", path.display(), e)))
    }
}
