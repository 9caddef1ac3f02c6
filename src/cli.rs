//! # Command Line Interface
//!
//! The sidecar's flag surface, turned into an immutable [`Config`] before
//! anything else starts.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{AuthFileFormat, AuthOptions, Config, ObservabilityConfig};
use crate::errors::Result;
use crate::resource::ResourceSpec;

#[derive(Parser, Debug)]
#[command(name = "sidelock")]
#[command(about = "Sidecar that keeps secret-store leases fresh and materialised on disk")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Base URL of the secret store
    #[arg(long = "vault", env = "VAULT_ADDR", default_value = "https://127.0.0.1:8200")]
    pub vault: String,

    /// Path to an authentication options file (json or yaml)
    #[arg(long = "auth")]
    pub auth: Option<PathBuf>,

    /// Dialect of the authentication file (default or kubernetes-vault)
    #[arg(long = "format", default_value = "default")]
    pub format: String,

    /// Keep the store token renewed in the background
    #[arg(long = "renew-token")]
    pub renew_token: bool,

    /// Directory the secrets are written into
    #[arg(long = "output", env = "VAULT_OUTPUT", default_value = "/etc/secrets")]
    pub output: PathBuf,

    /// PEM CA certificate to trust
    #[arg(long = "ca-cert")]
    pub ca_cert: Option<PathBuf>,

    /// Disable TLS verification
    #[arg(long = "tls-skip-verify")]
    pub tls_skip_verify: bool,

    /// Print writes to stdout instead of touching the filesystem
    #[arg(long = "dryrun")]
    pub dryrun: bool,

    /// Interval between statistics log lines
    #[arg(long = "stats", default_value = "1h", value_parser = parse_duration)]
    pub stats: Duration,

    /// Timeout applied to per-resource exec hooks
    #[arg(long = "exec-timeout", default_value = "60s", value_parser = parse_duration)]
    pub exec_timeout: Duration,

    /// Fetch each resource exactly once, then exit
    #[arg(long = "one-shot")]
    pub one_shot: bool,

    /// A resource to retrieve and monitor, BACKEND:PATH[:OPTIONS]; repeatable
    #[arg(long = "cn", value_name = "RESOURCE")]
    pub cn: Vec<String>,

    /// Port for the Prometheus metrics listener; 0 disables it
    #[arg(long = "metrics-port", default_value_t = 9099)]
    pub metrics_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "SIDELOCK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    #[arg(long = "json-logging")]
    pub json_logging: bool,
}

impl Cli {
    /// Build and validate the process configuration.
    ///
    /// A `vaultAddr` in the auth file takes precedence over `--vault`, which
    /// is how agent-style integrations hand both credential and address over
    /// in one file.
    pub fn into_config(self) -> Result<Config> {
        let format: AuthFileFormat = self.format.parse()?;
        let auth = match &self.auth {
            Some(path) => AuthOptions::from_file(path, format)?,
            None => AuthOptions::default(),
        };

        let vault_url = auth.vault_addr.clone().unwrap_or(self.vault);

        let resources = self
            .cn
            .iter()
            .map(|descriptor| ResourceSpec::parse(descriptor))
            .collect::<Result<Vec<_>>>()?;

        let config = Config {
            vault_url,
            auth,
            renew_token: self.renew_token,
            output_dir: self.output,
            ca_cert: self.ca_cert,
            tls_skip_verify: self.tls_skip_verify,
            dry_run: self.dryrun,
            stats_interval: self.stats,
            exec_timeout: self.exec_timeout,
            one_shot: self.one_shot,
            observability: ObservabilityConfig {
                log_level: self.log_level,
                json_logging: self.json_logging,
                metrics_port: self.metrics_port,
                ..ObservabilityConfig::default()
            },
            resources,
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_duration(value: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}
