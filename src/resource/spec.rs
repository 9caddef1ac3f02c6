//! Resource descriptors.
//!
//! A resource is declared on the command line as `BACKEND:PATH[:OPTIONS]`,
//! where `OPTIONS` is a list of `key=value` pairs. Known option keys are
//! lifted into typed policy fields; anything else is passed through to the
//! store as a request parameter.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{Error, Result};

const OPTION_FILENAME: &str = "file";
const OPTION_FORMAT: &str = "fmt";
const OPTION_TEMPLATE_PATH: &str = "tpl";
const OPTION_RENEWAL: &str = "renew";
const OPTION_REVOKE: &str = "revoke";
const OPTION_REVOKE_DELAY: &str = "delay";
const OPTION_UPDATE: &str = "update";
const OPTION_EXEC: &str = "exec";
const OPTION_CREATE: &str = "create";
const OPTION_SIZE: &str = "size";
const OPTION_MODE: &str = "mode";
const OPTION_MAX_RETRIES: &str = "retries";
const OPTION_MAX_JITTER: &str = "jitter";

/// Default length of a generated secret value
const DEFAULT_SIZE: i64 = 20;

/// Default permissions for written secret files
const DEFAULT_FILE_MODE: u32 = 0o664;

/// Category of secret, deciding how the store is queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Raw,
    Pki,
    Aws,
    Gcp,
    Secret,
    Mysql,
    Postgres,
    Transit,
    Cubbyhole,
    Cassandra,
    Ssh,
    Database,
    Tpl,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Pki => "pki",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Secret => "secret",
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Transit => "transit",
            Self::Cubbyhole => "cubbyhole",
            Self::Cassandra => "cassandra",
            Self::Ssh => "ssh",
            Self::Database => "database",
            Self::Tpl => "tpl",
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Self::Raw),
            "pki" => Ok(Self::Pki),
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "secret" => Ok(Self::Secret),
            "mysql" => Ok(Self::Mysql),
            "postgres" => Ok(Self::Postgres),
            "transit" => Ok(Self::Transit),
            "cubbyhole" => Ok(Self::Cubbyhole),
            "cassandra" => Ok(Self::Cassandra),
            "ssh" => Ok(Self::Ssh),
            "database" => Ok(Self::Database),
            "tpl" => Ok(Self::Tpl),
            other => Err(Error::resource(format!("unsupported resource type: {}", other))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-disk representation of a retrieved secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
    Env,
    Ini,
    Txt,
    Csv,
    Cert,
    CertChain,
    Bundle,
    RootCa,
    Credential,
    Aws,
    Template,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Env => "env",
            Self::Ini => "ini",
            Self::Txt => "txt",
            Self::Csv => "csv",
            Self::Cert => "cert",
            Self::CertChain => "certchain",
            Self::Bundle => "bundle",
            Self::RootCa => "rootca",
            Self::Credential => "credential",
            Self::Aws => "aws",
            Self::Template => "template",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            "env" => Ok(Self::Env),
            "ini" => Ok(Self::Ini),
            "txt" => Ok(Self::Txt),
            "csv" => Ok(Self::Csv),
            "cert" => Ok(Self::Cert),
            "certchain" => Ok(Self::CertChain),
            "bundle" => Ok(Self::Bundle),
            "rootca" => Ok(Self::RootCa),
            "credential" => Ok(Self::Credential),
            "aws" => Ok(Self::Aws),
            "template" => Ok(Self::Template),
            other => Err(Error::resource(format!("unsupported output format: {}", other))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable description of one resource to watch.
///
/// Built once by [`ResourceSpec::parse`] and validated with
/// [`ResourceSpec::validate`]; never mutated afterwards. The engine holds
/// these behind an `Arc` and identifies them by `path`.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    /// The backend deciding read vs. write semantics
    pub backend: Backend,
    /// Store path of the secret
    pub path: String,
    /// On-disk output format
    pub format: OutputFormat,
    /// Backend-specific request parameters
    pub options: HashMap<String, String>,
    /// Whether the lease should be renewed rather than re-fetched
    pub renewable: bool,
    /// Revoke the previous lease after a rotation
    pub revoke_on_rotate: bool,
    /// How long to keep a rotated lease alive before revoking it
    pub revoke_delay: Duration,
    /// Forced refresh interval, overriding the lease-derived window
    pub update_override: Duration,
    /// Generate the secret if the read finds nothing (secret backend only)
    pub create_if_missing: bool,
    /// Length of a generated secret value
    pub size: i64,
    /// Maximum consecutive failures before the resource is given up on
    pub max_retries: u32,
    /// Maximum random contraction applied to the renewal delay
    pub max_jitter: Duration,
    /// Output filename override
    pub filename: Option<String>,
    /// Template used by the `template` output format
    pub template_file: Option<PathBuf>,
    /// Command to run after a successful write
    pub exec_cmd: Option<String>,
    /// Permissions for written files
    pub file_mode: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            backend: Backend::Secret,
            path: String::new(),
            format: OutputFormat::Yaml,
            options: HashMap::new(),
            renewable: false,
            revoke_on_rotate: false,
            revoke_delay: Duration::ZERO,
            update_override: Duration::ZERO,
            create_if_missing: false,
            size: DEFAULT_SIZE,
            max_retries: 0,
            max_jitter: Duration::ZERO,
            filename: None,
            template_file: None,
            exec_cmd: None,
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

impl ResourceSpec {
    /// Parse a `BACKEND:PATH[:OPTIONS]` descriptor.
    ///
    /// The segment separator defaults to `:` and the options separator to
    /// `§`; both can be overridden through `VAULT_SIDEKICK_SEPARATOR` and
    /// `VAULT_SIDEKICK_OPTIONS_SEPARATOR`. Environment variables in the
    /// path segment are expanded.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut spec = Self::default();

        let separator = env_or("VAULT_SIDEKICK_SEPARATOR", ":");
        let segments: Vec<&str> = descriptor.split(separator.as_str()).collect();
        if segments.len() < 2 {
            return Err(Error::resource(
                "descriptor must have at least two sections, BACKEND:PATH",
            ));
        }
        if segments.len() > 3 {
            return Err(Error::resource(
                "descriptor can only have three sections, BACKEND:PATH[:OPTIONS]",
            ));
        }
        if segments[0].is_empty() || segments[1].is_empty() {
            return Err(Error::resource("neither backend nor path can be empty"));
        }

        spec.backend = segments[0].parse()?;
        spec.path = shellexpand::env(segments[1])
            .map_err(|e| Error::resource(format!("cannot expand path: {}", e)))?
            .into_owned();

        if let Some(raw_options) = segments.get(2) {
            let option_separator = env_or("VAULT_SIDEKICK_OPTIONS_SEPARATOR", "§");
            for pair in raw_options.split(option_separator.as_str()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    Error::resource(format!("invalid option: {}, must be KEY=VALUE", pair))
                })?;
                if value.is_empty() {
                    return Err(Error::resource(format!(
                        "invalid option: {}, must have a value",
                        pair
                    )));
                }
                let key = key.trim();
                let value = value.replace('|', ",");
                spec.apply_option(key, &value)?;
            }
        }

        Ok(spec)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            OPTION_MODE => self.file_mode = parse_file_mode(value)?,
            OPTION_FORMAT => self.format = value.parse()?,
            OPTION_UPDATE => {
                self.update_override = parse_duration_option(OPTION_UPDATE, value)?;
            }
            OPTION_REVOKE => {
                self.revoke_on_rotate = parse_bool_option(OPTION_REVOKE, value)?;
            }
            OPTION_REVOKE_DELAY => {
                self.revoke_delay = parse_duration_option(OPTION_REVOKE_DELAY, value)?;
            }
            OPTION_RENEWAL => {
                self.renewable = parse_bool_option(OPTION_RENEWAL, value)?;
            }
            OPTION_CREATE => {
                if self.backend != Backend::Secret {
                    return Err(Error::resource(
                        "the create option is only supported for the secret backend",
                    ));
                }
                self.create_if_missing = parse_bool_option(OPTION_CREATE, value)?;
            }
            OPTION_SIZE => {
                self.size = value.parse().map_err(|_| {
                    Error::resource(format!(
                        "the size option: {} is invalid, should be an integer",
                        value
                    ))
                })?;
            }
            OPTION_EXEC => self.exec_cmd = Some(value.to_string()),
            OPTION_FILENAME => self.filename = Some(value.to_string()),
            OPTION_TEMPLATE_PATH => self.template_file = Some(PathBuf::from(value)),
            OPTION_MAX_RETRIES => {
                self.max_retries = value.parse().map_err(|_| {
                    Error::resource(format!(
                        "the retries option: {} is invalid, should be an integer",
                        value
                    ))
                })?;
            }
            OPTION_MAX_JITTER => {
                self.max_jitter = parse_duration_option(OPTION_MAX_JITTER, value)?;
            }
            _ => {
                self.options.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Semantic validation of per-backend required options.
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            Backend::Pki => {
                if !self.options.contains_key("common_name") {
                    return Err(Error::resource(format!(
                        "{}: pki resource requires a common_name option",
                        self
                    )));
                }
            }
            Backend::Transit => {
                if !self.options.contains_key("ciphertext") {
                    return Err(Error::resource(format!(
                        "{}: transit resource requires a ciphertext option",
                        self
                    )));
                }
            }
            Backend::Ssh => {
                if !self.options.contains_key("public_key_path") {
                    return Err(Error::resource(format!(
                        "{}: ssh resource requires a public_key_path option",
                        self
                    )));
                }
                if !self.options.contains_key("cert_type") {
                    return Err(Error::resource(format!(
                        "{}: ssh resource requires cert_type to be either host or user",
                        self
                    )));
                }
            }
            Backend::Tpl => {
                self.validate_template()?;
            }
            _ => {}
        }

        if self.format == OutputFormat::Template {
            self.validate_template()?;
        }

        Ok(())
    }

    fn validate_template(&self) -> Result<()> {
        match &self.template_file {
            None => Err(Error::resource(format!(
                "{}: template resource requires a tpl option",
                self
            ))),
            Some(path) if !path.exists() => Err(Error::resource(format!(
                "{}: template file {} does not exist",
                self,
                path.display()
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Identity of the resource, used for metrics and event comparison.
    pub fn id(&self) -> &str {
        &self.path
    }

    /// The output filename, either the `file=` override or
    /// `<path>.<backend>` with the store path's leading slash stripped.
    pub fn output_filename(&self) -> PathBuf {
        match &self.filename {
            Some(name) => PathBuf::from(name),
            None => PathBuf::from(format!(
                "{}.{}",
                self.path.trim_start_matches('/'),
                self.backend
            )),
        }
    }

    /// Resolve the output path against the configured output directory.
    /// Absolute filename overrides are used verbatim.
    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        let filename = self.output_filename();
        if filename.is_absolute() {
            filename
        } else {
            output_dir.join(filename)
        }
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type: {}, path: {}", self.backend, self.path)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_bool_option(name: &str, value: &str) -> Result<bool> {
    value.parse().map_err(|_| {
        Error::resource(format!("the {} option: {} is invalid, should be a boolean", name, value))
    })
}

fn parse_duration_option(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|_| {
        Error::resource(format!(
            "the {} option: {} is invalid, should be in duration format",
            name, value
        ))
    })
}

/// File modes arrive as a 4-digit octal string; a missing leading zero is
/// inserted. Anything above 0o777 is rejected.
fn parse_file_mode(value: &str) -> Result<u32> {
    let padded = if value.starts_with('0') { value.to_string() } else { format!("0{}", value) };
    if padded.len() != 4 {
        return Err(Error::resource(
            "the file permission is invalid, should be octal 0444 or alike",
        ));
    }
    let mode = u32::from_str_radix(&padded, 8)
        .map_err(|_| Error::resource("invalid file permissions on resource"))?;
    if mode > 0o777 {
        return Err(Error::resource("invalid file permissions on resource"));
    }
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let spec = ResourceSpec::parse("secret:db/password").unwrap();
        assert_eq!(spec.backend, Backend::Secret);
        assert_eq!(spec.path, "db/password");
        assert_eq!(spec.format, OutputFormat::Yaml);
        assert_eq!(spec.file_mode, 0o664);
        assert_eq!(spec.size, 20);
    }

    #[test]
    fn test_parse_with_options() {
        let spec =
            ResourceSpec::parse("secret:db/password:fmt=json§renew=true§retries=3§jitter=30s")
                .unwrap();
        assert_eq!(spec.format, OutputFormat::Json);
        assert!(spec.renewable);
        assert_eq!(spec.max_retries, 3);
        assert_eq!(spec.max_jitter, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_revoke_options() {
        let spec = ResourceSpec::parse("aws:creds/ro:revoke=true§delay=2s").unwrap();
        assert!(spec.revoke_on_rotate);
        assert_eq!(spec.revoke_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(ResourceSpec::parse("secret").is_err());
        assert!(ResourceSpec::parse(":db/password").is_err());
        assert!(ResourceSpec::parse("secret:").is_err());
        assert!(ResourceSpec::parse("secret:a:b:c").is_err());
        assert!(ResourceSpec::parse("llama:db/password").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_options() {
        assert!(ResourceSpec::parse("secret:db:fmt=xml").is_err());
        assert!(ResourceSpec::parse("secret:db:renew=sometimes").is_err());
        assert!(ResourceSpec::parse("secret:db:update=fast").is_err());
        assert!(ResourceSpec::parse("secret:db:novalue=").is_err());
        assert!(ResourceSpec::parse("secret:db:bare").is_err());
    }

    #[test]
    fn test_create_only_for_secret_backend() {
        assert!(ResourceSpec::parse("secret:db:create=true").is_ok());
        assert!(ResourceSpec::parse("aws:creds/ro:create=true").is_err());
    }

    #[test]
    fn test_pipe_rewritten_to_comma() {
        let spec = ResourceSpec::parse("pki:pki/issue/example:alt_names=a.example.com|b.example.com")
            .unwrap();
        assert_eq!(
            spec.options.get("alt_names").map(String::as_str),
            Some("a.example.com,b.example.com")
        );
    }

    #[test]
    fn test_env_expansion_in_path() {
        std::env::set_var("SIDELOCK_TEST_ENV", "staging");
        let spec = ResourceSpec::parse("secret:apps/$SIDELOCK_TEST_ENV/db").unwrap();
        assert_eq!(spec.path, "apps/staging/db");
        std::env::remove_var("SIDELOCK_TEST_ENV");
    }

    #[test]
    fn test_file_mode_parsing() {
        let spec = ResourceSpec::parse("secret:db:mode=0600").unwrap();
        assert_eq!(spec.file_mode, 0o600);

        // leading zero is inserted for three-digit modes
        let spec = ResourceSpec::parse("secret:db:mode=600").unwrap();
        assert_eq!(spec.file_mode, 0o600);

        assert!(ResourceSpec::parse("secret:db:mode=777777").is_err());
        assert!(ResourceSpec::parse("secret:db:mode=099").is_err());
    }

    #[test]
    fn test_validate_backend_requirements() {
        assert!(ResourceSpec::parse("pki:pki/issue/example").unwrap().validate().is_err());
        assert!(ResourceSpec::parse("pki:pki/issue/example:common_name=example.com")
            .unwrap()
            .validate()
            .is_ok());

        assert!(ResourceSpec::parse("transit:transit/decrypt/mykey").unwrap().validate().is_err());
        assert!(ResourceSpec::parse("transit:transit/decrypt/mykey:ciphertext=vault,v1,abc")
            .unwrap()
            .validate()
            .is_ok());

        assert!(ResourceSpec::parse("ssh:ssh/sign/host:cert_type=host")
            .unwrap()
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_template_file_must_exist() {
        let spec = ResourceSpec::parse("secret:db:fmt=template§tpl=/nonexistent/file.tpl").unwrap();
        assert!(spec.validate().is_err());

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let descriptor = format!("secret:db:fmt=template§tpl={}", tmp.path().display());
        let spec = ResourceSpec::parse(&descriptor).unwrap();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_output_filename_defaults() {
        let spec = ResourceSpec::parse("secret:/db/pw").unwrap();
        assert_eq!(spec.output_filename(), PathBuf::from("db/pw.secret"));
        assert_eq!(
            spec.output_path(Path::new("/etc/secrets")),
            PathBuf::from("/etc/secrets/db/pw.secret")
        );

        let spec = ResourceSpec::parse("secret:/db/pw:file=/var/run/creds").unwrap();
        assert_eq!(spec.output_path(Path::new("/etc/secrets")), PathBuf::from("/var/run/creds"));
    }

    #[test]
    fn test_unknown_options_pass_through() {
        let spec = ResourceSpec::parse("pki:pki/issue/example:common_name=example.com§ttl=48h")
            .unwrap();
        assert_eq!(spec.options.get("common_name").map(String::as_str), Some("example.com"));
        assert_eq!(spec.options.get("ttl").map(String::as_str), Some("48h"));
    }
}
