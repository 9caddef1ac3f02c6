//! # Output Writer
//!
//! Consumes success events from the engine and materialises the payloads on
//! disk: one serialisation per output format, permissions applied per
//! resource, dry-run printing, and the optional post-write exec hook.

pub mod template;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine::ResourceEvent;
use crate::errors::{Error, Result};
use crate::resource::{OutputFormat, ResourceSpec};

/// Writes engine events to the filesystem.
pub struct OutputWriter {
    config: Arc<Config>,
}

impl OutputWriter {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Drain events until the engine hangs up, writing every success.
    pub async fn run(self, mut events: tokio::sync::mpsc::Receiver<ResourceEvent>) {
        while let Some(event) = events.recv().await {
            if !event.is_success() {
                continue;
            }
            if let Err(e) = self.process(&event).await {
                error!(resource = %event.resource, error = %e, "failed to write resource");
            }
        }
    }

    /// Write one success event to disk and fire the exec hook.
    pub async fn process(&self, event: &ResourceEvent) -> Result<()> {
        let spec = &event.resource;
        let data = match &event.payload {
            Some(data) => data,
            None => return Ok(()),
        };

        let path = spec.output_path(&self.config.output_dir);
        debug!(resource = %spec, path = %path.display(), format = %spec.format, "saving resource");

        let written = match spec.format {
            OutputFormat::Yaml => {
                let content = serde_yaml::to_string(data)?;
                self.write_single(&path, content.as_bytes(), spec).await?
            }
            OutputFormat::Json => {
                let content = serde_json::to_string_pretty(data)?;
                self.write_single(&path, content.as_bytes(), spec).await?
            }
            OutputFormat::Ini => {
                let content = keyed_lines(data, |k, v| format!("{} = {}\n", k, v));
                self.write_single(&path, content.as_bytes(), spec).await?
            }
            OutputFormat::Csv => {
                let content = keyed_lines(data, |k, v| format!("{},{}\n", k, v));
                self.write_single(&path, content.as_bytes(), spec).await?
            }
            OutputFormat::Env => {
                let content =
                    keyed_lines(data, |k, v| format!("{}='{}'\n", k.to_uppercase(), v));
                self.write_single(&path, content.as_bytes(), spec).await?
            }
            OutputFormat::Txt => self.write_txt(&path, data, spec).await?,
            OutputFormat::Cert => self.write_cert(&path, data, spec).await?,
            OutputFormat::CertChain => self.write_certchain(&path, data, spec).await?,
            OutputFormat::Bundle => self.write_bundle(&path, data, spec).await?,
            OutputFormat::RootCa => self.write_rootca(&path, data, spec).await?,
            OutputFormat::Credential => {
                let encoded = field_text(data, "private_key_data");
                let key = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| {
                        Error::internal(format!("failed to decode private key data: {}", e))
                    })?;
                self.write_single(&path, &key, spec).await?
            }
            OutputFormat::Aws => {
                let content = aws_credentials_file(data);
                self.write_single(&path, content.as_bytes(), spec).await?
            }
            OutputFormat::Template => {
                let template_file = spec.template_file.as_ref().ok_or_else(|| {
                    Error::resource(format!("{}: no template file configured", spec))
                })?;
                let content = template::render(template_file, data).await?;
                self.write_single(&path, content.as_bytes(), spec).await?
            }
        };

        if !written.is_empty() && !self.config.dry_run {
            self.run_exec(spec, &written).await;
        }

        Ok(())
    }

    async fn write_single(
        &self,
        path: &Path,
        content: &[u8],
        spec: &ResourceSpec,
    ) -> Result<Vec<PathBuf>> {
        self.write_file(path, content, spec.file_mode).await?;
        Ok(vec![path.to_path_buf()])
    }

    /// Plain text: a single-key payload is written as-is; multiple keys
    /// produce one file per key, suffixed with the key name.
    async fn write_txt(
        &self,
        path: &Path,
        data: &Map<String, Value>,
        spec: &ResourceSpec,
    ) -> Result<Vec<PathBuf>> {
        if data.is_empty() {
            return Err(Error::internal(format!("{}: resource has no data to write", spec)));
        }

        if data.len() == 1 {
            let value = data.values().next().map(value_text).unwrap_or_default();
            return self.write_single(path, value.as_bytes(), spec).await;
        }

        let mut written = Vec::with_capacity(data.len());
        for (key, value) in data {
            let name = PathBuf::from(format!("{}.{}", path.display(), key));
            self.write_file(&name, value_text(value).as_bytes(), spec.file_mode).await?;
            written.push(name);
        }
        Ok(written)
    }

    async fn write_cert(
        &self,
        path: &Path,
        data: &Map<String, Value>,
        spec: &ResourceSpec,
    ) -> Result<Vec<PathBuf>> {
        let files = [("certificate", "crt"), ("issuing_ca", "ca"), ("private_key", "key")];
        let mut written = Vec::new();
        for (key, suffix) in files {
            let value = match data.get(key) {
                Some(value) => value_text(value),
                None => {
                    error!(resource = %spec, element = key, "certificate element missing from resource");
                    continue;
                }
            };
            let name = PathBuf::from(format!("{}.{}", path.display(), suffix));
            self.write_file(&name, value.as_bytes(), spec.file_mode).await?;
            written.push(name);
        }
        Ok(written)
    }

    async fn write_bundle(
        &self,
        path: &Path,
        data: &Map<String, Value>,
        spec: &ResourceSpec,
    ) -> Result<Vec<PathBuf>> {
        let certificate = field_text(data, "certificate");
        let issuing_ca = field_text(data, "issuing_ca");
        let private_key = field_text(data, "private_key");

        let bundle = format!("{}\n\n{}\n\n{}", certificate, issuing_ca, private_key);
        let outputs = [
            (format!("{}-bundle.pem", path.display()), bundle),
            (format!("{}.pem", path.display()), format!("{}\n", certificate)),
            (format!("{}-ca.pem", path.display()), format!("{}\n", issuing_ca)),
            (format!("{}-key.pem", path.display()), format!("{}\n", private_key)),
        ];

        let mut written = Vec::with_capacity(outputs.len());
        for (name, content) in outputs {
            let name = PathBuf::from(name);
            self.write_file(&name, content.as_bytes(), spec.file_mode).await?;
            written.push(name);
        }
        Ok(written)
    }

    async fn write_certchain(
        &self,
        path: &Path,
        data: &Map<String, Value>,
        spec: &ResourceSpec,
    ) -> Result<Vec<PathBuf>> {
        let certificate = field_text(data, "certificate");
        let issuing_ca = field_text(data, "issuing_ca");
        let private_key = field_text(data, "private_key");

        // without a ca_chain we fall back to the issuing ca alone
        let chain = match data.get("ca_chain").and_then(Value::as_array) {
            Some(chain) => {
                chain.iter().map(value_text).collect::<Vec<_>>().join("\n")
            }
            None => issuing_ca.clone(),
        };

        let outputs = [
            (
                format!("{}-cert-chain.pem", path.display()),
                format!("{}\n\n{}", certificate, chain),
            ),
            (format!("{}.pem", path.display()), format!("{}\n", certificate)),
            (format!("{}-ca.pem", path.display()), format!("{}\n", issuing_ca)),
            (format!("{}-key.pem", path.display()), format!("{}\n", private_key)),
        ];

        let mut written = Vec::with_capacity(outputs.len());
        for (name, content) in outputs {
            let name = PathBuf::from(name);
            self.write_file(&name, content.as_bytes(), spec.file_mode).await?;
            written.push(name);
        }
        Ok(written)
    }

    async fn write_rootca(
        &self,
        path: &Path,
        data: &Map<String, Value>,
        spec: &ResourceSpec,
    ) -> Result<Vec<PathBuf>> {
        if data.len() != 1 {
            return Err(Error::internal(format!(
                "{}: rootca format is only supported for secrets with a single key",
                spec
            )));
        }

        let value = data.values().next().map(value_text).unwrap_or_default();
        let block = last_certificate_block(&value).ok_or_else(|| {
            Error::internal(format!(
                "{}: no certificate blocks in secret data, cannot write root CA",
                spec
            ))
        })?;

        self.write_single(path, block.as_bytes(), spec).await
    }

    async fn write_file(&self, path: &Path, content: &[u8], mode: u32) -> Result<()> {
        if self.config.dry_run {
            info!(path = %path.display(), "dry-run: would write file");
            println!("{}", String::from_utf8_lossy(content));
            return Ok(());
        }

        debug!(path = %path.display(), "saving the file");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }

    /// Run the per-resource exec hook with the written files appended as
    /// arguments. Failures are logged and swallowed; the write stands.
    async fn run_exec(&self, spec: &ResourceSpec, files: &[PathBuf]) {
        let Some(cmd) = &spec.exec_cmd else { return };
        let mut parts = cmd.split_whitespace();
        let Some(program) = parts.next() else { return };

        let mut command = Command::new(program);
        command.args(parts).args(files);

        debug!(resource = %spec, cmd = %cmd, "running exec hook");
        match tokio::time::timeout(self.config.exec_timeout, command.output()).await {
            Err(_) => {
                error!(resource = %spec, cmd = %cmd, timeout = ?self.config.exec_timeout,
                    "exec hook timed out");
            }
            Ok(Err(e)) => {
                error!(resource = %spec, cmd = %cmd, error = %e, "failed to run exec hook");
            }
            Ok(Ok(output)) if !output.status.success() => {
                error!(
                    resource = %spec,
                    cmd = %cmd,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "exec hook exited with an error"
                );
            }
            Ok(Ok(_)) => debug!(resource = %spec, cmd = %cmd, "exec hook finished"),
        }
    }
}

/// Render a payload value for the line-oriented formats: strings verbatim,
/// everything else as its JSON form.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_text(data: &Map<String, Value>, key: &str) -> String {
    data.get(key).map(value_text).unwrap_or_default()
}

fn keyed_lines<F: Fn(&str, &str) -> String>(data: &Map<String, Value>, line: F) -> String {
    let mut out = String::new();
    for (key, value) in data {
        out.push_str(&line(key, &value_text(value)));
    }
    out
}

/// AWS shared-credentials file under the default profile. IAM-user
/// credentials come without a security token; STS credentials carry one and
/// get both token spellings for older SDKs.
fn aws_credentials_file(data: &Map<String, Value>) -> String {
    let access_key = format!("aws_access_key_id={}", field_text(data, "access_key"));
    let secret_key = format!("aws_secret_access_key={}", field_text(data, "secret_key"));

    match data.get("security_token").filter(|v| !v.is_null()) {
        Some(token) => {
            let token = value_text(token);
            format!(
                "[default]\n{}\n{}\naws_security_token={}\naws_session_token={}\n",
                access_key, secret_key, token, token
            )
        }
        None => format!("[default]\n{}\n{}\n", access_key, secret_key),
    }
}

/// Extract the last `CERTIFICATE` block from PEM text, which for a typical
/// chain is the root.
fn last_certificate_block(pem: &str) -> Option<String> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let mut last = None;
    let mut rest = pem;
    while let Some(start) = rest.find(BEGIN) {
        let candidate = &rest[start..];
        match candidate.find(END) {
            Some(end) => {
                let block = &candidate[..end + END.len()];
                last = Some(format!("{}\n", block.trim_end()));
                rest = &candidate[end + END.len()..];
            }
            None => break,
        }
    }
    last
}
