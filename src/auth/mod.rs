//! # Store Authentication
//!
//! Produces the bearer credential the store client runs with. The set of
//! methods is closed: [`AuthMethod`] is a plain enum and [`authenticate`]
//! is a pure dispatch over it, so no runtime polymorphism is involved.
//! Cloud-instance methods talk to their local metadata services; everything
//! else posts to the store's own login endpoints.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use crate::config::{AuthFileFormat, AuthOptions};
use crate::errors::{Error, Result};
use crate::store::{SecretString, VaultHttpClient};

const AWS_IDENTITY_URL: &str = "http://169.254.169.254/latest/dynamic/instance-identity/pkcs7";
const GCP_IDENTITY_URL: &str =
    "http://metadata/computeMetadata/v1/instance/service-accounts/default/identity";
const DEFAULT_K8S_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// The supported authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    UserPass,
    AppRole,
    AwsEc2,
    AwsIam,
    GcpGce,
    Kubernetes,
    IbmCloud,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::UserPass => "userpass",
            Self::AppRole => "approle",
            Self::AwsEc2 => "aws-ec2",
            Self::AwsIam => "aws-iam",
            Self::GcpGce => "gcp-gce",
            Self::Kubernetes => "kubernetes",
            Self::IbmCloud => "ibmcloud",
        }
    }

    /// Resolve the method named by the auth options; an unset method means
    /// plain token authentication.
    pub fn from_options(options: &AuthOptions) -> Result<Self> {
        if options.method.is_empty() {
            return Ok(Self::Token);
        }
        options.method.parse()
    }
}

impl FromStr for AuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token" => Ok(Self::Token),
            "userpass" => Ok(Self::UserPass),
            "approle" => Ok(Self::AppRole),
            "aws-ec2" => Ok(Self::AwsEc2),
            "aws-iam" => Ok(Self::AwsIam),
            "gcp-gce" => Ok(Self::GcpGce),
            "kubernetes" => Ok(Self::Kubernetes),
            "ibmcloud" => Ok(Self::IbmCloud),
            other => Err(Error::config(format!("unsupported authentication method: {}", other))),
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Produce a client token for the store using the configured method.
pub async fn authenticate(client: &VaultHttpClient, options: &AuthOptions) -> Result<SecretString> {
    let method = AuthMethod::from_options(options)?;
    info!(method = %method, "authenticating against the secret store");

    match method {
        AuthMethod::Token => token_auth(options),
        AuthMethod::UserPass => userpass_auth(client, options).await,
        AuthMethod::AppRole => approle_auth(client, options).await,
        AuthMethod::AwsEc2 => aws_ec2_auth(client, options).await,
        AuthMethod::AwsIam => Err(Error::config(
            "aws-iam authentication requires SigV4 request signing and is not supported",
        )),
        AuthMethod::GcpGce => gcp_gce_auth(client, options).await,
        AuthMethod::Kubernetes => kubernetes_auth(client).await,
        AuthMethod::IbmCloud => ibmcloud_auth(client).await,
    }
}

fn token_auth(options: &AuthOptions) -> Result<SecretString> {
    if let Some(token) = &options.token {
        if !token.is_empty() {
            return Ok(token.clone());
        }
    }

    if let Some(filename) = &options.filename {
        let format = match &options.file_format {
            Some(format) => format.parse()?,
            None => AuthFileFormat::Default,
        };
        let from_file = AuthOptions::from_file(filename, format)?;
        return from_file.token.filter(|t| !t.is_empty()).ok_or_else(|| {
            Error::auth(format!("the auth file {} does not contain a token", filename.display()))
        });
    }

    if let Some(token) = env_value("VAULT_TOKEN") {
        return Ok(SecretString::new(token));
    }

    Err(Error::auth("no token provided"))
}

async fn userpass_auth(client: &VaultHttpClient, options: &AuthOptions) -> Result<SecretString> {
    let username = options
        .username
        .clone()
        .or_else(|| env_value("VAULT_SIDEKICK_USERNAME"))
        .ok_or_else(|| Error::auth("userpass authentication requires a username"))?;
    let password = options
        .password
        .clone()
        .or_else(|| env_value("VAULT_SIDEKICK_PASSWORD").map(SecretString::new))
        .ok_or_else(|| Error::auth("userpass authentication requires a password"))?;

    let login_path = format!("/v1/auth/userpass/login/{}", username);
    client.login(&login_path, &json!({ "password": password.expose_secret() })).await
}

async fn approle_auth(client: &VaultHttpClient, options: &AuthOptions) -> Result<SecretString> {
    let role_id = options
        .role_id
        .clone()
        .or_else(|| env_value("VAULT_SIDEKICK_ROLE_ID"))
        .ok_or_else(|| Error::auth("approle authentication requires a role_id"))?;
    let secret_id = options
        .secret_id
        .clone()
        .or_else(|| env_value("VAULT_SIDEKICK_SECRET_ID").map(SecretString::new))
        .ok_or_else(|| Error::auth("approle authentication requires a secret_id"))?;

    let login_path = env_value("VAULT_APPROLE_LOGIN_PATH")
        .unwrap_or_else(|| "/v1/auth/approle/login".to_string());
    client
        .login(
            &login_path,
            &json!({ "role_id": role_id, "secret_id": secret_id.expose_secret() }),
        )
        .await
}

async fn aws_ec2_auth(client: &VaultHttpClient, options: &AuthOptions) -> Result<SecretString> {
    let role = options
        .role_id
        .clone()
        .or_else(|| env_value("VAULT_SIDEKICK_ROLE_ID"))
        .ok_or_else(|| Error::auth("aws-ec2 authentication requires a role"))?;

    let identity = metadata_get(AWS_IDENTITY_URL, &[]).await?;
    let pkcs7 = identity.replace('\n', "");

    let mut payload = json!({ "role": role, "pkcs7": pkcs7 });
    if let Some(nonce_file) = env_value("VAULT_SIDEKICK_NONCE_FILE") {
        let nonce = tokio::fs::read_to_string(&nonce_file)
            .await
            .map_err(|e| Error::auth(format!("unable to read nonce file {}: {}", nonce_file, e)))?;
        if !nonce.is_empty() {
            payload["nonce"] = json!(nonce);
        }
    }

    client.login("/v1/auth/aws/login", &payload).await
}

async fn gcp_gce_auth(client: &VaultHttpClient, options: &AuthOptions) -> Result<SecretString> {
    let role = options
        .role_id
        .clone()
        .or_else(|| env_value("VAULT_SIDEKICK_ROLE_ID"))
        .ok_or_else(|| Error::auth("gcp-gce authentication requires a role"))?;

    let url = format!("{}?audience=vault/{}&format=full", GCP_IDENTITY_URL, role);
    let jwt = metadata_get(&url, &[("Metadata-Flavor", "Google")]).await?;

    client.login("/v1/auth/gcp/login", &json!({ "role": role, "jwt": jwt })).await
}

async fn kubernetes_auth(client: &VaultHttpClient) -> Result<SecretString> {
    let role = env_value("VAULT_SIDEKICK_ROLE")
        .ok_or_else(|| Error::auth("VAULT_SIDEKICK_ROLE not provided"))?;

    let login_path = kubernetes_login_path(
        &env_value("VAULT_K8S_LOGIN_PATH")
            .unwrap_or_else(|| "/v1/auth/kubernetes/login".to_string()),
    );
    let token_path =
        env_value("VAULT_K8S_TOKEN_PATH").unwrap_or_else(|| DEFAULT_K8S_TOKEN_PATH.to_string());

    let jwt = tokio::fs::read_to_string(&token_path)
        .await
        .map_err(|e| Error::auth(format!("unable to read token file {}: {}", token_path, e)))?;

    debug!(role = %role, login_path = %login_path, "requesting a store token for role");
    client.login(&login_path, &json!({ "role": role, "jwt": jwt })).await
}

async fn ibmcloud_auth(client: &VaultHttpClient) -> Result<SecretString> {
    let iam_token =
        env_value("IAM_TOKEN").ok_or_else(|| Error::auth("missing IAM token in IAM_TOKEN"))?;

    client.login("/v1/auth/ibmcloud/login", &json!({ "token": iam_token })).await
}

/// The login path is used with exactly one trailing `login` segment,
/// whether or not the configured value already carries one.
fn kubernetes_login_path(configured: &str) -> String {
    let trimmed = configured.trim_end_matches('/');
    if trimmed.ends_with("/login") {
        trimmed.to_string()
    } else {
        format!("{}/login", trimmed)
    }
}

async fn metadata_get(url: &str, headers: &[(&str, &str)]) -> Result<String> {
    let client = reqwest::Client::builder().timeout(METADATA_TIMEOUT).build()?;
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(Error::auth(format!(
            "metadata service at {} answered with status {}",
            url,
            response.status()
        )));
    }
    Ok(response.text().await?)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        for (name, method) in [
            ("token", AuthMethod::Token),
            ("userpass", AuthMethod::UserPass),
            ("approle", AuthMethod::AppRole),
            ("aws-ec2", AuthMethod::AwsEc2),
            ("aws-iam", AuthMethod::AwsIam),
            ("gcp-gce", AuthMethod::GcpGce),
            ("kubernetes", AuthMethod::Kubernetes),
            ("ibmcloud", AuthMethod::IbmCloud),
        ] {
            assert_eq!(name.parse::<AuthMethod>().unwrap(), method);
            assert_eq!(method.as_str(), name);
        }
        assert!("ldap".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn test_empty_method_means_token() {
        let options = AuthOptions::default();
        assert_eq!(AuthMethod::from_options(&options).unwrap(), AuthMethod::Token);
    }

    #[test]
    fn test_kubernetes_login_path_is_not_doubled() {
        assert_eq!(kubernetes_login_path("/v1/auth/kubernetes"), "/v1/auth/kubernetes/login");
        assert_eq!(
            kubernetes_login_path("/v1/auth/kubernetes/login"),
            "/v1/auth/kubernetes/login"
        );
        assert_eq!(kubernetes_login_path("/v1/auth/k8s-prod/"), "/v1/auth/k8s-prod/login");
    }

    #[test]
    fn test_token_auth_prefers_explicit_token() {
        let options = AuthOptions {
            token: Some(SecretString::new("hvs.explicit")),
            ..AuthOptions::default()
        };
        let token = token_auth(&options).unwrap();
        assert_eq!(token.expose_secret(), "hvs.explicit");
    }

    #[test]
    fn test_token_auth_reads_from_file() {
        use std::io::Write;
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"token": "hvs.from-file"}}"#).unwrap();

        let options = AuthOptions {
            filename: Some(file.path().to_path_buf()),
            ..AuthOptions::default()
        };
        let token = token_auth(&options).unwrap();
        assert_eq!(token.expose_secret(), "hvs.from-file");
    }
}
