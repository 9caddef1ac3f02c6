//! HTTP implementation of the secret-store client.
//!
//! A thin wrapper over the store's REST API: logical reads and writes under
//! `/v1/`, lease renewal and revocation through `sys/leases`, and token
//! self-maintenance. The wrapper deliberately stays close to the wire so the
//! engine gets the raw lease metadata (`lease_id`, `lease_duration`,
//! `renewable`) of every response.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::store::types::{Secret, SecretString, TokenStatus};
use crate::store::SecretStore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the secret store.
pub struct VaultHttpClient {
    http: reqwest::Client,
    address: String,
    token: SecretString,
}

impl VaultHttpClient {
    /// Build a client from the process configuration. The token is set
    /// separately once authentication has produced one.
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        if config.tls_skip_verify {
            warn!("skipping TLS verification is not recommended");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(ca_file) = &config.ca_cert {
            debug!(ca_file = %ca_file.display(), "loading ca certificate");
            let pem = std::fs::read(ca_file).map_err(|e| {
                Error::config(format!("unable to read ca certificate {}: {}", ca_file.display(), e))
            })?;
            let certificate = Certificate::from_pem(&pem).map_err(|e| {
                Error::config(format!("invalid ca certificate {}: {}", ca_file.display(), e))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let http = builder.build()?;

        Ok(Self {
            http,
            address: config.vault_url.trim_end_matches('/').to_string(),
            token: SecretString::default(),
        })
    }

    /// Install the bearer credential used on every subsequent request.
    pub fn set_token(&mut self, token: SecretString) {
        self.token = token;
    }

    /// Authenticate against a login endpoint (full `/v1/...` path) and
    /// return the issued client token.
    pub async fn login(&self, login_path: &str, payload: &Value) -> Result<SecretString> {
        let url = format!("{}{}", self.address, login_path);
        let response = self.http.post(&url).json(payload).send().await?;
        let secret = self.parse_secret(response).await?.ok_or_else(|| {
            Error::auth(format!("login to {} returned an empty response", login_path))
        })?;
        match secret.auth {
            Some(auth) => Ok(SecretString::new(auth.client_token)),
            None => Err(Error::auth(format!("login to {} returned no client token", login_path))),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if !self.token.is_empty() {
            builder = builder.header("X-Vault-Token", self.token.expose_secret());
        }
        builder
    }

    /// Turn a non-success response into a store error carrying the body, so
    /// the fatal "missing client token" class survives classification.
    async fn status_error(response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Error::store(format!("status {}: {}", status.as_u16(), body.trim()))
    }

    async fn parse_secret(&self, response: reqwest::Response) -> Result<Option<ApiSecret>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let secret: ApiSecret = serde_json::from_str(&body)?;
        Ok(Some(secret))
    }
}

#[async_trait]
impl SecretStore for VaultHttpClient {
    async fn read(&self, path: &str) -> Result<Option<Secret>> {
        let url = self.api_url(path);
        debug!(path = %path, "reading secret");
        let response = self.request(Method::GET, &url).send().await?;
        Ok(self.parse_secret(response).await?.map(ApiSecret::into_secret))
    }

    async fn write(&self, path: &str, payload: &Map<String, Value>) -> Result<Option<Secret>> {
        let url = self.api_url(path);
        debug!(path = %path, "writing secret");
        let response = self.request(Method::PUT, &url).json(payload).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Self::status_error(response).await);
        }
        Ok(self.parse_secret(response).await?.map(ApiSecret::into_secret))
    }

    async fn raw_get(&self, path: &str, params: &HashMap<String, String>) -> Result<String> {
        let url = self.api_url(path);
        let response = self.request(Method::GET, &url).query(params).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response.text().await?)
    }

    async fn renew_lease(&self, lease_id: &str, increment: u64) -> Result<Secret> {
        let url = self.api_url("sys/leases/renew");
        let payload = json!({ "lease_id": lease_id, "increment": increment });
        let response = self.request(Method::PUT, &url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let secret: ApiSecret = response.json().await?;
        Ok(secret.into_secret())
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<()> {
        let url = self.api_url("sys/leases/revoke");
        let payload = json!({ "lease_id": lease_id });
        let response = self.request(Method::PUT, &url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(())
    }

    async fn lookup_self(&self) -> Result<TokenStatus> {
        let url = self.api_url("auth/token/lookup-self");
        let response = self.request(Method::GET, &url).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let lookup: TokenLookup = response.json().await?;
        Ok(TokenStatus {
            ttl: Duration::from_secs(lookup.data.ttl.max(0) as u64),
            renewable: lookup.data.renewable,
        })
    }

    async fn renew_self(&self) -> Result<TokenStatus> {
        let url = self.api_url("auth/token/renew-self");
        let payload = json!({ "increment": 0 });
        let response = self.request(Method::POST, &url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let secret: ApiSecret = response.json().await?;
        match secret.auth {
            Some(auth) => Ok(TokenStatus {
                ttl: Duration::from_secs(auth.lease_duration.max(0) as u64),
                renewable: auth.renewable,
            }),
            None => Err(Error::store("renew-self returned no auth block")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiSecret {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    lease_duration: i64,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    auth: Option<ApiAuth>,
}

#[derive(Debug, Deserialize)]
struct ApiAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: i64,
    #[serde(default)]
    renewable: bool,
}

impl ApiSecret {
    fn into_secret(self) -> Secret {
        Secret {
            lease_id: self.lease_id,
            lease_duration: self.lease_duration,
            renewable: self.renewable,
            data: self.data.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenLookup {
    data: TokenData,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    #[serde(default)]
    ttl: i64,
    #[serde(default)]
    renewable: bool,
}
