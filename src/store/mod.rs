//! # Secret Store
//!
//! The interface to the secret-store service. [`SecretStore`] carries the
//! raw operations the lifecycle engine consumes; [`VaultHttpClient`] is the
//! HTTP implementation and [`fetch_secret`] translates a resource spec
//! into the right sequence of calls for its backend.
//!
//! The trait exists so the engine can be exercised end-to-end against an
//! in-memory stub.

pub mod fetch;
pub mod http;
pub mod password;
pub mod types;

pub use fetch::fetch_secret;
pub use http::VaultHttpClient;
pub use types::{Secret, SecretString, TokenStatus};

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::Result;

/// Raw operations against the secret store.
///
/// Implementations must be `Send + Sync`; the engine shares one instance
/// across its helper tasks by reference.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret at a logical path. `Ok(None)` means the path exists
    /// in no engine and the store returned neither data nor an error.
    async fn read(&self, path: &str) -> Result<Option<Secret>>;

    /// Write a payload to a logical path, returning the store's response
    /// secret when it produces one (PKI issuance, transit decryption).
    async fn write(&self, path: &str, payload: &Map<String, Value>) -> Result<Option<Secret>>;

    /// Fetch the literal path over plain HTTP GET and return the body.
    async fn raw_get(&self, path: &str, params: &HashMap<String, String>) -> Result<String>;

    /// Renew a lease, returning the refreshed lease metadata.
    async fn renew_lease(&self, lease_id: &str, increment: u64) -> Result<Secret>;

    /// Revoke a lease.
    async fn revoke_lease(&self, lease_id: &str) -> Result<()>;

    /// Look up the client token backing this store handle.
    async fn lookup_self(&self) -> Result<TokenStatus>;

    /// Renew the client token, returning its refreshed status.
    async fn renew_self(&self) -> Result<TokenStatus>;
}
