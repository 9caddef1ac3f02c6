//! Per-backend fetch dispatch.
//!
//! Translates a [`ResourceSpec`] into the correct store operation: raw GETs
//! are wrapped into a synthetic secret, PKI/transit/SSH resources are write
//! operations, and everything else is a logical read with v2 KV unwrapping
//! and optional create-on-miss.

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::resource::{Backend, ResourceSpec};
use crate::store::password;
use crate::store::types::Secret;
use crate::store::SecretStore;

/// Lease assigned to raw resources when no update override is configured.
const RAW_DEFAULT_LEASE_SECS: i64 = 24 * 60 * 60;

/// Retrieve the secret described by `spec` from the store.
pub async fn fetch_secret<S: SecretStore + ?Sized>(store: &S, spec: &ResourceSpec) -> Result<Secret> {
    debug!(resource = %spec, "retrieving resource from store");

    match spec.backend {
        Backend::Raw => fetch_raw(store, spec).await,
        Backend::Pki | Backend::Transit => {
            let payload = options_payload(spec);
            let secret = store.write(&spec.path, &payload).await?;
            secret.ok_or_else(|| missing(spec))
        }
        Backend::Ssh => fetch_ssh(store, spec).await,
        Backend::Aws
        | Backend::Gcp
        | Backend::Secret
        | Backend::Mysql
        | Backend::Postgres
        | Backend::Database
        | Backend::Cubbyhole
        | Backend::Cassandra
        | Backend::Tpl => fetch_read(store, spec).await,
    }
}

async fn fetch_raw<S: SecretStore + ?Sized>(store: &S, spec: &ResourceSpec) -> Result<Secret> {
    let body = store.raw_get(&spec.path, &spec.options).await?;

    let mut data = Map::new();
    data.insert("content".to_string(), Value::String(body));

    let lease_duration = if spec.update_override.is_zero() {
        RAW_DEFAULT_LEASE_SECS
    } else {
        spec.update_override.as_secs() as i64
    };

    Ok(Secret { lease_id: "raw".to_string(), lease_duration, renewable: false, data })
}

async fn fetch_ssh<S: SecretStore + ?Sized>(store: &S, spec: &ResourceSpec) -> Result<Secret> {
    // validated at startup, but the file can still vanish underneath us
    let public_key_path = spec
        .options
        .get("public_key_path")
        .ok_or_else(|| Error::resource(format!("{}: missing public_key_path", spec)))?;
    let cert_type = spec
        .options
        .get("cert_type")
        .ok_or_else(|| Error::resource(format!("{}: missing cert_type", spec)))?;

    let public_key = tokio::fs::read_to_string(public_key_path).await.map_err(|e| {
        Error::resource(format!("could not read data at {}: {}", public_key_path, e))
    })?;

    let mut payload = Map::new();
    payload.insert("public_key".to_string(), Value::String(public_key));
    payload.insert("cert_type".to_string(), Value::String(cert_type.clone()));

    let secret = store.write(&spec.path, &payload).await?;
    secret.ok_or_else(|| missing(spec))
}

async fn fetch_read<S: SecretStore + ?Sized>(store: &S, spec: &ResourceSpec) -> Result<Secret> {
    let mut secret = store.read(&spec.path).await?;

    // generate the secret ourselves when asked to and the path is empty
    if secret.is_none() && spec.backend == Backend::Secret && spec.create_if_missing {
        info!(resource = %spec, "resource not found, creating it");
        let mut payload = options_payload(spec);
        let generated = password::generate(spec.size.max(1) as usize);
        payload.insert("value".to_string(), Value::String(generated));
        store.write(&spec.path, &payload).await?;
        // read back so the data reflects what the store holds
        secret = store.read(&spec.path).await?;
    }

    let mut secret = secret.ok_or_else(|| missing(spec))?;

    // a top-level metadata key means the response came from a v2 kv store
    if secret.data.contains_key("metadata") {
        secret.data = match secret.data.remove("data") {
            Some(Value::Object(inner)) => inner,
            _ => {
                return Err(Error::store(format!(
                    "{}: malformed versioned response, data key is not an object",
                    spec
                )))
            }
        };
    }

    Ok(secret)
}

fn options_payload(spec: &ResourceSpec) -> Map<String, Value> {
    spec.options
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

fn missing(spec: &ResourceSpec) -> Error {
    Error::store(format!("{}: the resource does not exist", spec))
}
