//! Store data types and the redacted credential wrapper.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret as issued by the store: a lease plus the key/value payload.
#[derive(Debug, Clone, Default)]
pub struct Secret {
    /// Store-issued lease identifier; empty for static KV reads
    pub lease_id: String,
    /// Lease duration in seconds
    pub lease_duration: i64,
    /// Whether the store will accept renewals of this lease
    pub renewable: bool,
    /// The secret material
    pub data: Map<String, Value>,
}

impl Secret {
    /// Lease duration as a [`Duration`]; zero when the store reported none.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_duration.max(0) as u64)
    }
}

/// Status of the store client token, from lookup-self / renew-self.
#[derive(Debug, Clone, Copy)]
pub struct TokenStatus {
    pub ttl: Duration,
    pub renewable: bool,
}

/// A string wrapper that redacts its contents in Debug, Display and
/// serialization, and zeroes its memory on drop.
///
/// Used for the store token and anything else that must never reach a log
/// line. The actual value is only reachable through
/// [`SecretString::expose_secret`].
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Exposes the underlying secret value. Never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(SecretString(value))
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
