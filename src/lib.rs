//! # Sidelock
//!
//! Sidelock is a long-running sidecar that retrieves short-lived secrets
//! from a central secret store, writes them to the local filesystem in a
//! variety of formats, and keeps them fresh by renewing leases before they
//! expire or re-fetching when renewal is impossible. The application next
//! to it just reads files; it never learns about tokens or leases.
//!
//! ## Architecture
//!
//! ```text
//! CLI → Config → LifecycleEngine ──events──▶ OutputWriter → files on disk
//!                     │
//!              SecretStore client ◀── AuthMethod (token, approle, ...)
//! ```
//!
//! ## Core Components
//!
//! - **LifecycleEngine**: single-task select loop owning all watched
//!   resources, driving fetch → notify → renew-or-refetch → revoke
//! - **SecretStore**: trait over the store's raw API, with an HTTP client
//!   implementation and per-backend fetch dispatch
//! - **OutputWriter**: materialises payloads in the configured formats
//! - **Observability**: tracing-based logging and a Prometheus exporter

pub mod auth;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod output;
pub mod resource;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "sidelock");
    }
}
