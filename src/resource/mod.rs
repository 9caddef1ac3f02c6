//! # Watched Resources
//!
//! Descriptions of the secrets this sidecar looks after: the immutable
//! [`ResourceSpec`] parsed from the command line and the mutable
//! [`WatchedResource`] state the engine drives through fetch and renewal.

pub mod spec;
pub mod watched;

pub use spec::{Backend, OutputFormat, ResourceSpec};
pub use watched::WatchedResource;
